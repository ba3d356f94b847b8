//! In-memory StrandStore for tests and single-process embedding.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::kernel::error::KernelError;
use crate::kernel::identity::StrandId;
use crate::kernel::store::{
    apply_parent_update, apply_update, check_fence, clear_lease, wake_for_signal, StrandCommit,
    StrandStore,
};
use crate::kernel::strand::{LeaseToken, NewStrand, Strand};

#[derive(Default)]
struct MemoryState {
    strands: HashMap<StrandId, Strand>,
    semaphores: HashMap<StrandId, BTreeSet<String>>,
}

impl MemoryState {
    fn set_semaphore(&mut self, id: StrandId, name: &str, now: DateTime<Utc>) -> bool {
        let Some(strand) = self.strands.get_mut(&id) else {
            return false;
        };
        wake_for_signal(strand, now);
        self.semaphores
            .entry(id)
            .or_default()
            .insert(name.to_string());
        true
    }

    fn remove(&mut self, id: StrandId) {
        self.strands.remove(&id);
        self.semaphores.remove(&id);
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStrandStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStrandStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>, KernelError> {
        self.state
            .write()
            .map_err(|_| KernelError::Store("in-memory strand store lock poisoned".into()))
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> T) -> Result<T, KernelError> {
        let state = self
            .state
            .read()
            .map_err(|_| KernelError::Store("in-memory strand store lock poisoned".into()))?;
        Ok(f(&state))
    }

    /// Every strand currently stored, for assertions.
    pub fn all(&self) -> Result<Vec<Strand>, KernelError> {
        self.read(|s| s.strands.values().cloned().collect())
    }
}

impl StrandStore for InMemoryStrandStore {
    fn create(&self, strand: NewStrand, now: DateTime<Utc>) -> Result<Strand, KernelError> {
        let mut state = self.write()?;
        if state.strands.contains_key(&strand.id) {
            return Err(KernelError::StrandExists(strand.id));
        }
        let strand = Strand::from_new(strand, now);
        state.strands.insert(strand.id, strand.clone());
        Ok(strand)
    }

    fn load(&self, id: StrandId) -> Result<Option<Strand>, KernelError> {
        self.read(|s| s.strands.get(&id).cloned())
    }

    fn list_runnable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        skip: &HashSet<StrandId>,
    ) -> Result<Vec<Strand>, KernelError> {
        self.read(|s| {
            let mut runnable: Vec<Strand> = s
                .strands
                .values()
                .filter(|strand| strand.is_runnable(now) && !skip.contains(&strand.id))
                .cloned()
                .collect();
            runnable.sort_by_key(|strand| (strand.schedule, strand.created_at));
            runnable.truncate(limit);
            runnable
        })
    }

    fn try_lease(
        &self,
        id: StrandId,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LeaseToken>, KernelError> {
        let mut state = self.write()?;
        let Some(strand) = state.strands.get_mut(&id) else {
            return Ok(None);
        };
        if !strand.is_runnable(now) {
            return Ok(None);
        }
        strand.lease = Some(expires_at);
        strand.lease_owner = Some(owner.to_string());
        strand.lease_version += 1;
        Ok(Some(LeaseToken {
            strand_id: id,
            owner: owner.to_string(),
            version: strand.lease_version,
            expires_at,
            signal_version: strand.signal_version,
        }))
    }

    fn commit(
        &self,
        lease: &LeaseToken,
        commit: &StrandCommit,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        let mut state = self.write()?;
        let mut strand = state
            .strands
            .get(&lease.strand_id)
            .cloned()
            .ok_or(KernelError::StrandNotFound(lease.strand_id))?;
        check_fence(&strand, lease)?;

        // Stage the parent first so a failure leaves the state untouched.
        let parent = match &commit.parent_update {
            Some(update) => match state.strands.get(&update.parent_id) {
                Some(parent) => {
                    let mut parent = parent.clone();
                    apply_parent_update(&mut parent, update, now)?;
                    Some(parent)
                }
                None => None,
            },
            None => None,
        };
        for new in &commit.created {
            if state.strands.contains_key(&new.id) {
                return Err(KernelError::StrandExists(new.id));
            }
        }

        if let Some(names) = state.semaphores.get_mut(&lease.strand_id) {
            for name in &commit.semaphores_consumed {
                names.remove(name);
            }
        }
        if apply_update(&mut strand, lease, commit, now) {
            let terminated = strand.is_terminated();
            state.strands.insert(strand.id, strand);
            if terminated {
                state.semaphores.remove(&lease.strand_id);
            }
        } else {
            state.remove(lease.strand_id);
        }
        for new in &commit.created {
            state
                .strands
                .insert(new.id, Strand::from_new(new.clone(), now));
        }
        if let Some(parent) = parent {
            state.strands.insert(parent.id, parent);
        }
        for (target, name) in &commit.semaphores_set {
            state.set_semaphore(*target, name, now);
        }
        Ok(())
    }

    fn release(
        &self,
        lease: &LeaseToken,
        try_count: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        let mut state = self.write()?;
        let strand = state
            .strands
            .get_mut(&lease.strand_id)
            .ok_or(KernelError::StrandNotFound(lease.strand_id))?;
        check_fence(strand, lease)?;
        clear_lease(strand);
        strand.try_count = try_count;
        strand.schedule = retry_at;
        Ok(())
    }

    fn mark_failed(&self, lease: &LeaseToken, fault: &str) -> Result<(), KernelError> {
        let mut state = self.write()?;
        let strand = state
            .strands
            .get_mut(&lease.strand_id)
            .ok_or(KernelError::StrandNotFound(lease.strand_id))?;
        check_fence(strand, lease)?;
        clear_lease(strand);
        strand.fault = Some(fault.to_string());
        Ok(())
    }

    fn children(&self, id: StrandId) -> Result<Vec<StrandId>, KernelError> {
        self.read(|s| {
            s.strands
                .values()
                .filter(|strand| strand.parent_id == Some(id))
                .map(|strand| strand.id)
                .collect()
        })
    }

    fn set_semaphore(
        &self,
        id: StrandId,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), KernelError> {
        let mut state = self.write()?;
        if state.set_semaphore(id, name, now) {
            Ok(())
        } else {
            Err(KernelError::StrandNotFound(id))
        }
    }

    fn semaphores(&self, id: StrandId) -> Result<Vec<String>, KernelError> {
        self.read(|s| {
            s.semaphores
                .get(&id)
                .map(|names| names.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    fn consume_semaphore(&self, id: StrandId, name: &str) -> Result<bool, KernelError> {
        let mut state = self.write()?;
        Ok(state
            .semaphores
            .get_mut(&id)
            .is_some_and(|names| names.remove(name)))
    }
}

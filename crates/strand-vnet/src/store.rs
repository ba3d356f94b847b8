//! VnetStore: persistence contract for subnets, NICs and tunnels.
//!
//! Methods that the rekey protocol relies on for mutual exclusion
//! ([VnetStore::lock_nics], [VnetStore::finish_rekey]) are atomic: either
//! every NIC changes or none does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::error::VnetError;
use crate::model::{
    IpsecTunnel, KeyMaterial, Nic, NicId, NicState, NicTunnels, PrivateSubnet, RekeyPhase,
    SubnetId, SubnetState, VmPlacement,
};

pub trait VnetStore: Send + Sync {
    fn create_subnet(&self, subnet: &PrivateSubnet) -> Result<(), VnetError>;

    fn subnet(&self, id: SubnetId) -> Result<Option<PrivateSubnet>, VnetError>;

    fn get_subnet(&self, id: SubnetId) -> Result<PrivateSubnet, VnetError> {
        self.subnet(id)?.ok_or(VnetError::SubnetNotFound(id))
    }

    fn set_subnet_state(&self, id: SubnetId, state: SubnetState) -> Result<(), VnetError>;

    /// Removes the subnet and its connections. NICs must be gone already.
    fn delete_subnet(&self, id: SubnetId) -> Result<(), VnetError>;

    /// Connects two subnets; the edge is symmetric.
    fn connect(&self, a: SubnetId, b: SubnetId) -> Result<(), VnetError>;

    fn disconnect(&self, a: SubnetId, b: SubnetId) -> Result<(), VnetError>;

    /// Directly connected subnets, ordered by id.
    fn connected(&self, id: SubnetId) -> Result<Vec<SubnetId>, VnetError>;

    fn create_nic(&self, nic: &Nic) -> Result<(), VnetError>;

    fn nic(&self, id: NicId) -> Result<Option<Nic>, VnetError>;

    fn get_nic(&self, id: NicId) -> Result<Nic, VnetError> {
        self.nic(id)?.ok_or(VnetError::NicNotFound(id))
    }

    /// NICs of one subnet, ordered by id.
    fn nics_in(&self, subnet_id: SubnetId) -> Result<Vec<Nic>, VnetError>;

    fn set_nic_state(&self, id: NicId, state: NicState) -> Result<(), VnetError>;

    fn attach_vm(&self, id: NicId, vm: VmPlacement) -> Result<(), VnetError>;

    fn detach_vm(&self, id: NicId) -> Result<(), VnetError>;

    /// Deletes the NIC with its tunnels, dropping any rekey lock it carried.
    fn delete_nic(&self, id: NicId) -> Result<Option<Nic>, VnetError>;

    /// Locks every NIC for `coordinator`, or none of them when one is
    /// missing or already locked.
    fn lock_nics(&self, ids: &[NicId], coordinator: SubnetId) -> Result<bool, VnetError>;

    fn nics_locked_by(&self, coordinator: SubnetId) -> Result<Vec<Nic>, VnetError>;

    fn set_pending_key(&self, id: NicId, key: KeyMaterial) -> Result<(), VnetError>;

    fn set_rekey_phase(&self, id: NicId, phase: RekeyPhase) -> Result<(), VnetError>;

    /// Ends a rotation: promotes pending keys, resets phases, releases the
    /// locks, stamps `last_rekey_at` on every involved subnet and puts the
    /// coordinator back to waiting. Returns the released NICs.
    fn finish_rekey(
        &self,
        coordinator: SubnetId,
        now: DateTime<Utc>,
    ) -> Result<Vec<NicId>, VnetError>;

    /// Creates the directed tunnels between every pair of `ids` that do not
    /// exist yet.
    fn create_tunnels(&self, ids: &[NicId]) -> Result<usize, VnetError>;

    fn nic_tunnels(&self, id: NicId) -> Result<NicTunnels, VnetError>;
}

#[derive(Default)]
struct VnetState {
    subnets: BTreeMap<SubnetId, PrivateSubnet>,
    edges: BTreeSet<(SubnetId, SubnetId)>,
    nics: BTreeMap<NicId, Nic>,
    tunnels: BTreeSet<IpsecTunnel>,
}

impl VnetState {
    fn nic_mut(&mut self, id: NicId) -> Result<&mut Nic, VnetError> {
        self.nics.get_mut(&id).ok_or(VnetError::NicNotFound(id))
    }

    fn subnet_mut(&mut self, id: SubnetId) -> Result<&mut PrivateSubnet, VnetError> {
        self.subnets
            .get_mut(&id)
            .ok_or(VnetError::SubnetNotFound(id))
    }
}

fn edge(a: SubnetId, b: SubnetId) -> (SubnetId, SubnetId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// In-memory VnetStore for tests and the demo.
#[derive(Clone, Default)]
pub struct InMemoryVnetStore {
    state: Arc<RwLock<VnetState>>,
}

impl InMemoryVnetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, VnetState>, VnetError> {
        self.state
            .write()
            .map_err(|_| VnetError::Store("in-memory vnet store lock poisoned".into()))
    }

    fn read<T>(&self, f: impl FnOnce(&VnetState) -> T) -> Result<T, VnetError> {
        let state = self
            .state
            .read()
            .map_err(|_| VnetError::Store("in-memory vnet store lock poisoned".into()))?;
        Ok(f(&state))
    }

    pub fn all_nics(&self) -> Result<Vec<Nic>, VnetError> {
        self.read(|s| s.nics.values().cloned().collect())
    }

    pub fn tunnels(&self) -> Result<Vec<IpsecTunnel>, VnetError> {
        self.read(|s| s.tunnels.iter().copied().collect())
    }
}

impl VnetStore for InMemoryVnetStore {
    fn create_subnet(&self, subnet: &PrivateSubnet) -> Result<(), VnetError> {
        let mut state = self.write()?;
        if state.subnets.contains_key(&subnet.id) {
            return Err(VnetError::Store(format!(
                "private subnet {} already exists",
                subnet.id
            )));
        }
        state.subnets.insert(subnet.id, subnet.clone());
        Ok(())
    }

    fn subnet(&self, id: SubnetId) -> Result<Option<PrivateSubnet>, VnetError> {
        self.read(|s| s.subnets.get(&id).cloned())
    }

    fn set_subnet_state(&self, id: SubnetId, subnet_state: SubnetState) -> Result<(), VnetError> {
        self.write()?.subnet_mut(id)?.state = subnet_state;
        Ok(())
    }

    fn delete_subnet(&self, id: SubnetId) -> Result<(), VnetError> {
        let mut state = self.write()?;
        if state.nics.values().any(|nic| nic.subnet_id == id) {
            return Err(VnetError::Store(format!(
                "private subnet {id} still has nics"
            )));
        }
        state.subnets.remove(&id);
        state.edges.retain(|(a, b)| *a != id && *b != id);
        Ok(())
    }

    fn connect(&self, a: SubnetId, b: SubnetId) -> Result<(), VnetError> {
        let mut state = self.write()?;
        for id in [a, b] {
            if !state.subnets.contains_key(&id) {
                return Err(VnetError::SubnetNotFound(id));
            }
        }
        if a != b {
            state.edges.insert(edge(a, b));
        }
        Ok(())
    }

    fn disconnect(&self, a: SubnetId, b: SubnetId) -> Result<(), VnetError> {
        self.write()?.edges.remove(&edge(a, b));
        Ok(())
    }

    fn connected(&self, id: SubnetId) -> Result<Vec<SubnetId>, VnetError> {
        self.read(|s| {
            let peers: BTreeSet<SubnetId> = s
                .edges
                .iter()
                .filter_map(|(a, b)| match (*a == id, *b == id) {
                    (true, _) => Some(*b),
                    (_, true) => Some(*a),
                    _ => None,
                })
                .collect();
            peers.into_iter().collect()
        })
    }

    fn create_nic(&self, nic: &Nic) -> Result<(), VnetError> {
        let mut state = self.write()?;
        if !state.subnets.contains_key(&nic.subnet_id) {
            return Err(VnetError::SubnetNotFound(nic.subnet_id));
        }
        if state.nics.contains_key(&nic.id) {
            return Err(VnetError::Store(format!("nic {} already exists", nic.id)));
        }
        state.nics.insert(nic.id, nic.clone());
        Ok(())
    }

    fn nic(&self, id: NicId) -> Result<Option<Nic>, VnetError> {
        self.read(|s| s.nics.get(&id).cloned())
    }

    fn nics_in(&self, subnet_id: SubnetId) -> Result<Vec<Nic>, VnetError> {
        self.read(|s| {
            s.nics
                .values()
                .filter(|nic| nic.subnet_id == subnet_id)
                .cloned()
                .collect()
        })
    }

    fn set_nic_state(&self, id: NicId, nic_state: NicState) -> Result<(), VnetError> {
        self.write()?.nic_mut(id)?.state = nic_state;
        Ok(())
    }

    fn attach_vm(&self, id: NicId, vm: VmPlacement) -> Result<(), VnetError> {
        self.write()?.nic_mut(id)?.vm = Some(vm);
        Ok(())
    }

    fn detach_vm(&self, id: NicId) -> Result<(), VnetError> {
        self.write()?.nic_mut(id)?.vm = None;
        Ok(())
    }

    fn delete_nic(&self, id: NicId) -> Result<Option<Nic>, VnetError> {
        let mut state = self.write()?;
        let removed = state.nics.remove(&id);
        state
            .tunnels
            .retain(|t| t.src_nic_id != id && t.dst_nic_id != id);
        Ok(removed)
    }

    fn lock_nics(&self, ids: &[NicId], coordinator: SubnetId) -> Result<bool, VnetError> {
        let mut state = self.write()?;
        let free = ids.iter().all(|id| {
            state
                .nics
                .get(id)
                .is_some_and(|nic| nic.rekey_coordinator_id.is_none())
        });
        if !free {
            return Ok(false);
        }
        for id in ids {
            state.nic_mut(*id)?.rekey_coordinator_id = Some(coordinator);
        }
        Ok(true)
    }

    fn nics_locked_by(&self, coordinator: SubnetId) -> Result<Vec<Nic>, VnetError> {
        self.read(|s| {
            s.nics
                .values()
                .filter(|nic| nic.rekey_coordinator_id == Some(coordinator))
                .cloned()
                .collect()
        })
    }

    fn set_pending_key(&self, id: NicId, key: KeyMaterial) -> Result<(), VnetError> {
        self.write()?.nic_mut(id)?.pending_key = Some(key);
        Ok(())
    }

    fn set_rekey_phase(&self, id: NicId, phase: RekeyPhase) -> Result<(), VnetError> {
        self.write()?.nic_mut(id)?.rekey_phase = phase;
        Ok(())
    }

    fn finish_rekey(
        &self,
        coordinator: SubnetId,
        now: DateTime<Utc>,
    ) -> Result<Vec<NicId>, VnetError> {
        let mut state = self.write()?;
        let mut released = Vec::new();
        let mut involved = BTreeSet::from([coordinator]);
        for nic in state.nics.values_mut() {
            if nic.rekey_coordinator_id != Some(coordinator) {
                continue;
            }
            if let Some(key) = nic.pending_key.take() {
                nic.active_key = Some(key);
            }
            nic.rekey_phase = RekeyPhase::Idle;
            nic.rekey_coordinator_id = None;
            involved.insert(nic.subnet_id);
            released.push(nic.id);
        }
        for id in involved {
            if let Some(subnet) = state.subnets.get_mut(&id) {
                subnet.last_rekey_at = now;
                if id == coordinator {
                    subnet.state = SubnetState::Waiting;
                }
            }
        }
        Ok(released)
    }

    fn create_tunnels(&self, ids: &[NicId]) -> Result<usize, VnetError> {
        let mut state = self.write()?;
        let mut created = 0;
        for src in ids {
            for dst in ids {
                if src == dst || !state.nics.contains_key(src) || !state.nics.contains_key(dst) {
                    continue;
                }
                if state.tunnels.insert(IpsecTunnel {
                    src_nic_id: *src,
                    dst_nic_id: *dst,
                }) {
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    fn nic_tunnels(&self, id: NicId) -> Result<NicTunnels, VnetError> {
        self.read(|s| {
            let nic = s.nics.get(&id).cloned().ok_or(VnetError::NicNotFound(id))?;
            let peer = |peer_id: &NicId| s.nics.get(peer_id).cloned();
            let inbound = s
                .tunnels
                .iter()
                .filter(|t| t.dst_nic_id == id)
                .filter_map(|t| peer(&t.src_nic_id))
                .collect();
            let outbound = s
                .tunnels
                .iter()
                .filter(|t| t.src_nic_id == id)
                .filter_map(|t| peer(&t.dst_nic_id))
                .collect();
            Ok(NicTunnels {
                nic,
                inbound,
                outbound,
            })
        })?
    }
}

//! `Vnet::SubnetNexus`: private subnet lifecycle and rekey coordination.
//!
//! The connected leader locks every NIC of its component, hands out fresh
//! keys and then walks all of them through inbound, outbound and old-state
//! drop in lockstep. Locks live on the NIC rows, so a coordinator that is
//! re-run after a crash finds what it already holds and resumes.

use std::sync::Arc;

use chrono::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use strand_kernel::{Frame, Prog, ProgLabel, StepContext, StepError, StepOutcome, StepResult};

use crate::graph::{connected_leader, resolve};
use crate::model::{KeyMaterial, Nic, NicId, RekeyPhase, SubnetId, SubnetState};
use crate::progs::{
    DESTROY, NIC_PHASE_DONE, OLD_STATE_DROP_TRIGGER, REFRESH_KEYS, START_REKEY,
    TRIGGER_OUTBOUND_UPDATE,
};
use crate::store::VnetStore;

/// Frame key holding the NICs locked by the running rotation.
pub const LOCKED_NICS: &str = "locked_nics";

/// Typed view of the coordinator's frame while a rotation is in flight.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RekeyFrame {
    #[serde(default)]
    pub locked_nics: Vec<NicId>,
}

const REKEY_INTERVAL_HOURS: i64 = 24;
const WAIT_NAP_SECS: i64 = 10 * 60;
const PHASE_POLL_SECS: i64 = 5;
const DESTROY_DEADLINE_MINUTES: i64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubnetLabel {
    Start,
    Wait,
    RefreshKeys,
    WaitInboundSetup,
    WaitOutboundSetup,
    WaitOldStateDrop,
    Destroy,
}

impl ProgLabel for SubnetLabel {
    const ALL: &'static [Self] = &[
        Self::Start,
        Self::Wait,
        Self::RefreshKeys,
        Self::WaitInboundSetup,
        Self::WaitOutboundSetup,
        Self::WaitOldStateDrop,
        Self::Destroy,
    ];
    const START: Self = Self::Start;

    fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Wait => "wait",
            Self::RefreshKeys => "refresh_keys",
            Self::WaitInboundSetup => "wait_inbound_setup",
            Self::WaitOutboundSetup => "wait_outbound_setup",
            Self::WaitOldStateDrop => "wait_old_state_drop",
            Self::Destroy => "destroy",
        }
    }
}

pub struct SubnetNexus {
    store: Arc<dyn VnetStore>,
    rekey_interval: Duration,
}

impl SubnetNexus {
    pub fn new(store: Arc<dyn VnetStore>) -> Self {
        Self {
            store,
            rekey_interval: Duration::hours(REKEY_INTERVAL_HOURS),
        }
    }

    pub fn with_rekey_interval(mut self, interval: Duration) -> Self {
        self.rekey_interval = interval;
        self
    }

    fn wait(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let id = ctx.subject_id()?;
        if !self.store.nics_locked_by(id)?.is_empty() {
            return Err(StepError::logic(format!(
                "subnet {id} holds NIC locks while in wait"
            )));
        }
        ctx.decr(NIC_PHASE_DONE);

        if ctx.when_set(REFRESH_KEYS)? {
            let leader = connected_leader(self.store.as_ref(), id)?;
            if leader != id {
                tracing::debug!(subnet_id = %id, leader_id = %leader, "forwarding refresh_keys to the connected leader");
                ctx.incr(leader, REFRESH_KEYS);
                return Ok(StepResult::nap_secs(0));
            }
            return Ok(StepResult::hop(SubnetLabel::RefreshKeys));
        }

        let subnet = self.store.get_subnet(id)?;
        if ctx.now() - subnet.last_rekey_at > self.rekey_interval
            && connected_leader(self.store.as_ref(), id)? == id
        {
            tracing::info!(subnet_id = %id, last_rekey_at = %subnet.last_rekey_at, "keys are due for rotation");
            ctx.incr_self(REFRESH_KEYS);
        }
        Ok(StepResult::nap_secs(WAIT_NAP_SECS))
    }

    fn refresh_keys(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let id = ctx.subject_id()?;
        let recorded: RekeyFrame = ctx.frame_data()?;
        let held = self.store.nics_locked_by(id)?;
        if !held.is_empty() {
            tracing::info!(
                subnet_id = %id,
                nics = held.len(),
                recorded = recorded.locked_nics.len(),
                "resuming rekey with locks already held"
            );
            return self.begin_rekey(ctx, id, held);
        }
        if !recorded.locked_nics.is_empty() {
            tracing::debug!(subnet_id = %id, "locks already released, dropping stale locked set");
            ctx.frame_mut().remove(LOCKED_NICS);
        }

        let component = resolve(self.store.as_ref(), id)?;
        let targets: Vec<Nic> = component
            .nics
            .iter()
            .filter(|nic| nic.state.is_rekeyable())
            .cloned()
            .collect();
        if let Some(busy) = targets.iter().find(|nic| nic.is_locked()) {
            tracing::info!(
                subnet_id = %id,
                nic_id = %busy.id,
                coordinator_id = ?busy.rekey_coordinator_id,
                "NIC is locked by another rotation, deferring"
            );
            return Ok(StepResult::hop(SubnetLabel::Wait));
        }
        let leader = component.leader();
        if leader != id {
            ctx.incr(leader, REFRESH_KEYS);
            return Ok(StepResult::hop(SubnetLabel::Wait));
        }
        if targets.is_empty() {
            return Ok(StepResult::hop(SubnetLabel::Wait));
        }
        if let Some(nic) = targets.iter().find(|nic| nic.rekey_phase != RekeyPhase::Idle) {
            return Err(StepError::logic(format!(
                "unlocked nic {} is at phase {}",
                nic.id,
                nic.rekey_phase.as_str()
            )));
        }

        let ids: Vec<NicId> = targets.iter().map(|nic| nic.id).collect();
        if !self.store.lock_nics(&ids, id)? {
            tracing::debug!(subnet_id = %id, "NIC locks taken concurrently, deferring");
            return Ok(StepResult::hop(SubnetLabel::Wait));
        }
        let locked = self.store.nics_locked_by(id)?;
        self.begin_rekey(ctx, id, locked)
    }

    /// Hands out keys and tunnels for the locked set and starts every idle
    /// NIC. Safe to repeat: existing pending keys and tunnels are kept.
    fn begin_rekey(&self, ctx: &mut StepContext<'_>, id: SubnetId, locked: Vec<Nic>) -> StepOutcome {
        let ids: Vec<NicId> = locked.iter().map(|nic| nic.id).collect();
        let mut rng = rand::thread_rng();
        for nic in locked.iter().filter(|nic| nic.pending_key.is_none()) {
            self.store
                .set_pending_key(nic.id, KeyMaterial::generate(&mut rng))?;
        }
        let tunnels = self.store.create_tunnels(&ids)?;
        for nic in locked.iter().filter(|nic| nic.rekey_phase == RekeyPhase::Idle) {
            ctx.incr(nic.id, START_REKEY);
        }
        self.store.set_subnet_state(id, SubnetState::RefreshingKeys)?;
        tracing::info!(subnet_id = %id, nics = ids.len(), new_tunnels = tunnels, "rekey started");
        ctx.frame_mut().store(&RekeyFrame { locked_nics: ids })?;
        Ok(StepResult::hop(SubnetLabel::WaitInboundSetup))
    }

    /// Checks whether every NIC still locked by this subnet reports `target`.
    fn await_phase(
        &self,
        ctx: &mut StepContext<'_>,
        target: RekeyPhase,
    ) -> Result<PhaseCheck, StepError> {
        ctx.decr(NIC_PHASE_DONE);
        let id = ctx.subject_id()?;
        let locked = self.store.nics_locked_by(id)?;
        if locked.is_empty() {
            tracing::warn!(subnet_id = %id, phase = target.as_str(), "every locked NIC vanished, abandoning rekey");
            self.store.set_subnet_state(id, SubnetState::Waiting)?;
            ctx.frame_mut().remove(LOCKED_NICS);
            return Ok(PhaseCheck::Abandoned);
        }
        for nic in &locked {
            if nic.rekey_phase != target && Some(nic.rekey_phase) != target.previous() {
                return Err(StepError::logic(format!(
                    "phase monotonicity violated: nic {} is at {} while subnet {} waits for {}",
                    nic.id,
                    nic.rekey_phase.as_str(),
                    id,
                    target.as_str()
                )));
            }
        }
        let locked_nics: Vec<NicId> = locked.iter().map(|nic| nic.id).collect();
        let nics = locked_nics.len();
        ctx.frame_mut().store(&RekeyFrame { locked_nics })?;
        if locked.iter().any(|nic| nic.rekey_phase != target) {
            return Ok(PhaseCheck::Pending);
        }
        tracing::info!(subnet_id = %id, phase = target.as_str(), nics, "all locked NICs reached phase");
        Ok(PhaseCheck::Reached(locked))
    }

    fn trigger_next(
        &self,
        ctx: &mut StepContext<'_>,
        target: RekeyPhase,
        trigger: &str,
        next: SubnetLabel,
    ) -> StepOutcome {
        match self.await_phase(ctx, target)? {
            PhaseCheck::Abandoned => Ok(StepResult::hop(SubnetLabel::Wait)),
            PhaseCheck::Pending => Ok(StepResult::nap_secs(PHASE_POLL_SECS)),
            PhaseCheck::Reached(locked) => {
                for nic in &locked {
                    ctx.incr(nic.id, trigger);
                }
                Ok(StepResult::hop(next))
            }
        }
    }

    fn wait_old_state_drop(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let locked = match self.await_phase(ctx, RekeyPhase::OldDrop)? {
            PhaseCheck::Abandoned => return Ok(StepResult::hop(SubnetLabel::Wait)),
            PhaseCheck::Pending => return Ok(StepResult::nap_secs(PHASE_POLL_SECS)),
            PhaseCheck::Reached(locked) => locked,
        };
        let id = ctx.subject_id()?;
        let released = self.store.finish_rekey(id, ctx.now())?;
        ctx.frame_mut().remove(LOCKED_NICS);
        tracing::info!(subnet_id = %id, nics = released.len(), expected = locked.len(), "rekey finished");

        // Leadership may have moved while the locks were held.
        let leader = connected_leader(self.store.as_ref(), id)?;
        if leader != id {
            ctx.incr(leader, REFRESH_KEYS);
        }
        Ok(StepResult::hop(SubnetLabel::Wait))
    }

    fn destroy(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let id = ctx.subject_id()?;
        if !self.store.nics_locked_by(id)?.is_empty() {
            return Err(StepError::logic(format!(
                "subnet {id} holds NIC locks while destroying"
            )));
        }
        let nics = self.store.nics_in(id)?;
        if let Some(nic) = nics.iter().find(|nic| nic.vm.is_some()) {
            // Extended on every nap until the VMs are gone.
            ctx.register_deadline(
                None::<SubnetLabel>,
                Duration::minutes(DESTROY_DEADLINE_MINUTES),
                true,
            )?;
            tracing::info!(
                subnet_id = %id,
                nic_id = %nic.id,
                "cannot destroy subnet with attached VMs, first clean up the attached resources"
            );
            return Ok(StepResult::nap_secs(PHASE_POLL_SECS));
        }

        ctx.register_deadline(
            None::<SubnetLabel>,
            Duration::minutes(DESTROY_DEADLINE_MINUTES),
            false,
        )?;
        ctx.decr(DESTROY);
        for peer in self.store.connected(id)? {
            self.store.disconnect(id, peer)?;
            ctx.incr(peer, REFRESH_KEYS);
        }

        if nics.is_empty() {
            self.store.delete_subnet(id)?;
            tracing::info!(subnet_id = %id, "private subnet destroyed");
            return Ok(StepResult::pop_msg("subnet destroyed"));
        }
        for nic in &nics {
            ctx.incr(nic.id, DESTROY);
        }
        Ok(StepResult::nap_secs(rand::thread_rng().gen_range(5..=10)))
    }
}

enum PhaseCheck {
    Abandoned,
    Pending,
    Reached(Vec<Nic>),
}

impl Prog for SubnetNexus {
    type Label = SubnetLabel;
    const NAME: &'static str = "Vnet::SubnetNexus";
    const SEMAPHORES: &'static [&'static str] = &[DESTROY, REFRESH_KEYS, NIC_PHASE_DONE];

    fn before_run(
        &self,
        label: SubnetLabel,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<StepResult>, StepError> {
        if label == SubnetLabel::Destroy || !ctx.is_set(DESTROY)? {
            return Ok(None);
        }
        // A rotation in flight finishes before the subnet goes away.
        if self.store.nics_locked_by(ctx.subject_id()?)?.is_empty() {
            Ok(Some(StepResult::hop(SubnetLabel::Destroy)))
        } else {
            Ok(None)
        }
    }

    fn run(&self, label: SubnetLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        match label {
            SubnetLabel::Start => Ok(StepResult::hop(SubnetLabel::Wait)),
            SubnetLabel::Wait => self.wait(ctx),
            SubnetLabel::RefreshKeys => self.refresh_keys(ctx),
            SubnetLabel::WaitInboundSetup => self.trigger_next(
                ctx,
                RekeyPhase::Inbound,
                TRIGGER_OUTBOUND_UPDATE,
                SubnetLabel::WaitOutboundSetup,
            ),
            SubnetLabel::WaitOutboundSetup => self.trigger_next(
                ctx,
                RekeyPhase::Outbound,
                OLD_STATE_DROP_TRIGGER,
                SubnetLabel::WaitOldStateDrop,
            ),
            SubnetLabel::WaitOldStateDrop => self.wait_old_state_drop(ctx),
            SubnetLabel::Destroy => self.destroy(ctx),
        }
    }
}

/// NICs recorded as locked in a subnet strand's frame.
pub fn locked_nics(frame: &Frame) -> Vec<NicId> {
    frame
        .decode::<RekeyFrame>()
        .map(|data| data.locked_nics)
        .unwrap_or_default()
}

//! `Vnet::NicNexus`: per-NIC lifecycle and its side of a key rotation.

use std::sync::Arc;

use strand_kernel::{Frame, Prog, ProgLabel, StepContext, StepError, StepOutcome, StepResult};

use crate::model::{Nic, NicState, RekeyPhase, SubnetId};
use crate::progs::rekey_nic_tunnel::{RekeyNicTunnel, TunnelLabel};
use crate::progs::{
    DESTROY, DROP_OLD_STATE_COMPLETE, INBOUND_SETUP_COMPLETE, NIC_PHASE_DONE,
    OLD_STATE_DROP_TRIGGER, OUTBOUND_SETUP_COMPLETE, REFRESH_KEYS, REPOPULATE, SETUP_NIC,
    START_REKEY, TRIGGER_OUTBOUND_UPDATE, VM_ALLOCATED,
};
use crate::store::VnetStore;

const DESTROY_RETRY_SECS: i64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NicLabel {
    Start,
    WaitSetup,
    Wait,
    StartRekey,
    WaitRekeyOutboundTrigger,
    WaitRekeyOldStateDropTrigger,
    Destroy,
}

impl ProgLabel for NicLabel {
    const ALL: &'static [Self] = &[
        Self::Start,
        Self::WaitSetup,
        Self::Wait,
        Self::StartRekey,
        Self::WaitRekeyOutboundTrigger,
        Self::WaitRekeyOldStateDropTrigger,
        Self::Destroy,
    ];
    const START: Self = Self::Start;

    fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::WaitSetup => "wait_setup",
            Self::Wait => "wait",
            Self::StartRekey => "start_rekey",
            Self::WaitRekeyOutboundTrigger => "wait_rekey_outbound_trigger",
            Self::WaitRekeyOldStateDropTrigger => "wait_rekey_old_state_drop_trigger",
            Self::Destroy => "destroy",
        }
    }
}

pub struct NicNexus {
    store: Arc<dyn VnetStore>,
}

impl NicNexus {
    pub fn new(store: Arc<dyn VnetStore>) -> Self {
        Self { store }
    }

    fn nic(&self, ctx: &StepContext<'_>) -> Result<Nic, StepError> {
        Ok(self.store.get_nic(ctx.subject_id()?)?)
    }

    /// Records that the NIC finished `phase` and tells its coordinator.
    /// Re-running after the row already moved is a no-op on the row.
    fn advance(
        &self,
        ctx: &mut StepContext<'_>,
        nic: &Nic,
        coordinator: SubnetId,
        phase: RekeyPhase,
    ) -> Result<(), StepError> {
        if nic.rekey_phase != phase {
            if Some(nic.rekey_phase) != phase.previous() {
                return Err(StepError::logic(format!(
                    "nic {} should be at {} before advancing to {}, got {}",
                    nic.id,
                    phase.previous().map_or("none", RekeyPhase::as_str),
                    phase.as_str(),
                    nic.rekey_phase.as_str()
                )));
            }
            self.store.set_rekey_phase(nic.id, phase)?;
        }
        ctx.incr(coordinator, NIC_PHASE_DONE);
        tracing::info!(
            nic_id = %nic.id,
            coordinator_id = %coordinator,
            phase = phase.as_str(),
            "nic rekey phase advanced"
        );
        Ok(())
    }

    fn push_tunnel(label: TunnelLabel, return_label: NicLabel) -> StepResult {
        StepResult::push::<RekeyNicTunnel, _>(label, Frame::new(), return_label)
    }

    fn wait_setup(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        ctx.decr(VM_ALLOCATED);
        if ctx.when_set(SETUP_NIC)? {
            let nic = self.nic(ctx)?;
            if nic.state == NicState::Initializing {
                self.store.set_nic_state(nic.id, NicState::Creating)?;
            }
            ctx.incr(nic.subnet_id, REFRESH_KEYS);
            tracing::info!(nic_id = %nic.id, subnet_id = %nic.subnet_id, "nic set up, requesting key refresh");
        }
        if ctx.when_set(START_REKEY)? {
            return Ok(StepResult::hop(NicLabel::StartRekey));
        }
        Ok(StepResult::hibernate())
    }

    fn wait(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        if ctx.when_set(REPOPULATE)? {
            let nic = self.nic(ctx)?;
            ctx.incr(nic.subnet_id, REFRESH_KEYS);
        }
        if ctx.when_set(START_REKEY)? {
            return Ok(StepResult::hop(NicLabel::StartRekey));
        }
        Ok(StepResult::hibernate())
    }

    fn start_rekey(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        ctx.decr(START_REKEY);
        let nic = self.nic(ctx)?;

        if ctx.retval_msg() == Some(INBOUND_SETUP_COMPLETE) {
            let coordinator = nic.rekey_coordinator_id.ok_or_else(|| {
                StepError::logic(format!("nic {} not locked for rekey", nic.id))
            })?;
            self.advance(ctx, &nic, coordinator, RekeyPhase::Inbound)?;
            return Ok(StepResult::hop(NicLabel::WaitRekeyOutboundTrigger));
        }

        match (nic.rekey_coordinator_id, nic.rekey_phase) {
            (None, _) => {
                // Left over from a resumed coordinator that re-signalled us.
                tracing::debug!(nic_id = %nic.id, "start_rekey without a lock, ignoring");
                Ok(StepResult::hop(NicLabel::Wait))
            }
            (Some(_), RekeyPhase::Idle) => Ok(Self::push_tunnel(
                TunnelLabel::SetupInbound,
                NicLabel::StartRekey,
            )),
            (Some(_), phase) => Err(StepError::logic(format!(
                "unexpected start_rekey signal for nic {} (phase={}, locked=true)",
                nic.id,
                phase.as_str()
            ))),
        }
    }

    fn wait_rekey_outbound_trigger(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let nic = self.nic(ctx)?;
        let coordinator = nic.rekey_coordinator_id.ok_or_else(|| {
            StepError::logic(format!(
                "nic {} not locked in wait_rekey_outbound_trigger",
                nic.id
            ))
        })?;

        if ctx.retval_msg() == Some(OUTBOUND_SETUP_COMPLETE) {
            self.advance(ctx, &nic, coordinator, RekeyPhase::Outbound)?;
            return Ok(StepResult::hop(NicLabel::WaitRekeyOldStateDropTrigger));
        }

        if ctx.when_set(TRIGGER_OUTBOUND_UPDATE)? {
            if nic.rekey_phase != RekeyPhase::Inbound {
                return Err(StepError::logic(format!(
                    "unexpected trigger_outbound_update for nic {} (phase={})",
                    nic.id,
                    nic.rekey_phase.as_str()
                )));
            }
            return Ok(Self::push_tunnel(
                TunnelLabel::SetupOutbound,
                NicLabel::WaitRekeyOutboundTrigger,
            ));
        }
        Ok(StepResult::hibernate())
    }

    fn wait_rekey_old_state_drop_trigger(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let nic = self.nic(ctx)?;

        if ctx
            .retval_msg()
            .is_some_and(|msg| msg.starts_with(DROP_OLD_STATE_COMPLETE))
        {
            match nic.rekey_coordinator_id {
                Some(coordinator) => self.advance(ctx, &nic, coordinator, RekeyPhase::OldDrop)?,
                // The coordinator already saw this NIC at old_drop and released it.
                None => tracing::debug!(nic_id = %nic.id, "rotation already finished"),
            }
            if nic.state != NicState::Active {
                self.store.set_nic_state(nic.id, NicState::Active)?;
            }
            return Ok(StepResult::hop(NicLabel::Wait));
        }

        if nic.rekey_coordinator_id.is_none() {
            return Err(StepError::logic(format!(
                "nic {} not locked in wait_rekey_old_state_drop_trigger",
                nic.id
            )));
        }
        if ctx.when_set(OLD_STATE_DROP_TRIGGER)? {
            if nic.rekey_phase != RekeyPhase::Outbound {
                return Err(StepError::logic(format!(
                    "unexpected old_state_drop_trigger for nic {} (phase={})",
                    nic.id,
                    nic.rekey_phase.as_str()
                )));
            }
            return Ok(Self::push_tunnel(
                TunnelLabel::DropOldState,
                NicLabel::WaitRekeyOldStateDropTrigger,
            ));
        }
        Ok(StepResult::hibernate())
    }

    fn destroy(&self, ctx: &mut StepContext<'_>) -> StepOutcome {
        let id = ctx.subject_id()?;
        let Some(nic) = self.store.nic(id)? else {
            return Ok(StepResult::pop_msg("nic deleted"));
        };
        if nic.vm.is_some() {
            tracing::info!(nic_id = %id, "cannot destroy nic with active vm, first clean up the attached resources");
            return Ok(StepResult::nap_secs(DESTROY_RETRY_SECS));
        }

        ctx.decr(DESTROY);
        self.store.delete_nic(id)?;
        ctx.incr(nic.subnet_id, REFRESH_KEYS);
        tracing::info!(nic_id = %id, subnet_id = %nic.subnet_id, locked = nic.is_locked(), "nic deleted");
        Ok(StepResult::pop_msg("nic deleted"))
    }
}

impl Prog for NicNexus {
    type Label = NicLabel;
    const NAME: &'static str = "Vnet::NicNexus";
    const SEMAPHORES: &'static [&'static str] = &[
        DESTROY,
        VM_ALLOCATED,
        SETUP_NIC,
        REPOPULATE,
        START_REKEY,
        TRIGGER_OUTBOUND_UPDATE,
        OLD_STATE_DROP_TRIGGER,
    ];

    fn before_run(
        &self,
        label: NicLabel,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<StepResult>, StepError> {
        if label != NicLabel::Destroy && ctx.is_set(DESTROY)? {
            return Ok(Some(StepResult::hop(NicLabel::Destroy)));
        }
        Ok(None)
    }

    fn run(&self, label: NicLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        match label {
            NicLabel::Start => {
                if ctx.when_set(VM_ALLOCATED)? {
                    return Ok(StepResult::hop(NicLabel::WaitSetup));
                }
                Ok(StepResult::hibernate())
            }
            NicLabel::WaitSetup => self.wait_setup(ctx),
            NicLabel::Wait => self.wait(ctx),
            NicLabel::StartRekey => self.start_rekey(ctx),
            NicLabel::WaitRekeyOutboundTrigger => self.wait_rekey_outbound_trigger(ctx),
            NicLabel::WaitRekeyOldStateDropTrigger => self.wait_rekey_old_state_drop_trigger(ctx),
            NicLabel::Destroy => self.destroy(ctx),
        }
    }
}

//! `Vnet::RekeyNicTunnel`: one host-side rekey phase for one NIC.
//!
//! Pushed by `Vnet::NicNexus`; never touches the NIC's phase or lock, only
//! the host. Every step is safe to repeat.

use std::sync::Arc;

use strand_kernel::{Prog, ProgLabel, StepContext, StepError, StepOutcome, StepResult};

use crate::model::NicTunnels;
use crate::progs::{DESTROY, DROP_OLD_STATE_COMPLETE, INBOUND_SETUP_COMPLETE, OUTBOUND_SETUP_COMPLETE};
use crate::store::VnetStore;
use crate::tunnel::{DropOutcome, ProviderDrivers, TunnelDriver};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelLabel {
    SetupInbound,
    SetupOutbound,
    DropOldState,
}

impl ProgLabel for TunnelLabel {
    const ALL: &'static [Self] = &[Self::SetupInbound, Self::SetupOutbound, Self::DropOldState];
    const START: Self = Self::SetupInbound;

    fn as_str(&self) -> &'static str {
        match self {
            Self::SetupInbound => "setup_inbound",
            Self::SetupOutbound => "setup_outbound",
            Self::DropOldState => "drop_old_state",
        }
    }
}

pub struct RekeyNicTunnel {
    store: Arc<dyn VnetStore>,
    drivers: ProviderDrivers,
}

impl RekeyNicTunnel {
    pub fn new(store: Arc<dyn VnetStore>, drivers: ProviderDrivers) -> Self {
        Self { store, drivers }
    }

    fn resolve(
        &self,
        ctx: &StepContext<'_>,
    ) -> Result<(NicTunnels, Arc<dyn TunnelDriver>), StepError> {
        let tunnels = self.store.nic_tunnels(ctx.subject_id()?)?;
        let subnet = self.store.get_subnet(tunnels.nic.subnet_id)?;
        let driver = self.drivers.driver_for(&subnet.provider)?;
        Ok((tunnels, driver))
    }
}

impl Prog for RekeyNicTunnel {
    type Label = TunnelLabel;
    const NAME: &'static str = "Vnet::RekeyNicTunnel";

    fn before_run(
        &self,
        _label: TunnelLabel,
        ctx: &mut StepContext<'_>,
    ) -> Result<Option<StepResult>, StepError> {
        // The NIC strand shares the NIC's id.
        if ctx.is_set_on(ctx.subject_id()?, DESTROY)? {
            return Ok(Some(StepResult::pop_msg("nic.destroy semaphore is set")));
        }
        Ok(None)
    }

    fn run(&self, label: TunnelLabel, ctx: &mut StepContext<'_>) -> StepOutcome {
        let (tunnels, driver) = self.resolve(ctx)?;
        let nic_id = tunnels.nic.id;
        match label {
            TunnelLabel::SetupInbound => {
                driver.setup_inbound(&tunnels)?;
                tracing::debug!(nic_id = %nic_id, peers = tunnels.inbound.len(), "inbound SAs installed");
                Ok(StepResult::pop_msg(INBOUND_SETUP_COMPLETE))
            }
            TunnelLabel::SetupOutbound => {
                driver.setup_outbound(&tunnels)?;
                tracing::debug!(nic_id = %nic_id, peers = tunnels.outbound.len(), "outbound SAs installed");
                Ok(StepResult::pop_msg(OUTBOUND_SETUP_COMPLETE))
            }
            TunnelLabel::DropOldState => match driver.drop_old_state(&tunnels)? {
                DropOutcome::Early => Ok(StepResult::pop_msg(format!(
                    "{DROP_OLD_STATE_COMPLETE} early"
                ))),
                DropOutcome::Dropped(count) => {
                    tracing::debug!(nic_id = %nic_id, dropped = count, "old SAs dropped");
                    Ok(StepResult::pop_msg(DROP_OLD_STATE_COMPLETE))
                }
            },
        }
    }
}

//! Rekey workflows.
//!
//! One `Vnet::SubnetNexus` strand per private subnet coordinates rotations
//! for its connected component; one `Vnet::NicNexus` strand per NIC walks the
//! NIC through the phases; `Vnet::RekeyNicTunnel` is the child each phase
//! pushes to touch the host. Strand ids equal the subject's row id, so a
//! subnet or NIC id doubles as the target of a semaphore.

mod nic_nexus;
mod rekey_nic_tunnel;
mod subnet_nexus;

use std::sync::Arc;

use strand_kernel::{KernelError, ProgRegistryBuilder};

use crate::store::VnetStore;
use crate::tunnel::ProviderDrivers;

pub use nic_nexus::{NicLabel, NicNexus};
pub use rekey_nic_tunnel::{RekeyNicTunnel, TunnelLabel};
pub use subnet_nexus::{locked_nics, RekeyFrame, SubnetLabel, SubnetNexus, LOCKED_NICS};

pub const DESTROY: &str = "destroy";
pub const REFRESH_KEYS: &str = "refresh_keys";
pub const NIC_PHASE_DONE: &str = "nic_phase_done";
pub const VM_ALLOCATED: &str = "vm_allocated";
pub const SETUP_NIC: &str = "setup_nic";
pub const REPOPULATE: &str = "repopulate";
pub const START_REKEY: &str = "start_rekey";
pub const TRIGGER_OUTBOUND_UPDATE: &str = "trigger_outbound_update";
pub const OLD_STATE_DROP_TRIGGER: &str = "old_state_drop_trigger";

pub const INBOUND_SETUP_COMPLETE: &str = "inbound_setup is complete";
pub const OUTBOUND_SETUP_COMPLETE: &str = "outbound_setup is complete";
pub const DROP_OLD_STATE_COMPLETE: &str = "drop_old_state is complete";

/// Registers the three vnet progs over one store and driver table.
pub fn register_vnet_progs(
    builder: ProgRegistryBuilder,
    store: Arc<dyn VnetStore>,
    drivers: ProviderDrivers,
) -> Result<ProgRegistryBuilder, KernelError> {
    builder
        .register(SubnetNexus::new(store.clone()))?
        .register(NicNexus::new(store.clone()))?
        .register(RekeyNicTunnel::new(store, drivers))
}

//! Private subnet key rotation on the strand engine.
//!
//! Subnets connected to each other share IPsec tunnels between all of their
//! NICs. Rotating keys is a three-phase, multi-host protocol coordinated by
//! the lowest-id subnet of each connected component; see [progs].

pub mod command;
pub mod error;
pub mod graph;
pub mod keys;
pub mod model;
pub mod progs;
pub mod service;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_store;
pub mod store;
pub mod tunnel;

pub use command::{CommandError, CommandOutput, CommandRunner, SshCommandRunner};
pub use error::VnetError;
pub use graph::{connected_leader, resolve, ConnectedComponent};
pub use model::{
    IpsecTunnel, KeyMaterial, Nic, NicId, NicState, NicTunnels, PrivateSubnet, RekeyPhase,
    SubnetId, SubnetState, VmPlacement,
};
pub use progs::{register_vnet_progs, NicNexus, RekeyNicTunnel, SubnetNexus};
pub use service::VnetService;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_store::SqliteVnetStore;
pub use store::{InMemoryVnetStore, VnetStore};
pub use tunnel::{DropOutcome, ProviderDrivers, TunnelDriver, XfrmTunnelDriver};

//! Private subnet domain rows: subnets, NICs, key material and tunnels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type SubnetId = Uuid;
pub type NicId = Uuid;
pub type VmId = Uuid;

/// Provider name used when a subnet does not say otherwise.
pub const DEFAULT_PROVIDER: &str = "metal";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubnetState {
    Waiting,
    RefreshingKeys,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivateSubnet {
    pub id: SubnetId,
    pub name: String,
    pub provider: String,
    pub state: SubnetState,
    pub last_rekey_at: DateTime<Utc>,
}

impl PrivateSubnet {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            provider: DEFAULT_PROVIDER.to_string(),
            state: SubnetState::Waiting,
            last_rekey_at: now,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicState {
    Initializing,
    Creating,
    Active,
}

impl NicState {
    /// NICs that take part in a key rotation.
    pub fn is_rekeyable(self) -> bool {
        matches!(self, Self::Creating | Self::Active)
    }
}

/// Per-NIC progress through one rotation. Only moves forward until the
/// coordinator resets it to idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RekeyPhase {
    Idle,
    Inbound,
    Outbound,
    OldDrop,
}

impl RekeyPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::OldDrop => "old_drop",
        }
    }

    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Idle => None,
            Self::Inbound => Some(Self::Idle),
            Self::Outbound => Some(Self::Inbound),
            Self::OldDrop => Some(Self::Outbound),
        }
    }
}

/// ESP parameters of one NIC for one rotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    /// `0x`-prefixed hex of a 288-bit AES-GCM key plus salt.
    pub encryption_key: String,
    pub spi4: String,
    pub spi6: String,
    pub reqid: u32,
}

/// Where the VM behind a NIC runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPlacement {
    pub vm_id: VmId,
    /// SSH host of the hypervisor.
    pub host: String,
    /// Network namespace of the VM on that host.
    pub inhost_name: String,
    /// IPv6 network routed to the VM, e.g. `2a01:4f8:10a:128b:814c::/79`.
    pub ephemeral_net6: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Nic {
    pub id: NicId,
    pub subnet_id: SubnetId,
    pub name: String,
    pub private_ipv4: String,
    pub private_ipv6: String,
    pub vm: Option<VmPlacement>,
    pub state: NicState,
    pub active_key: Option<KeyMaterial>,
    pub pending_key: Option<KeyMaterial>,
    /// Subnet that holds the rotation lock on this NIC.
    pub rekey_coordinator_id: Option<SubnetId>,
    pub rekey_phase: RekeyPhase,
}

impl Nic {
    pub fn new(
        subnet_id: SubnetId,
        name: impl Into<String>,
        private_ipv4: impl Into<String>,
        private_ipv6: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subnet_id,
            name: name.into(),
            private_ipv4: private_ipv4.into(),
            private_ipv6: private_ipv6.into(),
            vm: None,
            state: NicState::Initializing,
            active_key: None,
            pending_key: None,
            rekey_coordinator_id: None,
            rekey_phase: RekeyPhase::Idle,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.rekey_coordinator_id.is_some()
    }
}

/// Directed ESP tunnel; traffic from `src_nic_id` to `dst_nic_id` is
/// encrypted with the source NIC's key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpsecTunnel {
    pub src_nic_id: NicId,
    pub dst_nic_id: NicId,
}

/// A NIC with both ends of every tunnel touching it, as a driver needs them.
#[derive(Clone, Debug, PartialEq)]
pub struct NicTunnels {
    pub nic: Nic,
    /// Peers sending to this NIC.
    pub inbound: Vec<Nic>,
    /// Peers this NIC sends to.
    pub outbound: Vec<Nic>,
}

//! Provisioning entry points: create rows and start their strands together.

use std::sync::Arc;

use strand_kernel::{Clock, Frame};
use strand_runtime::ControlPlane;

use crate::error::VnetError;
use crate::model::{Nic, NicId, PrivateSubnet, SubnetId, VmPlacement};
use crate::progs::{
    NicLabel, NicNexus, SubnetLabel, SubnetNexus, DESTROY, REFRESH_KEYS, REPOPULATE, SETUP_NIC,
    VM_ALLOCATED,
};
use crate::store::VnetStore;

#[derive(Clone)]
pub struct VnetService {
    store: Arc<dyn VnetStore>,
    control: ControlPlane,
    clock: Arc<dyn Clock>,
}

impl VnetService {
    pub fn new(store: Arc<dyn VnetStore>, control: ControlPlane, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            control,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn VnetStore> {
        &self.store
    }

    pub fn control(&self) -> &ControlPlane {
        &self.control
    }

    pub fn create_subnet(
        &self,
        name: &str,
        provider: Option<&str>,
    ) -> Result<PrivateSubnet, VnetError> {
        let mut subnet = PrivateSubnet::new(name, self.clock.now());
        if let Some(provider) = provider {
            subnet = subnet.with_provider(provider);
        }
        self.store.create_subnet(&subnet)?;
        self.control
            .assemble::<SubnetNexus>(subnet.id, SubnetLabel::Start, Frame::new())?;
        tracing::info!(subnet_id = %subnet.id, name, provider = %subnet.provider, "private subnet created");
        Ok(subnet)
    }

    pub fn create_nic(
        &self,
        subnet_id: SubnetId,
        name: &str,
        private_ipv4: &str,
        private_ipv6: &str,
    ) -> Result<Nic, VnetError> {
        let nic = Nic::new(subnet_id, name, private_ipv4, private_ipv6);
        self.store.create_nic(&nic)?;
        self.control
            .assemble::<NicNexus>(nic.id, NicLabel::Start, Frame::new())?;
        tracing::info!(nic_id = %nic.id, subnet_id = %subnet_id, name, "nic created");
        Ok(nic)
    }

    /// Places the NIC's VM and lets the NIC join the next rotation.
    pub fn attach_vm(&self, nic_id: NicId, vm: VmPlacement) -> Result<(), VnetError> {
        self.store.attach_vm(nic_id, vm)?;
        self.control.signal(nic_id, VM_ALLOCATED)?;
        self.control.signal(nic_id, SETUP_NIC)?;
        Ok(())
    }

    pub fn detach_vm(&self, nic_id: NicId) -> Result<(), VnetError> {
        self.store.detach_vm(nic_id)
    }

    pub fn connect(&self, a: SubnetId, b: SubnetId) -> Result<(), VnetError> {
        self.store.connect(a, b)?;
        self.control.signal(a, REFRESH_KEYS)?;
        self.control.signal(b, REFRESH_KEYS)?;
        tracing::info!(subnet_id = %a, peer_id = %b, "subnets connected");
        Ok(())
    }

    pub fn disconnect(&self, a: SubnetId, b: SubnetId) -> Result<(), VnetError> {
        self.store.disconnect(a, b)?;
        self.control.signal(a, REFRESH_KEYS)?;
        self.control.signal(b, REFRESH_KEYS)?;
        Ok(())
    }

    pub fn refresh_keys(&self, subnet_id: SubnetId) -> Result<(), VnetError> {
        Ok(self.control.signal(subnet_id, REFRESH_KEYS)?)
    }

    pub fn repopulate(&self, nic_id: NicId) -> Result<(), VnetError> {
        Ok(self.control.signal(nic_id, REPOPULATE)?)
    }

    pub fn destroy_subnet(&self, subnet_id: SubnetId) -> Result<(), VnetError> {
        Ok(self.control.signal(subnet_id, DESTROY)?)
    }

    pub fn destroy_nic(&self, nic_id: NicId) -> Result<(), VnetError> {
        Ok(self.control.signal(nic_id, DESTROY)?)
    }
}

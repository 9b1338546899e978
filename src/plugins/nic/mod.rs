pub mod apinet;
pub mod isolated;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    api::machine::{NetworkInterfaceSpec, NetworkInterfaceStatus},
    host::Paths,
};

/// A NIC plugin wires one network interface up to a host device. `apply` is
/// idempotent and reports how far the interface got: `Pending` when it can
/// never be attached (isolated topologies), `Prepared` once a host path
/// exists. The reconciler owns the transition to `Attached`.
#[async_trait]
pub trait NetworkInterfacePlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn init(&mut self, paths: Paths) -> Result<()>;

    async fn apply(
        &self,
        spec: &NetworkInterfaceSpec,
        machine_id: &str,
    ) -> Result<NetworkInterfaceStatus>;
    async fn delete(&self, nic_name: &str, machine_id: &str) -> Result<()>;
}

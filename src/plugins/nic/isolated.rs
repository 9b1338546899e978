use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::fs;

use crate::{
    api::machine::{NetworkInterfaceSpec, NetworkInterfaceStatus},
    host::Paths,
    plugins::nic::NetworkInterfacePlugin,
};

const PLUGIN_NAME: &str = "isolated";

/// Placeholder plugin for test and dev topologies: no external wiring, the
/// NIC stays `Pending` and is never attached to a VM.
pub struct IsolatedPlugin {
    paths: Option<Paths>,
}

impl IsolatedPlugin {
    pub fn new() -> Self {
        Self { paths: None }
    }

    fn paths(&self) -> Result<&Paths> {
        match &self.paths {
            Some(paths) => Ok(paths),
            None => bail!("isolated plugin is not initialized"),
        }
    }
}

impl Default for IsolatedPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkInterfacePlugin for IsolatedPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&mut self, paths: Paths) -> Result<()> {
        self.paths = Some(paths);
        Ok(())
    }

    async fn apply(
        &self,
        spec: &NetworkInterfaceSpec,
        machine_id: &str,
    ) -> Result<NetworkInterfaceStatus> {
        fs::create_dir_all(self.paths()?.machine_nic_dir(machine_id, &spec.name)).await?;
        Ok(NetworkInterfaceStatus::pending(&spec.name))
    }

    async fn delete(&self, nic_name: &str, machine_id: &str) -> Result<()> {
        let nic_dir = self.paths()?.machine_nic_dir(machine_id, nic_name);
        if nic_dir.exists() {
            fs::remove_dir_all(&nic_dir).await?;
        }
        Ok(())
    }
}

pub mod ceph;
pub mod empty_disk;
pub mod local_disk;

use anyhow::{Result, bail};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::{
    api::machine::{VolumeSpec, VolumeStatus},
    host::Paths,
};

/// A volume plugin brings one class of volume specs to host-side readiness.
/// `apply` is idempotent: repeated calls with the same spec yield the same
/// status and never regress state.
#[async_trait]
pub trait VolumePlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn init(&mut self, paths: Paths) -> Result<()>;

    fn can_support(&self, spec: &VolumeSpec) -> bool;

    async fn apply(&self, spec: &VolumeSpec, machine_id: &str) -> Result<VolumeStatus>;
    async fn delete(&self, volume_name: &str, machine_id: &str) -> Result<()>;
}

/// Resolves the plugin for a spec by `can_support` in registration order;
/// first match wins, zero matches is a reconcile error.
pub struct VolumePluginManager {
    plugins: Vec<Box<dyn VolumePlugin>>,
}

impl VolumePluginManager {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    pub fn init_plugins(&mut self, paths: &Paths, plugins: Vec<Box<dyn VolumePlugin>>) -> Result<()> {
        for mut plugin in plugins {
            plugin.init(paths.clone())?;
            self.plugins.push(plugin);
        }
        Ok(())
    }

    pub fn find_plugin_by_spec(&self, spec: &VolumeSpec) -> Result<&dyn VolumePlugin> {
        for plugin in &self.plugins {
            if plugin.can_support(spec) {
                return Ok(plugin.as_ref());
            }
        }
        bail!("no volume plugin found for volume {}", spec.name);
    }
}

impl Default for VolumePluginManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic WWN-like disk handle: sha256 of `<machineID>:<name>`,
/// truncated to 8 bytes with the high bit set, 16 uppercase hex digits.
pub fn generate_wwn(machine_id: &str, disk_name: &str) -> String {
    let digest = Sha256::digest(format!("{machine_id}:{disk_name}"));
    let mut wwn = [0u8; 8];
    wwn.copy_from_slice(&digest[..8]);
    wwn[0] |= 0x80;
    hex::encode_upper(wwn)
}

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs;

/// On-disk layout of the provider, rooted at the configurable provider root.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    /// Binds the layout to `root` and creates the base directories.
    pub async fn at(root: impl AsRef<Path>) -> Result<Self> {
        let paths = Self {
            root: root.as_ref().to_path_buf(),
        };

        for dir in [
            paths.machine_store_dir(),
            paths.nic_store_dir(),
            paths.machines_dir(),
            paths.images_dir(),
        ] {
            fs::create_dir_all(&dir).await?;
        }

        Ok(paths)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn machine_store_dir(&self) -> PathBuf {
        self.root.join("store").join("machine")
    }

    pub fn nic_store_dir(&self) -> PathBuf {
        self.root.join("store").join("networkinterface")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn machines_dir(&self) -> PathBuf {
        self.root.join("machines")
    }

    pub fn machine_dir(&self, machine_id: &str) -> PathBuf {
        self.machines_dir().join(machine_id)
    }

    pub fn machine_rootfs_file(&self, machine_id: &str) -> PathBuf {
        self.machine_dir(machine_id).join("rootfs.raw")
    }

    pub fn machine_volumes_dir(&self, machine_id: &str) -> PathBuf {
        self.machine_dir(machine_id).join("volumes")
    }

    pub fn machine_volume_dir(&self, machine_id: &str, plugin: &str, volume_name: &str) -> PathBuf {
        self.machine_volumes_dir(machine_id)
            .join(plugin)
            .join(volume_name)
    }

    pub fn machine_nics_dir(&self, machine_id: &str) -> PathBuf {
        self.machine_dir(machine_id).join("nics")
    }

    pub fn machine_nic_dir(&self, machine_id: &str, nic_name: &str) -> PathBuf {
        self.machine_nics_dir(machine_id).join(nic_name)
    }

    pub async fn make_machine_dirs(&self, machine_id: &str) -> Result<()> {
        fs::create_dir_all(self.machine_dir(machine_id)).await?;
        fs::create_dir_all(self.machine_volumes_dir(machine_id)).await?;
        fs::create_dir_all(self.machine_nics_dir(machine_id)).await?;
        Ok(())
    }

    pub async fn remove_machine_dir(&self, machine_id: &str) -> Result<()> {
        let dir = self.machine_dir(machine_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

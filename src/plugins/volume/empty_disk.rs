use std::os::unix::fs::PermissionsExt;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::fs;

use crate::{
    api::machine::{VolumeSpec, VolumeState, VolumeStatus, VolumeType},
    host::Paths,
    plugins::volume::{VolumePlugin, generate_wwn},
    raw::{CreateOption, Raw},
};

const PLUGIN_NAME: &str = "empty-disk";

pub const DEFAULT_SIZE: i64 = 500 * 1024 * 1024;

pub struct EmptyDiskPlugin {
    paths: Option<Paths>,
    raw: Raw,
}

impl EmptyDiskPlugin {
    pub fn new(raw: Raw) -> Self {
        Self { paths: None, raw }
    }

    fn paths(&self) -> Result<&Paths> {
        match &self.paths {
            Some(paths) => Ok(paths),
            None => bail!("empty-disk plugin is not initialized"),
        }
    }
}

#[async_trait]
impl VolumePlugin for EmptyDiskPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&mut self, paths: Paths) -> Result<()> {
        self.paths = Some(paths);
        Ok(())
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        spec.empty_disk.is_some()
    }

    async fn apply(&self, spec: &VolumeSpec, machine_id: &str) -> Result<VolumeStatus> {
        let Some(empty_disk) = &spec.empty_disk else {
            bail!("volume {} does not specify an empty disk", spec.name);
        };

        let paths = self.paths()?;
        let volume_dir = paths.machine_volume_dir(machine_id, PLUGIN_NAME, &spec.name);
        fs::create_dir_all(&volume_dir).await?;

        let size = if empty_disk.size == 0 {
            DEFAULT_SIZE
        } else {
            empty_disk.size
        };

        let disk_file = volume_dir.join("disk.raw");
        if !fs::try_exists(&disk_file).await? {
            self.raw.create(&disk_file, CreateOption::WithSize(size)).await?;
            fs::set_permissions(&disk_file, std::fs::Permissions::from_mode(0o666)).await?;
        }

        Ok(VolumeStatus {
            name: spec.name.clone(),
            kind: VolumeType::File,
            path: disk_file.to_string_lossy().to_string(),
            handle: generate_wwn(machine_id, &spec.name),
            state: VolumeState::Prepared,
            size,
        })
    }

    async fn delete(&self, volume_name: &str, machine_id: &str) -> Result<()> {
        let volume_dir = self
            .paths()?
            .machine_volume_dir(machine_id, PLUGIN_NAME, volume_name);
        if volume_dir.exists() {
            fs::remove_dir_all(&volume_dir).await?;
        }
        Ok(())
    }
}

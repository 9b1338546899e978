use std::{os::unix::fs::PermissionsExt, sync::Arc};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::{
    api::machine::{VolumeSpec, VolumeState, VolumeStatus, VolumeType},
    host::Paths,
    oci::ImageCache,
    plugins::volume::{VolumePlugin, generate_wwn},
    raw::{CreateOption, Raw},
};

const PLUGIN_NAME: &str = "local-disk";

use crate::plugins::volume::empty_disk::DEFAULT_SIZE;

/// Local disks either clone a cached image or start out sparse.
pub struct LocalDiskPlugin {
    paths: Option<Paths>,
    raw: Raw,
    image_cache: Arc<dyn ImageCache>,
}

impl LocalDiskPlugin {
    pub fn new(raw: Raw, image_cache: Arc<dyn ImageCache>) -> Self {
        Self {
            paths: None,
            raw,
            image_cache,
        }
    }

    fn paths(&self) -> Result<&Paths> {
        match &self.paths {
            Some(paths) => Ok(paths),
            None => bail!("local-disk plugin is not initialized"),
        }
    }
}

#[async_trait]
impl VolumePlugin for LocalDiskPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&mut self, paths: Paths) -> Result<()> {
        self.paths = Some(paths);
        Ok(())
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        spec.local_disk.is_some()
    }

    async fn apply(&self, spec: &VolumeSpec, machine_id: &str) -> Result<VolumeStatus> {
        let Some(local_disk) = &spec.local_disk else {
            bail!("volume {} does not specify a local disk", spec.name);
        };

        let paths = self.paths()?;
        let volume_dir = paths.machine_volume_dir(machine_id, PLUGIN_NAME, &spec.name);
        fs::create_dir_all(&volume_dir).await?;

        let size = if local_disk.size == 0 {
            DEFAULT_SIZE
        } else {
            local_disk.size
        };

        let disk_file = volume_dir.join("disk.raw");
        if !fs::try_exists(&disk_file).await? {
            let create_option = match &local_disk.image {
                Some(image_ref) => {
                    // Pulling bubbles up and requeues via the pull-done listener
                    let image = self.image_cache.get(image_ref).await?;
                    debug!("creating disk from image {image_ref}");
                    CreateOption::WithSourceFile(image.root_fs_path.to_string_lossy().to_string())
                }
                None => CreateOption::WithSize(size),
            };

            self.raw.create(&disk_file, create_option).await?;
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

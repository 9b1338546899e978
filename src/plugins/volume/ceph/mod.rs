pub mod qmp;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::{
    api::machine::{VolumeConnection, VolumeSpec, VolumeState, VolumeStatus, VolumeType},
    errors::Invalid,
    host::Paths,
    plugins::volume::{
        VolumePlugin,
        ceph::qmp::{
            BlockExportAddArguments, BlockExportAddr, BlockdevAddArguments, BlockdevCache,
            QmpMonitor,
        },
    },
};

const PLUGIN_NAME: &str = "ceph";

pub const CEPH_DRIVER_NAME: &str = "ceph";

const VOLUME_ATTRIBUTE_IMAGE_KEY: &str = "image";
const VOLUME_ATTRIBUTE_MONITORS_KEY: &str = "monitors";
const SECRET_USER_ID_KEY: &str = "userID";
const SECRET_USER_KEY_KEY: &str = "userKey";
const SECRET_ENCRYPTION_KEY: &str = "encryptionKey";

const HANDLE_FILE: &str = "handle";
const SOCKET_FILE: &str = "socket";

#[derive(Debug, Clone)]
pub struct ValidatedVolume {
    pub name: String,
    pub monitors: Vec<String>,
    pub pool: String,
    pub image: String,
    pub handle: String,
    pub user_id: String,
    pub user_key: String,
    pub encryption_key: Option<String>,
}

/// Brokers validated RBD volumes into vhost-user-blk sockets.
#[async_trait]
pub trait CephProvider: Send + Sync {
    async fn mount(&self, machine_id: &str, volume: &ValidatedVolume) -> Result<String>;
    async fn unmount(&self, machine_id: &str, volume_name: &str) -> Result<()>;
}

/// Provider speaking QMP to the shared qemu-storage-daemon.
pub struct QmpProvider {
    paths: Paths,
    monitor: Arc<QmpMonitor>,
}

impl QmpProvider {
    pub fn new(paths: Paths, monitor: Arc<QmpMonitor>) -> Self {
        Self { paths, monitor }
    }

    fn volume_dir(&self, machine_id: &str, volume_name: &str) -> std::path::PathBuf {
        self.paths
            .machine_volume_dir(machine_id, PLUGIN_NAME, volume_name)
    }

    async fn create_ceph_conf(
        &self,
        machine_id: &str,
        volume: &ValidatedVolume,
    ) -> Result<String> {
        let volume_dir = self.volume_dir(machine_id, &volume.name);
        let conf_path = volume_dir.join("ceph.conf");
        let key_path = volume_dir.join("ceph.key");

        debug!("creating ceph conf at {}", conf_path.display());
        let conf_data = format!(
            "[global]\nmon_host = {} \n\n[client.{}]\nkeyring = {}\n",
            volume.monitors.join(","),
            volume.user_id,
            key_path.display(),
        );
        fs::write(&conf_path, conf_data)
            .await
            .with_context(|| format!("failed to write {}", conf_path.display()))?;

        let key_data = format!("[client.{}]\nkey = {}\n", volume.user_id, volume.user_key);
        fs::write(&key_path, key_data)
            .await
            .with_context(|| format!("failed to write {}", key_path.display()))?;

        Ok(conf_path.to_string_lossy().to_string())
    }
}

fn node_name(handle: &str) -> String {
    format!("ceph-{handle}")
}

#[async_trait]
impl CephProvider for QmpProvider {
    async fn mount(&self, machine_id: &str, volume: &ValidatedVolume) -> Result<String> {
        let volume_dir = self.volume_dir(machine_id, &volume.name);
        fs::create_dir_all(&volume_dir).await?;

        let conf_path = self.create_ceph_conf(machine_id, volume).await?;
        // the handle sidecar keeps unmount idempotent across restarts
        fs::write(volume_dir.join(HANDLE_FILE), &volume.handle).await?;

        let socket_path = volume_dir.join(SOCKET_FILE);
        let node = node_name(&volume.handle);

        let nodes = self.monitor.query_named_block_nodes().await?;
        if !nodes.iter().any(|n| n.node_name == node) {
            debug!("adding block node {node}");
            self.monitor
                .blockdev_add(BlockdevAddArguments {
                    node_name: node.clone(),
                    driver: "rbd".into(),
                    pool: volume.pool.clone(),
                    image: volume.image.clone(),
                    user: volume.user_id.clone(),
                    conf: conf_path,
                    discard: "unmap".into(),
                    cache: BlockdevCache { direct: true },
                })
                .await?;
        }

        let exports = self.monitor.query_block_exports().await?;
        if !exports.iter().any(|e| e.id == node) {
            debug!("adding block export {node}");
            self.monitor
                .block_export_add(BlockExportAddArguments {
                    id: node.clone(),
                    node_name: node.clone(),
                    export_type: "vhost-user-blk".into(),
                    addr: BlockExportAddr {
                        addr_type: "unix".into(),
                        path: socket_path.to_string_lossy().to_string(),
                    },
                    writable: true,
                })
                .await?;
        }

        Ok(socket_path.to_string_lossy().to_string())
    }

    async fn unmount(&self, machine_id: &str, volume_name: &str) -> Result<()> {
        let volume_dir = self.volume_dir(machine_id, volume_name);
        let handle = match fs::read_to_string(volume_dir.join(HANDLE_FILE)).await {
            Ok(handle) => handle,
            // nothing was ever mounted here
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let node = node_name(handle.trim());

        let exports = self.monitor.query_block_exports().await?;
        if exports.iter().any(|e| e.id == node) {
            debug!("deleting block export {node}");
            self.monitor.block_export_del(&node).await?;
        }

        let nodes = self.monitor.query_named_block_nodes().await?;
        if nodes.iter().any(|n| n.node_name == node) {
            debug!("deleting block node {node}");
            self.monitor.blockdev_del(&node).await?;
        }

        Ok(())
    }
}

pub struct CephPlugin {
    provider: Arc<dyn CephProvider>,
    paths: Option<Paths>,
}

impl CephPlugin {
    pub fn new(provider: Arc<dyn CephProvider>) -> Self {
        Self {
            provider,
            paths: None,
        }
    }

    fn paths(&self) -> Result<&Paths> {
        match &self.paths {
            Some(paths) => Ok(paths),
            None => bail!("ceph plugin is not initialized"),
        }
    }
}

#[async_trait]
impl VolumePlugin for CephPlugin {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&mut self, paths: Paths) -> Result<()> {
        self.paths = Some(paths);
        Ok(())
    }

    fn can_support(&self, spec: &VolumeSpec) -> bool {
        match &spec.connection {
            Some(connection) => connection.driver == CEPH_DRIVER_NAME,
            None => false,
        }
    }

    async fn apply(&self, spec: &VolumeSpec, machine_id: &str) -> Result<VolumeStatus> {
        let volume = validate_volume(spec)?;
        let path = self
            .provider
            .mount(machine_id, &volume)
            .await
            .context("failed to mount volume")?;

        Ok(VolumeStatus {
            name: spec.name.clone(),
            kind: VolumeType::Socket,
            path,
            handle: volume.handle,
            state: VolumeState::Prepared,
            size: 0,
        })
    }

    async fn delete(&self, volume_name: &str, machine_id: &str) -> Result<()> {
        self.provider
            .unmount(machine_id, volume_name)
            .await
            .with_context(|| format!("failed to unmount volume {volume_name}"))?;

        let volume_dir = self
            .paths()?
            .machine_volume_dir(machine_id, PLUGIN_NAME, volume_name);
        if volume_dir.exists() {
            fs::remove_dir_all(&volume_dir).await?;
        }
        Ok(())
    }
}

fn validate_volume(spec: &VolumeSpec) -> Result<ValidatedVolume> {
    let Some(connection) = &spec.connection else {
        return Err(Invalid(format!("volume {} does not specify a connection", spec.name)).into());
    };
    if connection.driver != CEPH_DRIVER_NAME {
        return Err(Invalid(format!(
            "volume connection specifies invalid driver {:?}",
            connection.driver
        ))
        .into());
    }
    if connection.handle.is_empty() {
        return Err(Invalid("volume connection does not specify a handle".into()).into());
    }

    let (pool, image) = read_volume_attributes(connection)?;
    let (user_id, user_key) = read_secret_data(connection)?;
    let encryption_key = read_encryption_data(connection)?;

    Ok(ValidatedVolume {
        name: spec.name.clone(),
        monitors: read_monitors(connection)?,
        pool,
        image,
        handle: connection.handle.clone(),
        user_id,
        user_key,
        encryption_key,
    })
}

fn read_monitors(connection: &VolumeConnection) -> Result<Vec<String>> {
    let Some(monitors) = connection.attributes.get(VOLUME_ATTRIBUTE_MONITORS_KEY) else {
        return Err(Invalid(format!("no monitors data at {VOLUME_ATTRIBUTE_MONITORS_KEY}")).into());
    };
    if monitors.is_empty() {
        return Err(Invalid(format!("no monitors data at {VOLUME_ATTRIBUTE_MONITORS_KEY}")).into());
    }

    let mut parsed = Vec::new();
    for monitor in monitors.split(',') {
        match monitor.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                parsed.push(monitor.to_string());
            }
            _ => {
                return Err(Invalid(format!("[monitor {monitor}] invalid host:port")).into());
            }
        }
    }
    Ok(parsed)
}

fn read_volume_attributes(connection: &VolumeConnection) -> Result<(String, String)> {
    let Some(image_and_pool) = connection.attributes.get(VOLUME_ATTRIBUTE_IMAGE_KEY) else {
        return Err(Invalid(format!("no image data at {VOLUME_ATTRIBUTE_IMAGE_KEY}")).into());
    };

    match image_and_pool.split_once('/') {
        Some((pool, image)) if !pool.is_empty() && !image.is_empty() => {
            Ok((pool.to_string(), image.to_string()))
        }
        _ => Err(Invalid(format!("invalid image format: {image_and_pool}")).into()),
    }
}

fn read_secret_data(connection: &VolumeConnection) -> Result<(String, String)> {
    let user_id = connection
        .secret_data
        .get(SECRET_USER_ID_KEY)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| Invalid(format!("no user id at {SECRET_USER_ID_KEY}")))?;
    let user_key = connection
        .secret_data
        .get(SECRET_USER_KEY_KEY)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| Invalid(format!("no user key at {SECRET_USER_KEY_KEY}")))?;

    Ok((
        String::from_utf8_lossy(user_id).to_string(),
        String::from_utf8_lossy(user_key).to_string(),
    ))
}

fn read_encryption_data(connection: &VolumeConnection) -> Result<Option<String>> {
    let Some(encryption_data) = &connection.encryption_data else {
        return Ok(None);
    };

    let key = encryption_data
        .get(SECRET_ENCRYPTION_KEY)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| Invalid(format!("no encryption key at {SECRET_ENCRYPTION_KEY}")))?;
    Ok(Some(String::from_utf8_lossy(key).to_string()))
}

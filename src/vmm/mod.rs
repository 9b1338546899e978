pub mod client;
pub mod types;

#[cfg(test)]
pub mod fake;

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};

use anyhow::{Context, Result};
use base64::{Engine, prelude::BASE64_STANDARD};
use papaya::HashMap;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::{
    api::{
        Object,
        machine::{Machine, NetworkInterfaceStatus, VolumeState, VolumeStatus, VolumeType},
        nic::nic_device_id,
    },
    host::Paths,
    machinery::sync::MutexMap,
    osutils,
    vmm::{
        client::{VmmClient, is_vm_not_created, protocol_error},
        types::{
            ConsoleConfig, ConsoleMode, CpusConfig, DeviceConfig, DiskConfig, MemoryConfig,
            PayloadConfig, PlatformConfig, VmConfig, VmInfo, VmmPingResponse,
        },
    },
};

#[derive(Debug, Error)]
#[error("no free api socket available")]
pub struct NoCapacity;

pub fn is_no_capacity(err: &anyhow::Error) -> bool {
    err.downcast_ref::<NoCapacity>().is_some()
}

#[derive(Debug, Error)]
#[error("unknown api socket: {0}")]
pub struct UnknownSocket(pub String);

pub fn is_unknown_socket(err: &anyhow::Error) -> bool {
    err.downcast_ref::<UnknownSocket>().is_some()
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub sockets_dir: PathBuf,
    pub firmware_path: PathBuf,
    /// Sockets already referenced by stored machines; never handed out as free.
    pub reserved_sockets: Vec<String>,
}

/// Owns the pool of hypervisor control sockets and serializes all REST
/// traffic per socket. `instances` is insert-only after startup.
pub struct Manager {
    instances: HashMap<String, Arc<VmmClient>>,
    free: StdMutex<BTreeSet<String>>,
    id_mu: MutexMap,

    paths: Paths,
    firmware_path: PathBuf,
}

impl Manager {
    /// Scans the sockets directory and classifies each control socket as
    /// free (no VM created), reserved (a machine record references it) or
    /// in-use (a VM exists behind it).
    pub async fn discover(paths: Paths, opts: ManagerOptions) -> Result<Self> {
        let manager = Self {
            instances: HashMap::new(),
            free: StdMutex::new(BTreeSet::new()),
            id_mu: MutexMap::new(),
            paths,
            firmware_path: opts.firmware_path,
        };

        if !opts.sockets_dir.exists() {
            fs::create_dir_all(&opts.sockets_dir).await?;
        }

        let mut entries = fs::read_dir(&opts.sockets_dir)
            .await
            .with_context(|| format!("failed to read {}", opts.sockets_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !osutils::is_socket_present(&path).await.unwrap_or(false) {
                continue;
            }
            if !osutils::is_socket_active(&path).await.unwrap_or(false) {
                warn!("socket {} has no listener, skipping", path.display());
                continue;
            }

            let socket = path.to_string_lossy().to_string();
            let client = Arc::new(VmmClient::new(&path));
            manager.instances.pin().insert(socket.clone(), client.clone());

            if opts.reserved_sockets.iter().any(|s| s == &socket) {
                debug!("socket {socket} is reserved by an existing machine");
                continue;
            }

            match client.vm_info().await {
                Err(err) if is_vm_not_created(&err) => {
                    manager
                        .free
                        .lock()
                        .expect("free set lock poisoned")
                        .insert(socket);
                }
                Ok(_) => debug!("socket {socket} already has a vm, leaving it in use"),
                Err(err) => warn!("socket {socket} is not responding, skipping: {err:#}"),
            }
        }

        Ok(manager)
    }

    fn client(&self, socket: &str) -> Result<Arc<VmmClient>> {
        match self.instances.pin().get(socket) {
            Some(client) => Ok(client.clone()),
            None => Err(UnknownSocket(socket.to_string()).into()),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.pin().len()
    }

    /// Pops any free socket. Assignment is transactional with the machine
    /// record: the caller persists the assignment before issuing REST calls.
    pub fn get_free_api_socket(&self) -> Result<String> {
        let mut free = self.free.lock().expect("free set lock poisoned");
        let Some(socket) = free.iter().next().cloned() else {
            return Err(NoCapacity.into());
        };
        free.remove(&socket);
        Ok(socket)
    }

    pub fn free_api_socket(&self, socket: &str) {
        if self.instances.pin().get(socket).is_none() {
            warn!("refusing to free unknown socket {socket}");
            return;
        }
        self.free
            .lock()
            .expect("free set lock poisoned")
            .insert(socket.to_string());
    }

    #[cfg(test)]
    pub fn free_socket_count(&self) -> usize {
        self.free.lock().expect("free set lock poisoned").len()
    }

    pub async fn ping(&self, socket: &str) -> Result<VmmPingResponse> {
        let _guard = self.id_mu.lock(socket).await;

        let ping = self.client(socket)?.ping().await?;
        debug!(
            "ping vmm on {socket}: version {} pid {:?}",
            ping.version, ping.pid
        );
        Ok(ping)
    }

    pub async fn get_vm(&self, socket: &str) -> Result<VmInfo> {
        let _guard = self.id_mu.lock(socket).await;
        self.client(socket)?.vm_info().await
    }

    pub async fn create_vm(&self, socket: &str, machine: &Machine) -> Result<()> {
        let _guard = self.id_mu.lock(socket).await;

        let config = self.build_vm_config(machine);
        self.client(socket)?.create_vm(&config).await
    }

    pub async fn power_on(&self, socket: &str) -> Result<()> {
        let _guard = self.id_mu.lock(socket).await;
        self.client(socket)?.boot_vm().await
    }

    pub async fn power_off(&self, socket: &str) -> Result<()> {
        let _guard = self.id_mu.lock(socket).await;
        self.client(socket)?.shutdown_vm().await
    }

    pub async fn delete_vm(&self, socket: &str) -> Result<()> {
        let _guard = self.id_mu.lock(socket).await;
        self.client(socket)?.delete_vm().await
    }

    pub async fn add_disk(&self, socket: &str, status: &VolumeStatus) -> Result<()> {
        let _guard = self.id_mu.lock(socket).await;

        let client = self.client(socket)?;
        let disk = disk_config(status);
        match client.add_disk(&disk).await {
            Ok(()) => Ok(()),
            Err(err) => self.confirm_device_present(&client, &status.handle, err).await,
        }
    }

    pub async fn add_nic(&self, socket: &str, status: &NetworkInterfaceStatus) -> Result<()> {
        let _guard = self.id_mu.lock(socket).await;

        let client = self.client(socket)?;
        let id = nic_device_id(&status.name);
        let device = DeviceConfig {
            path: status.path.clone(),
            id: Some(id.clone()),
        };
        match client.add_device(&device).await {
            Ok(()) => Ok(()),
            Err(err) => self.confirm_device_present(&client, &id, err).await,
        }
    }

    pub async fn remove_device(&self, socket: &str, id: &str) -> Result<()> {
        let _guard = self.id_mu.lock(socket).await;
        self.client(socket)?.remove_device(id).await
    }

    /// A 4xx on an idempotent add counts as success only when a follow-up
    /// GET shows the device in the live config.
    async fn confirm_device_present(
        &self,
        client: &VmmClient,
        device_id: &str,
        err: anyhow::Error,
    ) -> Result<()> {
        let Some((status, _)) = protocol_error(&err) else {
            return Err(err);
        };
        if !(400..500).contains(&status) {
            return Err(err);
        }

        let vm = client.vm_info().await?;
        let disks = vm.config.disks.unwrap_or_default();
        let devices = vm.config.devices.unwrap_or_default();
        let present = disks
            .iter()
            .any(|disk| disk.id.as_deref() == Some(device_id))
            || devices
                .iter()
                .any(|device| device.id.as_deref() == Some(device_id));

        if present {
            debug!("device {device_id} already present, treating add as success");
            return Ok(());
        }
        Err(err)
    }

    pub fn build_vm_config(&self, machine: &Machine) -> VmConfig {
        let mut disks = Vec::new();

        if machine.spec.image.is_some() {
            disks.push(DiskConfig {
                path: Some(
                    self.paths
                        .machine_rootfs_file(machine.id())
                        .to_string_lossy()
                        .to_string(),
                ),
                id: Some("rootfs".to_string()),
                ..Default::default()
            });
        }

        for status in &machine.status.volume_status {
            if status.state != VolumeState::Prepared {
                continue;
            }
            disks.push(disk_config(status));
        }

        let devices: Vec<DeviceConfig> = machine
            .status
            .network_interface_status
            .iter()
            .filter(|status| status.state == crate::api::machine::NetworkInterfaceState::Prepared)
            .map(|status| DeviceConfig {
                path: status.path.clone(),
                id: Some(nic_device_id(&status.name)),
            })
            .collect();

        VmConfig {
            cpus: Some(CpusConfig {
                boot_vcpus: machine.spec.cpu,
                max_vcpus: machine.spec.cpu,
            }),
            memory: Some(MemoryConfig {
                size: machine.spec.memory_bytes,
                shared: Some(true),
            }),
            payload: PayloadConfig {
                firmware: Some(self.firmware_path.to_string_lossy().to_string()),
                ..Default::default()
            },
            platform: Some(PlatformConfig {
                uuid: Some(machine.id().to_string()),
                oem_strings: machine
                    .spec
                    .ignition
                    .as_ref()
                    .map(|ignition| vec![BASE64_STANDARD.encode(ignition)]),
            }),
            console: Some(ConsoleConfig {
                mode: ConsoleMode::Off,
            }),
            serial: Some(ConsoleConfig {
                mode: ConsoleMode::Tty,
            }),
            disks: if disks.is_empty() { None } else { Some(disks) },
            devices: if devices.is_empty() {
                None
            } else {
                Some(devices)
            },
        }
    }
}

fn disk_config(status: &VolumeStatus) -> DiskConfig {
    match status.kind {
        VolumeType::File => DiskConfig {
            path: Some(status.path.clone()),
            id: Some(status.handle.clone()),
            ..Default::default()
        },
        VolumeType::Socket => DiskConfig {
            id: Some(status.handle.clone()),
            vhost_user: Some(true),
            vhost_socket: Some(status.path.clone()),
            ..Default::default()
        },
    }
}

/// Benign hypervisor error bodies tolerated during power transitions.
pub fn is_benign_power_error(err: &anyhow::Error) -> bool {
    let Some((_, body)) = protocol_error(err) else {
        return false;
    };

    let benign = body.contains("not booted")
        || body.contains("not running")
        || body.contains("already running");
    if !benign {
        // best-effort string match; keep the raw body visible when it misses
        warn!("unrecognized hypervisor error body: {body}");
    }
    benign
}

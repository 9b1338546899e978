use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{Metadata, Object};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: Metadata,
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

impl Object for Machine {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Control socket of the hypervisor instance assigned to this machine.
    /// Set once by the reconciler and persisted before any REST call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_socket_path: Option<String>,

    #[serde(default)]
    pub power: PowerState,

    pub cpu: i64,
    pub memory_bytes: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignition: Option<Vec<u8>>,

    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineStatus {
    #[serde(default)]
    pub volume_status: Vec<VolumeStatus>,
    #[serde(default)]
    pub network_interface_status: Vec<NetworkInterfaceStatus>,
    #[serde(default)]
    pub state: MachineState,
    #[serde(default)]
    pub image_ref: String,
    #[serde(default)]
    pub observed_generation: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    #[default]
    Pending,
    Running,
    Suspended,
    Terminating,
    Terminated,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    #[default]
    PowerOn,
    PowerOff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(default)]
    pub device: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_disk: Option<EmptyDiskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_disk: Option<LocalDiskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<VolumeConnection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmptyDiskSpec {
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDiskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConnection {
    pub driver: String,
    pub handle: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub secret_data: HashMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_data: Option<HashMap<String, Vec<u8>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub name: String,
    #[serde(default)]
    pub kind: VolumeType,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub state: VolumeState,
    #[serde(default)]
    pub size: i64,
}

impl VolumeStatus {
    /// Status entry for a volume the reconciler has not touched yet.
    pub fn pending(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().to_string(),
            kind: VolumeType::default(),
            path: String::new(),
            handle: String::new(),
            state: VolumeState::Pending,
            size: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    #[default]
    Pending,
    Prepared,
    Attached,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeType {
    #[default]
    #[serde(rename = "file")]
    File,
    #[serde(rename = "socket")]
    Socket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfaceStatus {
    pub name: String,
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub state: NetworkInterfaceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<NetworkInterfaceType>,
    #[serde(default)]
    pub path: String,
}

impl NetworkInterfaceStatus {
    pub fn pending(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().to_string(),
            handle: String::new(),
            state: NetworkInterfaceState::Pending,
            kind: None,
            path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkInterfaceState {
    #[default]
    Pending,
    Prepared,
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkInterfaceType {
    #[serde(rename = "pci")]
    Pci,
    #[serde(rename = "tap")]
    Tap,
}

/// Applied by the store on create: new machines start out Pending.
pub fn machine_create_strategy(machine: &mut Machine) {
    machine.status = MachineStatus {
        state: MachineState::Pending,
        ..Default::default()
    };
}

impl Machine {
    pub fn volume_status(&self, name: &str) -> VolumeStatus {
        self.status
            .volume_status
            .iter()
            .find(|status| status.name == name)
            .cloned()
            .unwrap_or_else(|| VolumeStatus::pending(name))
    }

    pub fn network_interface_status(&self, name: &str) -> NetworkInterfaceStatus {
        self.status
            .network_interface_status
            .iter()
            .find(|status| status.name == name)
            .cloned()
            .unwrap_or_else(|| NetworkInterfaceStatus::pending(name))
    }
}

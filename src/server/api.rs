// Wire types of the machine-runtime RPC carried over the provider socket.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    api::machine::{
        Machine, MachineState, NetworkInterfaceSpec, NetworkInterfaceStatus, PowerState,
        VolumeSpec, VolumeStatus,
    },
    constants::CLASS_LABEL,
    recorder::Event,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    #[serde(flatten)]
    pub call: RpcCall,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcCall {
    CreateMachine(CreateMachineRequest),
    DeleteMachine(DeleteMachineRequest),
    ListMachines(ListMachinesRequest),
    UpdateMachinePower(UpdateMachinePowerRequest),
    AttachVolume(AttachVolumeRequest),
    DetachVolume(DetachVolumeRequest),
    AttachNetworkInterface(AttachNetworkInterfaceRequest),
    DetachNetworkInterface(DetachNetworkInterfaceRequest),
    Status(StatusRequest),
    ListEvents(ListEventsRequest),
    Exec(ExecRequest),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed request; retrying will not help.
    Invalid,
    NotFound,
    /// Transient server-side failure; safe to retry.
    Unavailable,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateMachineRequest {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub class: String,
    #[serde(default)]
    pub power: PowerState,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub ignition: Option<Vec<u8>>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteMachineRequest {
    pub machine_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListMachinesRequest {
    #[serde(default)]
    pub filter: Option<MachineFilter>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MachineFilter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub label_selector: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateMachinePowerRequest {
    pub machine_id: String,
    pub power: PowerState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttachVolumeRequest {
    pub machine_id: String,
    pub volume: VolumeSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetachVolumeRequest {
    pub machine_id: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AttachNetworkInterfaceRequest {
    pub machine_id: String,
    pub network_interface: NetworkInterfaceSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetachNetworkInterfaceRequest {
    pub machine_id: String,
    pub name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StatusRequest {}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListEventsRequest {
    #[serde(default)]
    pub filter: Option<EventFilter>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub label_selector: HashMap<String, String>,
    #[serde(default)]
    pub events_from_time: i64,
    #[serde(default)]
    pub events_to_time: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecRequest {
    pub machine_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MachineView {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub class: String,
    pub power: PowerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub volumes: Vec<VolumeSpec>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub state: MachineState,
    pub volume_status: Vec<VolumeStatus>,
    pub network_interface_status: Vec<NetworkInterfaceStatus>,
    #[serde(default)]
    pub image_ref: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub generation: i64,
    pub observed_generation: i64,
}

impl MachineView {
    pub fn from_machine(machine: &Machine) -> Self {
        Self {
            id: machine.metadata.id.clone(),
            labels: machine.metadata.labels.clone(),
            annotations: machine.metadata.annotations.clone(),
            class: machine
                .metadata
                .labels
                .get(CLASS_LABEL)
                .cloned()
                .unwrap_or_default(),
            power: machine.spec.power,
            image: machine.spec.image.clone(),
            volumes: machine.spec.volumes.clone(),
            network_interfaces: machine.spec.network_interfaces.clone(),
            state: machine.status.state,
            volume_status: machine.status.volume_status.clone(),
            network_interface_status: machine.status.network_interface_status.clone(),
            image_ref: machine.status.image_ref.clone(),
            created_at: machine.metadata.created_at,
            deleted_at: machine.metadata.deleted_at,
            generation: machine.metadata.generation,
            observed_generation: machine.status.observed_generation,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateMachineResponse {
    pub machine: MachineView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListMachinesResponse {
    pub machines: Vec<MachineView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MachineClassCapabilities {
    pub cpu: i64,
    pub memory: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MachineClassStatus {
    pub name: String,
    pub capabilities: MachineClassCapabilities,
    pub quantity: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub machine_class_status: Vec<MachineClassStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListEventsResponse {
    pub events: Vec<Event>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecResponse {
    pub url: String,
}

use serde::{Deserialize, Serialize};

use crate::{
    api::{
        Metadata, Object,
        machine::{NetworkInterfaceSpec, NetworkInterfaceStatus},
    },
    constants::{NIC_DEVICE_SEPARATOR, NIC_ID_PREFIX, NIC_ID_SEPARATOR},
};

/// A network interface is a standalone record keyed by machine id and NIC
/// name. The machine references it by name only; finalizers on both records
/// encode the back-reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub metadata: Metadata,
    pub spec: NetworkInterfaceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NetworkInterfaceStatus>,
}

impl Object for NetworkInterface {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// Applied by the store on create: fresh NIC records report Pending.
pub fn nic_create_strategy(nic: &mut NetworkInterface) {
    nic.status = Some(NetworkInterfaceStatus::pending(&nic.spec.name));
}

/// `NIC--<machineID>--<nicName>`
pub fn nic_record_id(machine_id: &str, nic_name: &str) -> String {
    format!("{NIC_ID_PREFIX}{NIC_ID_SEPARATOR}{machine_id}{NIC_ID_SEPARATOR}{nic_name}")
}

pub fn machine_id_from_nic_record_id(id: &str) -> Option<&str> {
    let rest = id.strip_prefix(NIC_ID_PREFIX)?.strip_prefix(NIC_ID_SEPARATOR)?;
    let (machine_id, _) = rest.split_once(NIC_ID_SEPARATOR)?;
    if machine_id.is_empty() {
        return None;
    }
    Some(machine_id)
}

pub fn nic_name_from_nic_record_id(id: &str) -> Option<&str> {
    let rest = id.strip_prefix(NIC_ID_PREFIX)?.strip_prefix(NIC_ID_SEPARATOR)?;
    let (_, name) = rest.split_once(NIC_ID_SEPARATOR)?;
    if name.is_empty() {
        return None;
    }
    Some(name)
}

/// `NIC//<nicName>`, the device id used in the hypervisor config so the
/// reconciler can correlate live devices back to NIC records.
pub fn nic_device_id(nic_name: &str) -> String {
    format!("{NIC_ID_PREFIX}{NIC_DEVICE_SEPARATOR}{nic_name}")
}

pub fn nic_name_from_device_id(device_id: &str) -> Option<&str> {
    let name = device_id
        .strip_prefix(NIC_ID_PREFIX)?
        .strip_prefix(NIC_DEVICE_SEPARATOR)?;
    if name.is_empty() || name.contains(NIC_DEVICE_SEPARATOR) {
        return None;
    }
    Some(name)
}

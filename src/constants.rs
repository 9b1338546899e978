pub const MACHINE_FINALIZER: &str = "machine";
pub const NETWORK_INTERFACE_FINALIZER: &str = "nic";

pub const MANAGER_LABEL: &str = "chv-provider/manager";
pub const CLASS_LABEL: &str = "chv-provider/class";
pub const MACHINE_MANAGER: &str = "chv-provider";

pub const DEFAULT_WORKER_COUNT: usize = 15;

/// Prefix and separator joining a machine id and NIC name into a NIC record id.
pub const NIC_ID_PREFIX: &str = "NIC";
pub const NIC_ID_SEPARATOR: &str = "--";
/// Delimiter embedded in hypervisor device ids for NICs.
pub const NIC_DEVICE_SEPARATOR: &str = "//";

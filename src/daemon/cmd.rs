use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use chv_provider::mcr::MachineClass;

fn default_root_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".chv-provider"),
        None => PathBuf::from("/var/lib/chv-provider"),
    }
}

fn parse_machine_class(value: &str) -> Result<MachineClass, String> {
    let parts: Vec<&str> = value.split(',').collect();
    if parts.len() != 3 {
        return Err("invalid machine class format: expected name,cpu,memory".to_string());
    }

    let cpu: i64 = parts[1]
        .parse()
        .map_err(|_| format!("invalid cpu value: {}", parts[1]))?;
    let memory_bytes: i64 = parts[2]
        .parse()
        .map_err(|_| format!("invalid memory value: {}", parts[2]))?;

    Ok(MachineClass {
        name: parts[0].to_string(),
        cpu,
        memory_bytes,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NicPluginKind {
    Isolated,
    Apinet,
}

#[derive(Debug, Parser)]
#[command(name = "chv-provider", about = "Node-local cloud-hypervisor machine provider")]
pub struct Cli {
    /// Address of the machine-runtime Unix socket.
    #[arg(long, default_value = "/var/run/chv-provider.sock")]
    pub address: PathBuf,

    /// Directory where the provider manages its content.
    #[arg(long, default_value_os_t = default_root_dir())]
    pub provider_root_dir: PathBuf,

    /// Directory of the machine store. Defaults to <root>/store/machine.
    #[arg(long)]
    pub provider_machine_store_dir: Option<PathBuf>,

    /// Directory holding the cloud-hypervisor control sockets.
    #[arg(long)]
    pub cloud_hypervisor_sockets_path: PathBuf,

    /// Path of the cloud-hypervisor firmware image.
    #[arg(long)]
    pub cloud_hypervisor_firmware_path: PathBuf,

    /// Path of the qemu-storage-daemon QMP socket.
    #[arg(long, default_value_os_t = default_root_dir().join("qmp.sock"))]
    pub qmp_socket_path: PathBuf,

    /// Supported machine classes (format: name,cpu,memory). Repeatable.
    #[arg(long = "machine-class", value_parser = parse_machine_class)]
    pub machine_classes: Vec<MachineClass>,

    /// Network interface plugin to use.
    #[arg(long, value_enum, default_value_t = NicPluginKind::Isolated)]
    pub nic_plugin: NicPluginKind,

    /// Node name reported to apinet (required with --nic-plugin apinet).
    #[arg(long)]
    pub apinet_node_name: Option<String>,

    /// Base URL of the apinet API (required with --nic-plugin apinet).
    #[arg(long)]
    pub apinet_url: Option<String>,

    /// Number of reconcile workers per controller.
    #[arg(long, default_value_t = chv_provider::constants::DEFAULT_WORKER_COUNT)]
    pub worker_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_machine_class() {
        let class = parse_machine_class("sample,2,2147483648").expect("failed to parse");
        assert_eq!(class.name, "sample");
        assert_eq!(class.cpu, 2);
        assert_eq!(class.memory_bytes, 2147483648);

        assert!(parse_machine_class("sample,2").is_err());
        assert!(parse_machine_class("sample,two,3").is_err());
    }
}

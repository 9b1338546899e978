// Machine-runtime handlers: every mutation is a store write, convergence is
// reconciler work.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::{
    api::{
        Metadata,
        machine::{Machine, MachineSpec, MachineStatus, VolumeSpec},
    },
    constants::{CLASS_LABEL, MACHINE_MANAGER, MANAGER_LABEL},
    errors::Invalid,
    machinery::store::is_version_conflict,
    server::{
        Server,
        api::{
            AttachNetworkInterfaceRequest, AttachVolumeRequest, CreateMachineRequest,
            CreateMachineResponse, DeleteMachineRequest, DetachNetworkInterfaceRequest,
            DetachVolumeRequest, EventFilter, ExecRequest, ExecResponse, ListEventsRequest,
            ListEventsResponse, ListMachinesRequest, ListMachinesResponse, MachineClassCapabilities,
            MachineClassStatus, MachineFilter, MachineView, StatusRequest, StatusResponse,
            UpdateMachinePowerRequest,
        },
    },
};

fn validate_volume_spec(volume: &VolumeSpec) -> Result<()> {
    if volume.name.is_empty() {
        return Err(Invalid("volume name must not be empty".into()).into());
    }

    let sources = [
        volume.empty_disk.is_some(),
        volume.local_disk.is_some(),
        volume.connection.is_some(),
    ];
    if sources.iter().filter(|set| **set).count() != 1 {
        return Err(Invalid(format!(
            "volume {} must specify exactly one of emptyDisk, localDisk or connection",
            volume.name
        ))
        .into());
    }
    Ok(())
}

impl Server {
    pub(crate) async fn create_machine(
        &self,
        request: CreateMachineRequest,
    ) -> Result<CreateMachineResponse> {
        debug!("creating machine from request");

        let Some(class) = self.machine_classes.get(&request.class) else {
            return Err(Invalid(format!("machine class {} not supported", request.class)).into());
        };

        for volume in &request.volumes {
            validate_volume_spec(volume)?;
        }
        for nic in &request.network_interfaces {
            if nic.name.is_empty() {
                return Err(Invalid("network interface name must not be empty".into()).into());
            }
        }

        let mut metadata = Metadata::new(Uuid::new_v4().to_string());
        metadata.labels = request.labels;
        metadata.annotations = request.annotations;
        metadata
            .labels
            .insert(CLASS_LABEL.to_string(), request.class.clone());
        metadata
            .labels
            .insert(MANAGER_LABEL.to_string(), MACHINE_MANAGER.to_string());

        let machine = Machine {
            metadata,
            spec: MachineSpec {
                api_socket_path: None,
                power: request.power,
                cpu: class.cpu.max(1),
                memory_bytes: class.memory_bytes,
                image: request.image,
                ignition: request.ignition,
                volumes: request.volumes,
                network_interfaces: request.network_interfaces,
            },
            status: MachineStatus::default(),
        };

        let machine = self
            .machines
            .create(machine)
            .await
            .context("failed to create machine")?;

        Ok(CreateMachineResponse {
            machine: MachineView::from_machine(&machine),
        })
    }

    pub(crate) async fn delete_machine(&self, request: DeleteMachineRequest) -> Result<()> {
        self.update_machine(&request.machine_id, |machine| {
            if machine.metadata.deleted_at.is_none() {
                machine.metadata.deleted_at = Some(Utc::now());
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub(crate) async fn list_machines(
        &self,
        request: ListMachinesRequest,
    ) -> Result<ListMachinesResponse> {
        let filter = request.filter.unwrap_or_default();
        let machines = self.machines.list().await?;

        let machines = machines
            .iter()
            .filter(|machine| machine_matches(machine, &filter))
            .map(MachineView::from_machine)
            .collect();

        Ok(ListMachinesResponse { machines })
    }

    pub(crate) async fn update_machine_power(
        &self,
        request: UpdateMachinePowerRequest,
    ) -> Result<()> {
        self.update_machine(&request.machine_id, |machine| {
            if machine.spec.power != request.power {
                machine.spec.power = request.power;
                machine.metadata.generation += 1;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub(crate) async fn attach_volume(&self, request: AttachVolumeRequest) -> Result<()> {
        validate_volume_spec(&request.volume)?;

        self.update_machine(&request.machine_id, |machine| {
            if machine
                .spec
                .volumes
                .iter()
                .any(|volume| volume.name == request.volume.name)
            {
                return Err(Invalid(format!(
                    "volume {} already attached to machine {}",
                    request.volume.name, request.machine_id
                ))
                .into());
            }

            let mut volume = request.volume.clone();
            volume.deleted_at = None;
            machine.spec.volumes.push(volume);
            machine.metadata.generation += 1;
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Detach only stamps the deletion timestamp; physical removal happens in
    /// the reconcile loop.
    pub(crate) async fn detach_volume(&self, request: DetachVolumeRequest) -> Result<()> {
        self.update_machine(&request.machine_id, |machine| {
            let Some(volume) = machine
                .spec
                .volumes
                .iter_mut()
                .find(|volume| volume.name == request.name)
            else {
                return Err(Invalid(format!(
                    "volume {} not found in machine {}",
                    request.name, request.machine_id
                ))
                .into());
            };

            if volume.deleted_at.is_none() {
                volume.deleted_at = Some(Utc::now());
                machine.metadata.generation += 1;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub(crate) async fn attach_network_interface(
        &self,
        request: AttachNetworkInterfaceRequest,
    ) -> Result<()> {
        if request.network_interface.name.is_empty() {
            return Err(Invalid("network interface name must not be empty".into()).into());
        }

        self.update_machine(&request.machine_id, |machine| {
            if machine
                .spec
                .network_interfaces
                .iter()
                .any(|nic| nic.name == request.network_interface.name)
            {
                return Err(Invalid(format!(
                    "network interface {} already attached to machine {}",
                    request.network_interface.name, request.machine_id
                ))
                .into());
            }

            let mut nic = request.network_interface.clone();
            nic.deleted_at = None;
            machine.spec.network_interfaces.push(nic);
            machine.metadata.generation += 1;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub(crate) async fn detach_network_interface(
        &self,
        request: DetachNetworkInterfaceRequest,
    ) -> Result<()> {
        self.update_machine(&request.machine_id, |machine| {
            let Some(nic) = machine
                .spec
                .network_interfaces
                .iter_mut()
                .find(|nic| nic.name == request.name)
            else {
                return Err(Invalid(format!(
                    "network interface {} not found in machine {}",
                    request.name, request.machine_id
                ))
                .into());
            };

            if nic.deleted_at.is_none() {
                nic.deleted_at = Some(Utc::now());
                machine.metadata.generation += 1;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub(crate) fn status(&self, _request: StatusRequest) -> StatusResponse {
        let machine_class_status = self
            .machine_classes
            .list()
            .into_iter()
            .map(|class| MachineClassStatus {
                name: class.name,
                capabilities: MachineClassCapabilities {
                    cpu: class.cpu,
                    memory: class.memory_bytes,
                },
                quantity: 1000,
            })
            .collect();

        StatusResponse {
            machine_class_status,
        }
    }

    pub(crate) fn list_events(&self, request: ListEventsRequest) -> ListEventsResponse {
        let filter = request.filter.unwrap_or_default();
        let events = self
            .recorder
            .list()
            .into_iter()
            .filter(|event| event_matches(event, &filter))
            .collect();

        ListEventsResponse { events }
    }

    pub(crate) fn exec(&self, _request: ExecRequest) -> ExecResponse {
        ExecResponse { url: String::new() }
    }

    async fn update_machine<F>(&self, machine_id: &str, mutate: F) -> Result<Machine>
    where
        F: Fn(&mut Machine) -> Result<()>,
    {
        for _ in 0..5 {
            let mut machine = self.machines.get(machine_id).await?;
            mutate(&mut machine)?;
            match self.machines.update(machine).await {
                Ok(machine) => return Ok(machine),
                Err(err) if is_version_conflict(&err) => continue,
                Err(err) => return Err(err),
            }
        }
        bail!("too many conflicting writes for machine {machine_id}");
    }
}

fn machine_matches(machine: &Machine, filter: &MachineFilter) -> bool {
    if let Some(id) = &filter.id {
        if machine.metadata.id != *id {
            return false;
        }
    }

    filter
        .label_selector
        .iter()
        .all(|(key, value)| machine.metadata.labels.get(key) == Some(value))
}

fn event_matches(event: &crate::recorder::Event, filter: &EventFilter) -> bool {
    let labels_match = filter
        .label_selector
        .iter()
        .all(|(key, value)| event.involved_object_labels.get(key) == Some(value));
    if !labels_match {
        return false;
    }

    if filter.events_from_time > 0 && filter.events_to_time > 0 {
        if event.event_time < filter.events_from_time || event.event_time > filter.events_to_time {
            return false;
        }
    }

    true
}

use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use async_channel::Receiver;
use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    api::{
        Metadata, Object,
        machine::{
            Machine, MachineState, NetworkInterfaceState, PowerState, VolumeState,
        },
        nic::{NetworkInterface, nic_device_id, nic_name_from_device_id, nic_record_id},
    },
    constants::{DEFAULT_WORKER_COUNT, MACHINE_FINALIZER},
    errors::{Fatal, is_fatal, is_invalid},
    host::Paths,
    machinery::{
        event::{EventHandler, EventSource},
        store::{Store, WatchEvent, is_not_found},
        workqueue::WorkQueue,
    },
    oci::{ImageCache, is_pulling},
    plugins::{nic::NetworkInterfacePlugin, volume::VolumePluginManager},
    raw::{CreateOption, Raw},
    recorder::{EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING, EventRecorder},
    vmm::{
        Manager, is_benign_power_error, is_unknown_socket,
        client::is_vm_not_created,
        types::{VmConfig, VmState},
    },
};

pub struct MachineReconcilerOptions {
    pub image_cache: Arc<dyn ImageCache>,
    pub raw: Raw,
    pub paths: Paths,
    pub worker_count: usize,
}

pub struct MachineReconciler {
    machines: Arc<Store<Machine>>,
    nics: Arc<Store<NetworkInterface>>,
    recorder: Arc<EventRecorder>,

    image_cache: Arc<dyn ImageCache>,
    raw: Raw,
    paths: Paths,

    vmm: Arc<Manager>,
    volume_plugins: Arc<VolumePluginManager>,
    nic_plugin: Arc<dyn NetworkInterfacePlugin>,

    queue: WorkQueue,
    queue_rx: Receiver<String>,
    worker_count: usize,
}

struct EnqueueMachine {
    queue: WorkQueue,
}

#[async_trait]
impl EventHandler<Machine> for EnqueueMachine {
    async fn handle(&self, event: &WatchEvent<Machine>) {
        self.queue.add(event.object.id()).await;
    }
}

impl MachineReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machines: Arc<Store<Machine>>,
        nics: Arc<Store<NetworkInterface>>,
        recorder: Arc<EventRecorder>,
        vmm: Arc<Manager>,
        volume_plugins: Arc<VolumePluginManager>,
        nic_plugin: Arc<dyn NetworkInterfacePlugin>,
        opts: MachineReconcilerOptions,
    ) -> Arc<Self> {
        let (queue, queue_rx) = WorkQueue::new();
        let worker_count = if opts.worker_count == 0 {
            DEFAULT_WORKER_COUNT
        } else {
            opts.worker_count
        };

        Arc::new(Self {
            machines,
            nics,
            recorder,
            image_cache: opts.image_cache,
            raw: opts.raw,
            paths: opts.paths,
            vmm,
            volume_plugins,
            nic_plugin,
            queue,
            queue_rx,
            worker_count,
        })
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Registers event and pull-done handlers and spawns the worker pool.
    pub fn start(self: &Arc<Self>, machine_events: &EventSource<Machine>) -> Vec<JoinHandle<()>> {
        machine_events.add_handler(Arc::new(EnqueueMachine {
            queue: self.queue.clone(),
        }));

        // a finished pull re-enqueues every machine waiting for that image
        let this = self.clone();
        self.image_cache.add_pull_done_listener(Box::new(move |event| {
            let this = this.clone();
            tokio::spawn(async move {
                let machines = match this.machines.list().await {
                    Ok(machines) => machines,
                    Err(err) => {
                        error!("failed to list machines after image pull: {err:#}");
                        return;
                    }
                };
                for machine in machines {
                    if machine.spec.image.as_deref() == Some(event.reference.as_str()) {
                        this.recorder.record(
                            machine.id(),
                            &machine.metadata.labels,
                            EVENT_TYPE_NORMAL,
                            "PulledImage",
                            format!("Pulled image {}", event.reference),
                        );
                        info!("image {} pulled, requeue machine {}", event.reference, machine.id());
                        this.queue.add(machine.id()).await;
                    }
                }
            });
        }));

        info!("starting {} machine workers", self.worker_count);
        (0..self.worker_count)
            .map(|_| {
                let this = self.clone();
                tokio::spawn(async move { this.worker().await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    async fn worker(self: Arc<Self>) {
        while let Ok(id) = self.queue_rx.recv().await {
            self.process(&id).await;
            self.queue.done(&id).await;
        }
    }

    /// Runs one reconcile and applies the retry policy: rate-limited requeue
    /// for everything except Invalid (surfaced only) and Fatal (the record is
    /// marked failed and left alone).
    pub async fn process(&self, id: &str) {
        match self.reconcile(id).await {
            Ok(()) => self.queue.forget(id),
            Err(err) if is_fatal(&err) => {
                error!("machine {id} failed fatally: {err:#}");
                self.mark_failed(id, &err).await;
            }
            Err(err) if is_invalid(&err) => {
                error!("machine {id} has an invalid spec: {err:#}");
            }
            Err(err) => {
                warn!("failed to reconcile machine {id}: {err:#}");
                self.queue.add_rate_limited(id).await;
            }
        }
    }

    async fn mark_failed(&self, id: &str, err: &anyhow::Error) {
        let Ok(mut machine) = self.machines.get(id).await else {
            return;
        };
        machine.status.state = MachineState::Failed;
        machine.status.observed_generation = machine.metadata.generation;
        self.recorder.record(
            id,
            &machine.metadata.labels,
            EVENT_TYPE_WARNING,
            "MachineFailed",
            format!("{err:#}"),
        );
        if let Err(err) = self.machines.update(machine).await {
            warn!("failed to mark machine {id} as failed: {err:#}");
        }
    }

    pub async fn reconcile(&self, id: &str) -> Result<()> {
        debug!("reconciling machine {id}");

        let machine = match self.machines.get(id).await {
            Ok(machine) => machine,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(err).context("failed to fetch machine from store"),
        };

        if machine.metadata.deleted_at.is_some() {
            self.delete_machine(machine).await?;
            info!("successfully deleted machine {id}");
            return Ok(());
        }

        // a fatally failed machine is left alone until its spec changes
        if machine.status.state == MachineState::Failed
            && machine.status.observed_generation == machine.metadata.generation
        {
            return Ok(());
        }

        if !machine.metadata.has_finalizer(MACHINE_FINALIZER) {
            let mut machine = machine;
            machine.metadata.add_finalizer(MACHINE_FINALIZER);
            self.machines
                .update(machine)
                .await
                .context("failed to set finalizer")?;
            // the update event re-enters the loop
            return Ok(());
        }

        self.paths
            .make_machine_dirs(id)
            .await
            .context("failed to make machine directories")?;

        let machine = match self.reconcile_image(machine).await? {
            Some(machine) => machine,
            // image still pulling, the pull-done listener requeues
            None => return Ok(()),
        };

        let machine = self.ensure_api_socket(machine).await?;
        let api_socket = machine
            .spec
            .api_socket_path
            .clone()
            .expect("api socket just ensured");

        self.vmm
            .ping(&api_socket)
            .await
            .context("failed to ping vmm")?;

        let machine = self
            .reconcile_volumes(machine)
            .await
            .context("failed to reconcile volumes")?;
        let machine = self
            .reconcile_nics(machine)
            .await
            .context("failed to reconcile nics")?;

        let vm = match self.vmm.get_vm(&api_socket).await {
            Ok(vm) => vm,
            Err(err) if is_vm_not_created(&err) => {
                if !self.ready_to_create(&machine) {
                    debug!("machine {id} is not ready for vm creation yet");
                    return Ok(());
                }

                info!("creating vm for machine {id}");
                self.vmm
                    .create_vm(&api_socket, &machine)
                    .await
                    .context("failed to create vm")?;

                // continue post-create work in a fresh pass
                self.queue.add(id).await;
                return Ok(());
            }
            Err(err) => return Err(err).context("failed to get vm"),
        };

        let platform_uuid = vm
            .config
            .platform
            .as_ref()
            .and_then(|platform| platform.uuid.clone())
            .unwrap_or_default();
        if platform_uuid != machine.id() {
            return Err(Fatal(format!(
                "machine id {} and vm platform uuid {platform_uuid} do not match",
                machine.id()
            ))
            .into());
        }

        match machine.spec.power {
            PowerState::PowerOn if vm.state != VmState::Running => {
                if let Err(err) = self.vmm.power_on(&api_socket).await {
                    if !is_benign_power_error(&err) {
                        return Err(err).context("failed to power on vm");
                    }
                }
            }
            PowerState::PowerOff if vm.state == VmState::Running => {
                if let Err(err) = self.vmm.power_off(&api_socket).await {
                    if !is_benign_power_error(&err) {
                        return Err(err).context("failed to power off vm");
                    }
                }
            }
            _ => {}
        }

        let machine = self
            .attach_detach_disks(machine, &vm.config)
            .await
            .context("failed to attach/detach disks")?;
        let machine = self
            .attach_detach_nics(machine, &vm.config)
            .await
            .context("failed to attach/detach nics")?;

        let mut machine = machine;
        machine.status.state = match machine.spec.power {
            PowerState::PowerOn => MachineState::Running,
            PowerState::PowerOff => MachineState::Terminated,
        };
        machine.status.image_ref = machine.spec.image.clone().unwrap_or_default();
        machine.status.observed_generation = machine.metadata.generation;
        self.machines
            .update(machine)
            .await
            .context("failed to update machine status")?;

        debug!("reconciled machine {id}");
        Ok(())
    }

    /// Materializes the root disk from the image cache. Returns None while
    /// the image is still being pulled.
    async fn reconcile_image(&self, mut machine: Machine) -> Result<Option<Machine>> {
        let Some(image_ref) = machine.spec.image.clone() else {
            return Ok(Some(machine));
        };

        let image = match self.image_cache.get(&image_ref).await {
            Ok(image) => image,
            Err(err) if is_pulling(&err) => {
                info!("image {image_ref} not in cache yet, machine {}", machine.id());
                if machine.status.state != MachineState::Pending {
                    machine.status.state = MachineState::Pending;
                    self.machines.update(machine).await?;
                }
                return Ok(None);
            }
            Err(err) => return Err(err).context("failed to get image from cache"),
        };

        let root_fs_file = self.paths.machine_rootfs_file(machine.id());
        if !crate::osutils::regular_file_exists(&root_fs_file).await? {
            self.raw
                .create(
                    &root_fs_file,
                    CreateOption::WithSourceFile(image.root_fs_path.to_string_lossy().to_string()),
                )
                .await
                .context("failed to create root fs disk")?;
        }

        Ok(Some(machine))
    }

    /// Assigns a free control socket and persists the assignment before any
    /// REST call is made against it.
    async fn ensure_api_socket(&self, machine: Machine) -> Result<Machine> {
        if machine.spec.api_socket_path.is_some() {
            return Ok(machine);
        }

        let socket = self.vmm.get_free_api_socket()?;
        let mut machine = machine;
        machine.spec.api_socket_path = Some(socket.clone());

        match self.machines.update(machine).await {
            Ok(machine) => Ok(machine),
            Err(err) => {
                // assignment did not stick, the socket goes back to the pool
                self.vmm.free_api_socket(&socket);
                Err(err).context("failed to persist api socket assignment")
            }
        }
    }

    async fn reconcile_volumes(&self, machine: Machine) -> Result<Machine> {
        let mut updated_specs = Vec::new();
        let mut updated_status = Vec::new();

        for volume in &machine.spec.volumes {
            let plugin = self.volume_plugins.find_plugin_by_spec(volume)?;
            let status = machine.volume_status(&volume.name);

            if volume.deleted_at.is_some() {
                if status.state != VolumeState::Attached {
                    debug!("deleting detached volume {}", volume.name);
                    plugin
                        .delete(&volume.name, machine.id())
                        .await
                        .with_context(|| format!("failed to delete volume {}", volume.name))?;
                    continue;
                }
                debug!("volume {} still attached, deferring delete", volume.name);
            }

            let mut applied = plugin
                .apply(volume, machine.id())
                .await
                .with_context(|| format!("failed to apply volume {}", volume.name))?;
            if status.state == VolumeState::Attached {
                applied.state = VolumeState::Attached;
            }

            updated_specs.push(volume.clone());
            updated_status.push(applied);
        }

        let mut machine = machine;
        machine.spec.volumes = updated_specs;
        machine.status.volume_status = updated_status;
        self.machines
            .update(machine)
            .await
            .context("failed to update machine volume status")
    }

    /// Applies the NIC plugin for every machine NIC spec and keeps the
    /// standalone NIC records in sync (creation, machine finalizer, deletion
    /// timestamps).
    async fn reconcile_nics(&self, machine: Machine) -> Result<Machine> {
        let mut updated_specs = Vec::new();
        let mut updated_status = Vec::new();

        for nic in &machine.spec.network_interfaces {
            let status = machine.network_interface_status(&nic.name);

            if nic.deleted_at.is_some() {
                if status.state != NetworkInterfaceState::Attached {
                    debug!("deleting detached nic {}", nic.name);
                    self.nic_plugin
                        .delete(&nic.name, machine.id())
                        .await
                        .with_context(|| format!("failed to delete nic {}", nic.name))?;
                    self.release_nic_record(machine.id(), &nic.name).await?;
                    continue;
                }
                debug!("nic {} still attached, deferring delete", nic.name);
            } else {
                self.ensure_nic_record(&machine, &nic.name).await?;
            }

            let mut applied = self
                .nic_plugin
                .apply(nic, machine.id())
                .await
                .with_context(|| format!("failed to apply nic {}", nic.name))?;
            if status.state == NetworkInterfaceState::Attached {
                applied.state = NetworkInterfaceState::Attached;
            }

            updated_specs.push(nic.clone());
            updated_status.push(applied);
        }

        let mut machine = machine;
        machine.spec.network_interfaces = updated_specs;
        machine.status.network_interface_status = updated_status;
        self.machines
            .update(machine)
            .await
            .context("failed to update machine nic status")
    }

    /// While a machine references a NIC, the NIC record exists and carries the
    /// machine finalizer.
    async fn ensure_nic_record(&self, machine: &Machine, nic_name: &str) -> Result<()> {
        let record_id = nic_record_id(machine.id(), nic_name);

        let record = match self.nics.get(&record_id).await {
            Ok(record) => record,
            Err(err) if is_not_found(&err) => {
                let Some(spec) = machine
                    .spec
                    .network_interfaces
                    .iter()
                    .find(|nic| nic.name == nic_name)
                else {
                    return Ok(());
                };

                let mut metadata = Metadata::new(&record_id);
                metadata.add_finalizer(MACHINE_FINALIZER);
                let record = NetworkInterface {
                    metadata,
                    spec: spec.clone(),
                    status: None,
                };
                self.nics
                    .create(record)
                    .await
                    .context("failed to create nic record")?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if !record.metadata.has_finalizer(MACHINE_FINALIZER) {
            let mut record = record;
            record.metadata.add_finalizer(MACHINE_FINALIZER);
            self.nics
                .update(record)
                .await
                .context("failed to add machine finalizer to nic record")?;
        }
        Ok(())
    }

    /// Releases the machine's hold on a NIC record and marks it for deletion.
    async fn release_nic_record(&self, machine_id: &str, nic_name: &str) -> Result<()> {
        let record_id = nic_record_id(machine_id, nic_name);

        let mut record = match self.nics.get(&record_id).await {
            Ok(record) => record,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        record.metadata.remove_finalizer(MACHINE_FINALIZER);
        if record.metadata.deleted_at.is_none() {
            record.metadata.deleted_at = Some(Utc::now());
        }
        match self.nics.update(record).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err).context("failed to release nic record"),
        }
    }

    /// A VM is created only once the root disk is materialized and every
    /// volume and NIC reached Prepared.
    fn ready_to_create(&self, machine: &Machine) -> bool {
        let volumes_ready = machine
            .spec
            .volumes
            .iter()
            .filter(|volume| volume.deleted_at.is_none())
            .all(|volume| machine.volume_status(&volume.name).state == VolumeState::Prepared);

        let nics_ready = machine
            .spec
            .network_interfaces
            .iter()
            .filter(|nic| nic.deleted_at.is_none())
            .all(|nic| {
                machine.network_interface_status(&nic.name).state
                    == NetworkInterfaceState::Prepared
            });

        volumes_ready && nics_ready
    }

    async fn attach_detach_disks(&self, machine: Machine, vm: &VmConfig) -> Result<Machine> {
        let api_socket = machine
            .spec
            .api_socket_path
            .clone()
            .expect("reconcile reached attach without a socket");

        let live: HashSet<String> = vm
            .disks
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|disk| disk.id)
            .collect();

        let mut updated_status = Vec::new();
        for volume in &machine.spec.volumes {
            let mut status = machine.volume_status(&volume.name);

            if volume.deleted_at.is_none() {
                if !live.contains(&status.handle) {
                    if status.state != VolumeState::Prepared {
                        debug!("skip disk attachment, volume {} not prepared", volume.name);
                        updated_status.push(status);
                        continue;
                    }
                    self.vmm
                        .add_disk(&api_socket, &status)
                        .await
                        .with_context(|| format!("failed to add disk {}", volume.name))?;
                    info!("added disk {} to machine {}", volume.name, machine.id());
                }
                status.state = VolumeState::Attached;
                updated_status.push(status);
            } else if live.contains(&status.handle) {
                self.vmm
                    .remove_device(&api_socket, &status.handle)
                    .await
                    .with_context(|| format!("failed to remove disk {}", volume.name))?;
                info!("removed disk {} from machine {}", volume.name, machine.id());

                // back to Prepared for one tick so the plugin delete runs in
                // the next volume pass
                status.state = VolumeState::Prepared;
                updated_status.push(status);
                self.queue.add(machine.id()).await;
            } else {
                debug!("disk {} not present, updating status", volume.name);
                status.state = VolumeState::Prepared;
                updated_status.push(status);
            }
        }

        let mut machine = machine;
        machine.status.volume_status = updated_status;
        self.machines
            .update(machine)
            .await
            .context("failed to update machine disk status")
    }

    async fn attach_detach_nics(&self, machine: Machine, vm: &VmConfig) -> Result<Machine> {
        let api_socket = machine
            .spec
            .api_socket_path
            .clone()
            .expect("reconcile reached attach without a socket");

        let live: HashSet<String> = vm
            .devices
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|device| device.id)
            .filter_map(|id| nic_name_from_device_id(&id).map(str::to_string))
            .collect();

        let mut updated_status = Vec::new();
        for nic in &machine.spec.network_interfaces {
            let mut status = machine.network_interface_status(&nic.name);

            if nic.deleted_at.is_none() {
                if !live.contains(&nic.name) {
                    if status.state != NetworkInterfaceState::Prepared {
                        debug!("skip nic attachment, nic {} not prepared", nic.name);
                        updated_status.push(status);
                        continue;
                    }
                    self.vmm
                        .add_nic(&api_socket, &status)
                        .await
                        .with_context(|| format!("failed to add nic {}", nic.name))?;
                    info!("added nic {} to machine {}", nic.name, machine.id());
                }
                status.state = NetworkInterfaceState::Attached;
                updated_status.push(status);
            } else if live.contains(&nic.name) {
                self.vmm
                    .remove_device(&api_socket, &nic_device_id(&nic.name))
                    .await
                    .with_context(|| format!("failed to remove nic {}", nic.name))?;
                info!("removed nic {} from machine {}", nic.name, machine.id());

                status.state = NetworkInterfaceState::Prepared;
                updated_status.push(status);
                // force a follow-up pass that removes the plugin-side resource
                self.queue.add(machine.id()).await;
            } else {
                debug!("nic {} not present, updating status", nic.name);
                status.state = NetworkInterfaceState::Prepared;
                updated_status.push(status);
            }
        }

        let mut machine = machine;
        machine.status.network_interface_status = updated_status;
        self.machines
            .update(machine)
            .await
            .context("failed to update machine nic status")
    }

    /// Tears the machine down step by step; every step tolerates partial
    /// progress from a prior crash.
    async fn delete_machine(&self, machine: Machine) -> Result<()> {
        let id = machine.id().to_string();

        if machine.status.state != MachineState::Terminating {
            let mut machine = machine.clone();
            machine.status.state = MachineState::Terminating;
            if let Err(err) = self.machines.update(machine).await {
                if !is_not_found(&err) {
                    debug!("failed to mark machine {id} terminating: {err:#}");
                }
            }
        }
        // re-read so later updates do not conflict
        let machine = match self.machines.get(&id).await {
            Ok(machine) => machine,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(err),
        };

        if let Some(socket) = machine.spec.api_socket_path.clone() {
            match self.vmm.get_vm(&socket).await {
                Ok(vm) if vm.state == VmState::Running => {
                    info!("powering off machine {id}");
                    if let Err(err) = self.vmm.power_off(&socket).await {
                        if !is_vm_not_created(&err) && !is_benign_power_error(&err) {
                            return Err(err).context("failed to power off machine");
                        }
                    }
                }
                Ok(_) => {}
                Err(err)
                    if is_vm_not_created(&err) || is_unknown_socket(&err) => {}
                Err(err) => return Err(err).context("failed to get vm state"),
            }

            match self.vmm.delete_vm(&socket).await {
                Ok(()) => {}
                Err(err) if is_vm_not_created(&err) || is_unknown_socket(&err) => {}
                Err(err) => return Err(err).context("failed to delete vm"),
            }
        }

        debug!("deleting volumes of machine {id}");
        for volume in &machine.spec.volumes {
            let plugin = self.volume_plugins.find_plugin_by_spec(volume)?;
            plugin
                .delete(&volume.name, &id)
                .await
                .with_context(|| format!("failed to delete volume {}", volume.name))?;
        }

        debug!("deleting nics of machine {id}");
        for nic in &machine.spec.network_interfaces {
            self.nic_plugin
                .delete(&nic.name, &id)
                .await
                .with_context(|| format!("failed to delete nic {}", nic.name))?;
            self.release_nic_record(&id, &nic.name).await?;
        }

        if let Some(socket) = machine.spec.api_socket_path.clone() {
            self.vmm.free_api_socket(&socket);
        }

        self.paths
            .remove_machine_dir(&id)
            .await
            .context("failed to remove machine directory")?;

        let mut machine = machine;
        machine.metadata.remove_finalizer(MACHINE_FINALIZER);
        match self.machines.update(machine).await {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(err).context("failed to update machine metadata"),
        }

        match self.machines.delete(&id).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

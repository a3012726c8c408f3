//! The VM Supervisor (spec.md §4.4): per-VM state machine, resource
//! reservation, and process watch. The largest component in the system.

use crate::bridge::BridgeManager;
use crate::capture::VmTapResolver;
use crate::counter::Counter;
use crate::error::{Error, Result};
use crate::host_tuner::HostTuner;
use crate::persistence;
use crate::rate_limiter::RateLimiter;
use crate::selector::Selector;
use crate::vm::monitor::{commands as qmp, MonitorConnection};
use crate::vm::process::{ExitReason, HypervisorProcess};
use crate::vm::record::{DiskMode, VmConfig, VmRecord, VmState};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::instrument;
use uuid::Uuid;
use vmord_utils::system::{self, ProcessStats};

/// Builds the hypervisor process and its monitor connection for a VM.
/// Argument construction for the hypervisor binary is explicitly out of
/// scope (spec.md §1); this trait is the seam where that concrete
/// knowledge lives, so the Supervisor itself never touches it.
#[async_trait]
pub trait HypervisorLauncher: Send + Sync + 'static {
    async fn launch(&self, record: &VmRecord) -> Result<Box<dyn HypervisorProcess>>;
    async fn connect_monitor(
        &self,
        record: &VmRecord,
        attempts: u32,
        delay: Duration,
    ) -> Result<Box<dyn MonitorConnection>>;
}

pub struct LaunchAck {
    pub name: String,
    pub result: Result<i64>,
}

struct VmHandle {
    kill_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

pub struct VmSupervisor {
    table: RwLock<HashMap<i64, RwLock<VmRecord>>>,
    names: RwLock<HashMap<String, i64>>,
    id_counter: Counter,
    bridges: Arc<BridgeManager>,
    rate_limiter: Arc<RateLimiter>,
    launcher: Arc<dyn HypervisorLauncher>,
    host_tuner: Arc<HostTuner>,
    base_dir: PathBuf,
    monitor_connect_attempts: u32,
    monitor_connect_delay: Duration,
    monitors: Mutex<HashMap<i64, Mutex<Box<dyn MonitorConnection>>>>,
    handles: Mutex<HashMap<i64, VmHandle>>,
}

impl VmSupervisor {
    pub fn new(
        bridges: Arc<BridgeManager>,
        rate_limiter: Arc<RateLimiter>,
        launcher: Arc<dyn HypervisorLauncher>,
        host_tuner: Arc<HostTuner>,
        base_dir: PathBuf,
        monitor_connect_attempts: u32,
        monitor_connect_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
            id_counter: Counter::new(),
            bridges,
            rate_limiter,
            launcher,
            host_tuner,
            base_dir,
            monitor_connect_attempts,
            monitor_connect_delay,
            monitors: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Enqueues a batch of VMs in BUILDING; returns an ack channel that
    /// yields one `LaunchAck` per VM and closes once every launch in the
    /// batch has completed (spec.md §4.4).
    #[instrument(skip(self, configs))]
    pub async fn launch(self: &Arc<Self>, configs: Vec<VmConfig>) -> mpsc::UnboundedReceiver<LaunchAck> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut prepared = Vec::new();
        {
            // The whole batch runs the preamble under one critical
            // section so collisions *within* the batch are caught
            // consistently, matching conflicts against already-active
            // VMs (spec.md §4.4 launch algorithm, step 2).
            let mut table = self.table.write().await;
            let mut names = self.names.write().await;
            let mut reserved_macs = self.active_macs(&table).await;
            let mut reserved_persistent_disks = self.active_persistent_disks(&table).await;

            for config in configs {
                match self
                    .run_preamble(&mut table, &mut names, &mut reserved_macs, &mut reserved_persistent_disks, config)
                    .await
                {
                    Ok(record) => prepared.push(Ok(record)),
                    Err((name, err)) => prepared.push(Err((name, err))),
                }
            }
        }

        for outcome in prepared {
            match outcome {
                Ok(record) => {
                    let supervisor = Arc::clone(self);
                    let tx = tx.clone();
                    tokio::spawn(async move { supervisor.launch_one(record, tx).await });
                }
                Err((name, err)) => {
                    let _ = tx.send(LaunchAck { name, result: Err(err) });
                }
            }
        }

        rx
    }

    async fn active_macs(&self, table: &HashMap<i64, RwLock<VmRecord>>) -> HashSet<String> {
        let mut macs = HashSet::new();
        for record in table.values() {
            let record = record.read().await;
            if record.state.is_active() {
                for net in &record.config.networks {
                    if let Some(mac) = &net.mac {
                        macs.insert(mac.clone());
                    }
                }
            }
        }
        macs
    }

    async fn active_persistent_disks(&self, table: &HashMap<i64, RwLock<VmRecord>>) -> HashSet<PathBuf> {
        let mut disks = HashSet::new();
        for record in table.values() {
            let record = record.read().await;
            if record.state.is_active() {
                for disk in &record.config.disks {
                    if disk.mode == DiskMode::Persistent {
                        disks.insert(disk.path.clone());
                    }
                }
            }
        }
        disks
    }

    /// Launch preamble (spec.md §4.4): MAC/disk conflict checks, UUID
    /// assignment, runtime directory creation. Runs under the table
    /// write lock so the whole batch sees a consistent view.
    async fn run_preamble(
        &self,
        table: &mut HashMap<i64, RwLock<VmRecord>>,
        names: &mut HashMap<String, i64>,
        reserved_macs: &mut HashSet<String>,
        reserved_persistent_disks: &mut HashSet<PathBuf>,
        mut config: VmConfig,
    ) -> std::result::Result<VmRecord, (String, Error)> {
        if names.contains_key(&config.name) {
            return Err((config.name.clone(), Error::conflict(format!("VM name {} already in use", config.name))));
        }

        // A disk path already held by an active Persistent-mode disk
        // conflicts regardless of the mode the *new* VM requests it in -
        // a Snapshot request against a path another VM holds Persistent
        // is still a conflict (spec.md §4.4, §8 scenario 2).
        for disk in &config.disks {
            if reserved_persistent_disks.contains(&disk.path) {
                return Err((
                    config.name.clone(),
                    Error::conflict(format!("disk {} already in use by another VM", disk.path.display())),
                ));
            }
        }

        for net in &mut config.networks {
            match &net.mac {
                Some(mac) if reserved_macs.contains(mac) => {
                    return Err((config.name.clone(), Error::conflict(format!("MAC {mac} already in use"))));
                }
                Some(_) => {}
                None => {
                    net.mac = Some(generate_unused_mac(reserved_macs));
                }
            }
        }

        if config.uuid.is_none() {
            config.uuid = Some(Uuid::new_v4());
        }

        for disk in &config.disks {
            if disk.mode == DiskMode::Persistent {
                reserved_persistent_disks.insert(disk.path.clone());
            }
        }
        for net in &config.networks {
            if let Some(mac) = &net.mac {
                reserved_macs.insert(mac.clone());
            }
        }

        let id = self.id_counter.next();
        let runtime_dir = persistence::runtime_dir(&self.base_dir, id);
        if let Err(err) = persistence::create_runtime_dir(&runtime_dir).await {
            return Err((config.name.clone(), err));
        }

        let record = VmRecord::new(id, config.clone(), runtime_dir, Utc::now().timestamp());
        names.insert(config.name.clone(), id);
        table.insert(id, RwLock::new(record.clone()));
        Ok(record)
    }

    async fn launch_one(self: Arc<Self>, mut record: VmRecord, tx: mpsc::UnboundedSender<LaunchAck>) {
        let name = record.config.name.clone();
        let id = record.id;

        self.rate_limiter.wait().await;

        if let Err(err) = self.create_taps(&mut record).await {
            self.set_state(id, VmState::Error).await;
            let _ = tx.send(LaunchAck { name, result: Err(err) });
            return;
        }

        if let Err(err) = persistence::write_config(&record.runtime_dir, &record.config).await {
            self.release_taps(&record).await;
            self.set_state(id, VmState::Error).await;
            let _ = tx.send(LaunchAck { name, result: Err(err) });
            return;
        }
        let _ = persistence::write_name(&record.runtime_dir, &name).await;

        let mut process = match self.launcher.launch(&record).await {
            Ok(process) => process,
            Err(err) => {
                self.release_taps(&record).await;
                self.set_state(id, VmState::Error).await;
                let _ = tx.send(LaunchAck { name, result: Err(err) });
                return;
            }
        };
        record.hypervisor_pid = Some(process.pid());

        let monitor = match self
            .launcher
            .connect_monitor(&record, self.monitor_connect_attempts, self.monitor_connect_delay)
            .await
        {
            Ok(monitor) => monitor,
            Err(err) => {
                let _ = process.kill().await;
                self.release_taps(&record).await;
                self.set_state(id, VmState::Error).await;
                let _ = tx.send(LaunchAck { name, result: Err(err) });
                return;
            }
        };

        self.monitors.lock().await.insert(id, Mutex::new(monitor));
        self.replace_record(id, record).await;
        self.set_state(id, VmState::Paused).await;

        // Best-effort: affinity scheduling is opt-in (spec.md §4.5) and
        // `assign` fails with InvalidArgument whenever it's disabled,
        // which is the common case and not worth surfacing as a launch
        // failure.
        let _ = self.host_tuner.assign(id, &HostTuner::discover_cpus()).await;

        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = Arc::clone(&self);
        let join = tokio::spawn(async move { supervisor.watch(id, process, kill_rx).await });
        self.handles.lock().await.insert(
            id,
            VmHandle {
                kill_tx: Some(kill_tx),
                join,
            },
        );

        let _ = tx.send(LaunchAck { name, result: Ok(id) });
    }

    async fn create_taps(&self, record: &mut VmRecord) -> Result<()> {
        let mut created: Vec<(String, u16)> = Vec::new();
        for net in record.config.networks.iter_mut() {
            let vlan = match self.bridges.lookup_vlan(&record.config.namespace, &net.vlan_alias).await {
                Ok(vlan) => vlan,
                Err(err) => {
                    for (tap, vlan) in created {
                        let _ = self.bridges.tap_destroy(vlan, &tap).await;
                    }
                    return Err(err);
                }
            };
            match self.bridges.tap_create(&net.bridge, vlan, None).await {
                Ok(tap) => {
                    net.tap = Some(tap.clone());
                    created.push((tap, vlan));
                }
                Err(err) => {
                    for (tap, vlan) in created {
                        let _ = self.bridges.tap_destroy(vlan, &tap).await;
                    }
                    return Err(err);
                }
            }
        }

        let taps: Vec<String> = record.config.networks.iter().filter_map(|n| n.tap.clone()).collect();
        persistence::write_taps(&record.runtime_dir, &taps).await
    }

    async fn release_taps(&self, record: &VmRecord) {
        for net in &record.config.networks {
            if let Some(tap) = &net.tap {
                if let Ok(vlan) = self.bridges.lookup_vlan(&record.config.namespace, &net.vlan_alias).await {
                    let _ = self.bridges.tap_destroy(vlan, tap).await;
                }
            }
        }
    }

    async fn watch(self: Arc<Self>, id: i64, mut process: Box<dyn HypervisorProcess>, mut kill_rx: oneshot::Receiver<()>) {
        let exit = tokio::select! {
            result = process.wait() => result,
            _ = &mut kill_rx => {
                let _ = process.kill().await;
                let _ = process.wait().await;
                Ok(ExitReason::Clean)
            }
        };

        let final_state = match exit {
            Ok(ExitReason::Clean) => VmState::Quit,
            Ok(ExitReason::Crashed) | Err(_) => VmState::Error,
        };

        if let Some(record) = self.get_record(id).await {
            self.release_taps(&record).await;
        }
        self.monitors.lock().await.remove(&id);
        self.host_tuner.unassign(id).await;
        self.set_state(id, final_state).await;
    }

    async fn set_state(&self, id: i64, state: VmState) {
        if let Some(record_lock) = self.table.read().await.get(&id) {
            let mut record = record_lock.write().await;
            record.state = state;
            let _ = persistence::write_state(&record.runtime_dir, state).await;
        }
    }

    async fn replace_record(&self, id: i64, new_record: VmRecord) {
        if let Some(record_lock) = self.table.read().await.get(&id) {
            *record_lock.write().await = new_record;
        }
    }

    pub async fn get_record(&self, id: i64) -> Option<VmRecord> {
        let table = self.table.read().await;
        let record_lock = table.get(&id)?;
        Some(record_lock.read().await.clone())
    }

    async fn id_for_name(&self, name: &str) -> Option<i64> {
        self.names.read().await.get(name).copied()
    }

    async fn matching_vms(&self, selector: &Selector) -> Vec<(i64, String, VmState)> {
        let table = self.table.read().await;
        let mut out = Vec::new();
        for (id, record_lock) in table.iter() {
            let record = record_lock.read().await;
            if selector.matches(&record.config.name, *id) {
                out.push((*id, record.config.name.clone(), record.state));
            }
        }
        out
    }

    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, selector: &Selector) -> Vec<(String, Result<()>)> {
        let wildcard = matches!(selector, Selector::Wildcard);
        let mut results = Vec::new();
        for (id, name, state) in self.matching_vms(selector).await {
            if wildcard && !matches!(state, VmState::Building | VmState::Paused) {
                continue;
            }
            results.push((name, self.start_one(id).await));
        }
        results
    }

    async fn start_one(self: &Arc<Self>, id: i64) -> Result<()> {
        let state = self
            .get_record(id)
            .await
            .ok_or_else(|| Error::not_found(format!("VM {id} not found")))?
            .state;

        match state {
            VmState::Running => Ok(()),
            VmState::Paused | VmState::Building => {
                if let Some(monitor) = self.monitors.lock().await.get(&id) {
                    monitor.lock().await.send_raw(qmp::cont()).await?;
                }
                self.set_state(id, VmState::Running).await;
                Ok(())
            }
            VmState::Quit | VmState::Error => self.relaunch(id).await,
        }
    }

    /// `start` on a QUIT (or ERROR) VM re-launches it from its preserved
    /// configuration (spec.md §4.4, §8 round-trip property). Reuses the
    /// existing id/runtime directory rather than going through the batch
    /// preamble again, since the conflict checks already passed the
    /// first time this VM launched.
    async fn relaunch(self: &Arc<Self>, id: i64) -> Result<()> {
        let record = self
            .get_record(id)
            .await
            .ok_or_else(|| Error::not_found(format!("VM {id} not found")))?;

        {
            let table = self.table.read().await;
            if let Some(record_lock) = table.get(&id) {
                record_lock.write().await.state = VmState::Building;
            }
        }

        let supervisor_record = VmRecord {
            id: record.id,
            config: record.config,
            state: VmState::Building,
            runtime_dir: record.runtime_dir,
            hypervisor_pid: None,
            hotplug: HashMap::new(),
            tags: record.tags,
            created_at_unix: record.created_at_unix,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor = Arc::clone(self);
        supervisor.launch_one(supervisor_record, tx).await;
        let ack = match rx.recv().await {
            Some(ack) => ack,
            None => return Err(Error::monitor_failure("relaunch produced no ack".to_string())),
        };
        ack.result?;

        // `launch_one` always leaves a freshly-launched VM PAUSED; `start`
        // on a QUIT/ERROR VM must end RUNNING (spec.md §8's
        // `start(kill(v))` round-trip property), so finish the same
        // Paused->Running transition `start_one` does for a VM that was
        // never killed.
        if let Some(monitor) = self.monitors.lock().await.get(&id) {
            monitor.lock().await.send_raw(qmp::cont()).await?;
        }
        self.set_state(id, VmState::Running).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, selector: &Selector) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for (id, name, state) in self.matching_vms(selector).await {
            if state != VmState::Running {
                continue;
            }
            results.push((name, self.stop_one(id).await));
        }
        results
    }

    async fn stop_one(&self, id: i64) -> Result<()> {
        if let Some(monitor) = self.monitors.lock().await.get(&id) {
            monitor.lock().await.send_raw(qmp::stop()).await?;
        }
        self.set_state(id, VmState::Paused).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn kill(&self, selector: &Selector) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for (id, name, state) in self.matching_vms(selector).await {
            if !state.is_active() {
                continue;
            }
            results.push((name, self.kill_one(id).await));
        }
        results
    }

    /// Kill is acknowledged only after taps are released (spec.md §5):
    /// this joins the watcher task, which releases taps before exiting.
    async fn kill_one(&self, id: i64) -> Result<()> {
        let handle = self.handles.lock().await.remove(&id);
        let Some(mut handle) = handle else {
            return Err(Error::not_found(format!("VM {id} has no running process")));
        };
        if let Some(kill_tx) = handle.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        handle
            .join
            .await
            .map_err(|e| Error::monitor_failure(format!("watcher task panicked: {e}")))
    }

    /// Closes every live VM's kill channel and waits for its watcher to
    /// report before returning, per the daemon shutdown contract
    /// (spec.md §5). Sends every kill signal up front so watchers tear
    /// down concurrently rather than one at a time.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let mut handles: Vec<VmHandle> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
        for handle in &mut handles {
            if let Some(kill_tx) = handle.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
        for handle in handles {
            let _ = handle.join.await;
        }
    }

    /// Removes QUIT/ERROR records from the table.
    #[instrument(skip(self))]
    pub async fn flush(&self) -> usize {
        let doomed: Vec<i64> = {
            let table = self.table.read().await;
            let mut doomed = Vec::new();
            for (id, record_lock) in table.iter() {
                if record_lock.read().await.state.is_terminal() {
                    doomed.push(*id);
                }
            }
            doomed
        };

        let mut table = self.table.write().await;
        let mut names = self.names.write().await;
        for id in &doomed {
            if let Some(record_lock) = table.remove(id) {
                names.remove(&record_lock.into_inner().config.name);
            }
        }
        doomed.len()
    }

    #[instrument(skip(self))]
    pub async fn hotplug(&self, vm_name: &str, file: PathBuf, usb_version: Option<String>) -> Result<i64> {
        let id = self.id_for_name(vm_name).await.ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        let slot = {
            let table = self.table.read().await;
            let record_lock = table.get(&id).ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
            let mut record = record_lock.write().await;
            let slot = record.next_hotplug_slot();
            record.hotplug.insert(slot, file.clone());
            slot
        };

        let monitors = self.monitors.lock().await;
        let monitor = monitors.get(&id).ok_or_else(|| Error::monitor_failure("no monitor connection".to_string()))?;
        let mut monitor = monitor.lock().await;
        monitor.send_raw(qmp::drive_add(slot, &file.display().to_string())).await?;
        monitor.send_raw(qmp::usb_add(slot, usb_version.as_deref())).await?;
        Ok(slot)
    }

    #[instrument(skip(self))]
    pub async fn hotplug_remove(&self, vm_name: &str, slot: Option<i64>) -> Result<()> {
        let id = self.id_for_name(vm_name).await.ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        let slots = {
            let table = self.table.read().await;
            let record_lock = table.get(&id).ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
            let mut record = record_lock.write().await;
            let slots: Vec<i64> = match slot {
                Some(s) => vec![s],
                None => record.hotplug.keys().copied().collect(),
            };
            for s in &slots {
                record.hotplug.remove(s);
            }
            slots
        };

        let monitors = self.monitors.lock().await;
        if let Some(monitor) = monitors.get(&id) {
            let mut monitor = monitor.lock().await;
            for s in slots {
                monitor.send_raw(qmp::usb_del(s)).await?;
                monitor.send_raw(qmp::drive_del(s)).await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn network_connect(&self, vm_name: &str, iface_idx: usize, bridge: Option<&str>, vlan_alias: &str) -> Result<()> {
        let id = self.id_for_name(vm_name).await.ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        let (tap, current_bridge) = {
            let table = self.table.read().await;
            let record_lock = table.get(&id).ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
            let record = record_lock.read().await;
            let net = record
                .config
                .networks
                .get(iface_idx)
                .ok_or_else(|| Error::invalid_argument(format!("interface index {iface_idx} out of range")))?;
            let tap = net
                .tap
                .clone()
                .ok_or_else(|| Error::invalid_argument(format!("interface {iface_idx} has no tap yet")))?;
            (tap, net.bridge.clone())
        };

        let target_bridge = bridge.unwrap_or(&current_bridge);
        let vlan = self.bridges.lookup_vlan("default", vlan_alias).await?;
        self.bridges.move_tap(&tap, target_bridge, vlan).await?;

        let table = self.table.read().await;
        if let Some(record_lock) = table.get(&id) {
            let mut record = record_lock.write().await;
            if let Some(net) = record.config.networks.get_mut(iface_idx) {
                net.bridge = target_bridge.to_string();
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn network_disconnect(&self, vm_name: &str, iface_idx: usize) -> Result<()> {
        let id = self.id_for_name(vm_name).await.ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        let (tap, vlan_alias, namespace) = {
            let table = self.table.read().await;
            let record_lock = table.get(&id).ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
            let record = record_lock.read().await;
            let net = record
                .config
                .networks
                .get(iface_idx)
                .ok_or_else(|| Error::invalid_argument(format!("interface index {iface_idx} out of range")))?;
            let tap = net
                .tap
                .clone()
                .ok_or_else(|| Error::invalid_argument(format!("interface {iface_idx} has no tap")))?;
            (tap, net.vlan_alias.clone(), record.config.namespace.clone())
        };
        let vlan = self.bridges.lookup_vlan(&namespace, &vlan_alias).await?;
        self.bridges.tap_destroy(vlan, &tap).await?;

        let table = self.table.read().await;
        if let Some(record_lock) = table.get(&id) {
            let mut record = record_lock.write().await;
            if let Some(net) = record.config.networks.get_mut(iface_idx) {
                net.tap = None;
            }
        }
        Ok(())
    }

    async fn send_monitor(&self, vm_name: &str, command: Value) -> Result<Value> {
        let id = self.id_for_name(vm_name).await.ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        let monitors = self.monitors.lock().await;
        let monitor = monitors.get(&id).ok_or_else(|| Error::monitor_failure("no monitor connection".to_string()))?;
        monitor.lock().await.send_raw(command).await
    }

    pub async fn cdrom_eject(&self, vm_name: &str, device: &str) -> Result<()> {
        self.send_monitor(vm_name, qmp::blockdev_eject(device)).await.map(|_| ())
    }

    pub async fn cdrom_change(&self, vm_name: &str, device: &str, file: &str) -> Result<()> {
        self.send_monitor(vm_name, qmp::blockdev_change(device, file)).await.map(|_| ())
    }

    pub async fn migrate(&self, vm_name: &str, target: &str) -> Result<()> {
        self.send_monitor(vm_name, qmp::migrate(target)).await.map(|_| ())
    }

    pub async fn query_migrate(&self, vm_name: &str) -> Result<Value> {
        self.send_monitor(vm_name, qmp::query_migrate()).await
    }

    pub async fn screenshot(&self, vm_name: &str, path: &str) -> Result<()> {
        self.send_monitor(vm_name, qmp::screendump(path)).await.map(|_| ())
    }

    pub async fn qmp_raw(&self, vm_name: &str, command: Value) -> Result<Value> {
        self.send_monitor(vm_name, command).await
    }

    /// Setting a tag is always an upsert.
    pub async fn tag(&self, vm_name: &str, key: &str, value: &str) -> Result<()> {
        let id = self.id_for_name(vm_name).await.ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        let table = self.table.read().await;
        let record_lock = table.get(&id).ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        record_lock.write().await.tags.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub async fn clear_tag(&self, vm_name: &str, key: &str) -> Result<()> {
        let id = self.id_for_name(vm_name).await.ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        let table = self.table.read().await;
        let record_lock = table.get(&id).ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        record_lock.write().await.tags.remove(key);
        Ok(())
    }

    /// Per-VM CPU/memory accounting read live from `/proc/<pid>/stat` and
    /// `/statm` (spec.md §6), plus a liveness check against the same pid
    /// the watcher is tracking.
    pub async fn vm_stats(&self, vm_name: &str) -> Result<ProcessStats> {
        let id = self.id_for_name(vm_name).await.ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        let record = self.get_record(id).await.ok_or_else(|| Error::not_found(format!("VM {vm_name} not found")))?;
        let pid = record
            .hypervisor_pid
            .ok_or_else(|| Error::invalid_argument(format!("VM {vm_name} has no running process")))?;
        if !system::is_process_running(pid) {
            return Err(Error::recoverable(format!("VM {vm_name}'s process {pid} is no longer running")));
        }
        Ok(system::read_process_stats(pid).await?)
    }

    /// Reading with the wildcard returns every VM's tag map.
    pub async fn get_tags(&self, selector: &Selector) -> HashMap<String, HashMap<String, String>> {
        let mut out = HashMap::new();
        for (_, name, _) in self.matching_vms(selector).await {
            if let Some(id) = self.id_for_name(&name).await {
                if let Some(record) = self.get_record(id).await {
                    out.insert(name, record.tags);
                }
            }
        }
        out
    }
}

#[async_trait]
impl VmTapResolver for VmSupervisor {
    async fn resolve_tap(&self, vm: &str, iface_index: usize) -> Result<(String, String)> {
        let id = self.id_for_name(vm).await.ok_or_else(|| Error::not_found(format!("VM {vm} not found")))?;
        let record = self.get_record(id).await.ok_or_else(|| Error::not_found(format!("VM {vm} not found")))?;
        let net = record
            .config
            .networks
            .get(iface_index)
            .ok_or_else(|| Error::invalid_argument(format!("interface index {iface_index} out of range")))?;
        let tap = net
            .tap
            .clone()
            .ok_or_else(|| Error::invalid_argument(format!("interface {iface_index} has no tap")))?;
        Ok((net.bridge.clone(), tap))
    }
}

/// Generates an unused MAC in the locally-administered range by
/// rejection sampling (spec.md §4.4 invariant 1).
fn generate_unused_mac(reserved: &HashSet<String>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let mut bytes = [0u8; 6];
        rng.fill(&mut bytes);
        // Locally administered, unicast: bit 1 set, bit 0 clear on the
        // first octet.
        bytes[0] = (bytes[0] & 0xFE) | 0x02;
        let mac = bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":");
        if !reserved.contains(&mac) {
            return mac;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::switch::MockSwitchControl;
    use crate::bridge::BridgeManager;
    use crate::rate_limiter::RateLimiter;
    use crate::vm::record::{DiskConfig, NetworkConfigEntry};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn always_ok_switch() -> Arc<dyn crate::bridge::switch::SwitchControl> {
        let mut mock = MockSwitchControl::new();
        mock.expect_bridge_exists().returning(|_| Ok(false));
        mock.expect_add_bridge().returning(|_| Ok(()));
        mock.expect_add_port().returning(|_, _, _| Ok(()));
        mock.expect_del_port().returning(|_, _| Ok(()));
        mock.expect_set_port_vlan().returning(|_, _, _| Ok(()));
        Arc::new(mock)
    }

    fn bridges(base: &std::path::Path) -> Arc<BridgeManager> {
        Arc::new(BridgeManager::new(always_ok_switch(), "mega_tap", base.to_path_buf(), 1, 4094))
    }

    struct FakeProcess {
        pid: u32,
        notify: Arc<Notify>,
    }

    #[async_trait]
    impl HypervisorProcess for FakeProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        async fn wait(&mut self) -> Result<ExitReason> {
            self.notify.notified().await;
            Ok(ExitReason::Clean)
        }

        async fn kill(&mut self) -> Result<()> {
            self.notify.notify_one();
            Ok(())
        }
    }

    struct FakeMonitor;

    #[async_trait]
    impl MonitorConnection for FakeMonitor {
        async fn send_raw(&mut self, _command: Value) -> Result<Value> {
            Ok(serde_json::json!({"return": {}}))
        }

        async fn close(&mut self) {}
    }

    struct FakeLauncher {
        next_pid: AtomicU32,
    }

    impl FakeLauncher {
        fn new() -> Self {
            Self { next_pid: AtomicU32::new(1000) }
        }
    }

    #[async_trait]
    impl HypervisorLauncher for FakeLauncher {
        async fn launch(&self, _record: &VmRecord) -> Result<Box<dyn HypervisorProcess>> {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeProcess { pid, notify: Arc::new(Notify::new()) }))
        }

        async fn connect_monitor(&self, _record: &VmRecord, _attempts: u32, _delay: Duration) -> Result<Box<dyn MonitorConnection>> {
            Ok(Box::new(FakeMonitor))
        }
    }

    fn vm_config(name: &str) -> VmConfig {
        VmConfig {
            name: name.to_string(),
            namespace: "default".to_string(),
            mem_mib: 512,
            vcpus: 1,
            disks: vec![DiskConfig { path: PathBuf::from(format!("/tmp/{name}.img")), mode: DiskMode::Snapshot }],
            networks: vec![NetworkConfigEntry {
                bridge: "default".to_string(),
                vlan_alias: "100".to_string(),
                mac: None,
                driver: "virtio-net".to_string(),
                tap: None,
            }],
            uuid: None,
        }
    }

    async fn supervisor(base: &std::path::Path) -> Arc<VmSupervisor> {
        VmSupervisor::new(
            bridges(base),
            Arc::new(RateLimiter::new(Duration::from_millis(1), 100)),
            Arc::new(FakeLauncher::new()),
            Arc::new(crate::host_tuner::HostTuner::new()),
            base.to_path_buf(),
            3,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_launch_then_stop_then_kill() {
        let _panic_checker = crate::test_support::AsyncPanicChecker::default();
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path()).await;

        let mut rx = sup.launch(vec![vm_config("vm1")]).await;
        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.name, "vm1");
        let id = ack.result.expect("launch should succeed");

        let record = sup.get_record(id).await.unwrap();
        assert_eq!(record.state, VmState::Paused);
        assert!(record.config.networks[0].mac.is_some());
        assert!(record.config.networks[0].tap.is_some());

        let started = sup.start(&Selector::parse("vm1").unwrap()).await;
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].0, "vm1");
        assert!(started[0].1.is_ok());
        assert_eq!(sup.get_record(id).await.unwrap().state, VmState::Running);

        let stopped = sup.stop(&Selector::parse("vm1").unwrap()).await;
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].0, "vm1");
        assert!(stopped[0].1.is_ok());
        assert_eq!(sup.get_record(id).await.unwrap().state, VmState::Paused);

        let killed = sup.kill(&Selector::parse("vm1").unwrap()).await;
        assert_eq!(killed.len(), 1);
        assert!(killed[0].1.is_ok());
        assert_eq!(sup.get_record(id).await.unwrap().state, VmState::Quit);
    }

    #[tokio::test]
    async fn test_start_on_quit_vm_relaunches_into_running() {
        let _panic_checker = crate::test_support::AsyncPanicChecker::default();
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path()).await;

        let mut rx = sup.launch(vec![vm_config("vm1")]).await;
        let id = rx.recv().await.unwrap().result.unwrap();

        let killed = sup.kill(&Selector::parse("vm1").unwrap()).await;
        assert!(killed[0].1.is_ok());
        assert_eq!(sup.get_record(id).await.unwrap().state, VmState::Quit);

        let started = sup.start(&Selector::parse("vm1").unwrap()).await;
        assert_eq!(started.len(), 1);
        assert!(started[0].1.is_ok(), "relaunch failed: {:?}", started[0].1);
        assert_eq!(sup.get_record(id).await.unwrap().state, VmState::Running);
    }

    #[tokio::test]
    async fn test_shutdown_joins_every_watcher() {
        let _panic_checker = crate::test_support::AsyncPanicChecker::default();
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path()).await;

        let mut rx = sup.launch(vec![vm_config("vm1"), vm_config("vm2")]).await;
        rx.recv().await.unwrap().result.unwrap();
        rx.recv().await.unwrap().result.unwrap();

        sup.shutdown().await;

        for name in ["vm1", "vm2"] {
            let id = sup.id_for_name(name).await.unwrap();
            assert_eq!(sup.get_record(id).await.unwrap().state, VmState::Quit);
        }
    }

    #[tokio::test]
    async fn test_launch_batch_name_conflict_only_fails_the_duplicate() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path()).await;

        let mut rx = sup.launch(vec![vm_config("vm1")]).await;
        let first = rx.recv().await.unwrap();
        assert!(first.result.is_ok());

        let mut rx2 = sup.launch(vec![vm_config("vm1"), vm_config("vm2")]).await;
        let mut results = HashMap::new();
        for _ in 0..2 {
            let ack = rx2.recv().await.unwrap();
            results.insert(ack.name, ack.result);
        }
        assert!(matches!(results.get("vm1"), Some(Err(Error::Conflict(_)))));
        assert!(matches!(results.get("vm2"), Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_persistent_disk_conflict_regardless_of_new_vms_disk_mode() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path()).await;

        let mut holder = vm_config("vm1");
        holder.disks[0].mode = DiskMode::Persistent;
        let mut rx = sup.launch(vec![holder]).await;
        rx.recv().await.unwrap().result.unwrap();

        // vm2 requests the same path in Snapshot mode, not Persistent;
        // it must still conflict because vm1 holds the path Persistent.
        let mut contender = vm_config("vm2");
        contender.disks[0].path = PathBuf::from("/tmp/vm1.img");
        contender.disks[0].mode = DiskMode::Snapshot;
        let mut rx2 = sup.launch(vec![contender]).await;
        let ack = rx2.recv().await.unwrap();
        assert!(matches!(ack.result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_tags_roundtrip() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path()).await;
        let mut rx = sup.launch(vec![vm_config("vm1")]).await;
        let ack = rx.recv().await.unwrap();
        ack.result.unwrap();

        sup.tag("vm1", "owner", "alice").await.unwrap();
        let all = sup.get_tags(&Selector::parse("*").unwrap()).await;
        assert_eq!(all.get("vm1").unwrap().get("owner"), Some(&"alice".to_string()));

        sup.clear_tag("vm1", "owner").await.unwrap();
        let all = sup.get_tags(&Selector::parse("*").unwrap()).await;
        assert!(all.get("vm1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hotplug_then_remove_reuses_slot() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path()).await;
        let mut rx = sup.launch(vec![vm_config("vm1")]).await;
        rx.recv().await.unwrap().result.unwrap();

        let slot0 = sup.hotplug("vm1", PathBuf::from("/tmp/a.iso"), None).await.unwrap();
        assert_eq!(slot0, 0);
        let slot1 = sup.hotplug("vm1", PathBuf::from("/tmp/b.iso"), None).await.unwrap();
        assert_eq!(slot1, 1);

        sup.hotplug_remove("vm1", Some(0)).await.unwrap();
        let slot2 = sup.hotplug("vm1", PathBuf::from("/tmp/c.iso"), None).await.unwrap();
        assert_eq!(slot2, 0);
    }

    #[tokio::test]
    async fn test_flush_removes_only_terminal_vms() {
        let base = tempfile::tempdir().unwrap();
        let sup = supervisor(base.path()).await;
        let mut rx = sup.launch(vec![vm_config("vm1")]).await;
        let id = rx.recv().await.unwrap().result.unwrap();

        assert_eq!(sup.flush().await, 0);
        sup.kill(&Selector::parse("vm1").unwrap()).await;
        assert_eq!(sup.get_record(id).await.unwrap().state, VmState::Quit);
        assert_eq!(sup.flush().await, 1);
        assert!(sup.get_record(id).await.is_none());
    }
}


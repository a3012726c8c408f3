//! Explicit construction of every component and their collaborators.
//! There are no module-level singletons (spec.md §9 redesign flag): a
//! `Core` is built once from a loaded [`crate::config::Config`] and
//! handed to whatever transport the daemon binary wires up.

use crate::bridge::switch::CliSwitch;
use crate::bridge::BridgeManager;
use crate::capture::{CaptureEngine, RealPacketSink};
use crate::config::Config;
use crate::error::Result;
use crate::host_tuner::HostTuner;
use crate::persistence;
use crate::rate_limiter::RateLimiter;
use crate::vm::monitor::{self, MonitorConnection};
use crate::vm::process::{self, HypervisorProcess};
use crate::vm::record::{DiskMode, VmRecord};
use crate::vm::supervisor::{HypervisorLauncher, VmSupervisor};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Builds the hypervisor's command line from a [`VmRecord`] and forks it.
/// Detailed hypervisor argument construction beyond what's needed to
/// attach disks/network/monitor is out of scope (spec.md §1); this is
/// the minimal invocation the Supervisor needs to drive the rest of the
/// lifecycle.
pub struct QemuLauncher {
    binary: String,
    kill_signal: i32,
}

impl QemuLauncher {
    pub fn new(binary: impl Into<String>, kill_signal: i32) -> Self {
        Self {
            binary: binary.into(),
            kill_signal,
        }
    }

    fn build_args(record: &VmRecord) -> Vec<String> {
        let monitor_path = persistence::monitor_socket_path(&record.runtime_dir);
        let pid_path = persistence::pid_file_path(&record.runtime_dir);
        let mut args = vec![
            "-name".to_string(),
            record.config.name.clone(),
            "-m".to_string(),
            record.config.mem_mib.to_string(),
            "-smp".to_string(),
            record.config.vcpus.to_string(),
            "-qmp".to_string(),
            format!("unix:{},server,nowait", monitor_path.display()),
            "-pidfile".to_string(),
            pid_path.display().to_string(),
        ];
        if let Some(uuid) = record.config.uuid {
            args.push("-uuid".to_string());
            args.push(uuid.to_string());
        }
        for disk in &record.config.disks {
            let snapshot_suffix = if disk.mode == DiskMode::Snapshot { ",snapshot=on" } else { "" };
            args.push("-drive".to_string());
            args.push(format!("file={}{}", disk.path.display(), snapshot_suffix));
        }
        for net in &record.config.networks {
            let Some(tap) = &net.tap else { continue };
            args.push("-netdev".to_string());
            args.push(format!("tap,id={tap},ifname={tap},script=no,downscript=no"));
            args.push("-device".to_string());
            let mac = net.mac.clone().unwrap_or_default();
            args.push(format!("{},netdev={},mac={}", net.driver, tap, mac));
        }
        args
    }
}

#[async_trait]
impl HypervisorLauncher for QemuLauncher {
    async fn launch(&self, record: &VmRecord) -> Result<Box<dyn HypervisorProcess>> {
        let args = Self::build_args(record);
        let child = process::spawn(&self.binary, &args, &record.runtime_dir, self.kill_signal)?;
        Ok(Box::new(child))
    }

    async fn connect_monitor(&self, record: &VmRecord, attempts: u32, delay: Duration) -> Result<Box<dyn MonitorConnection>> {
        let path = persistence::monitor_socket_path(&record.runtime_dir);
        let conn = monitor::connect_with_retry(&path, attempts, delay).await?;
        Ok(Box::new(conn))
    }
}

/// The daemon's top-level handle: every subsystem, wired together once
/// at startup from a [`Config`]. Every external interface (spec.md §6)
/// is implemented as a thin adapter over this struct's methods.
pub struct Core {
    pub config: Config,
    pub bridges: Arc<BridgeManager>,
    pub vms: Arc<VmSupervisor>,
    pub host_tuner: Arc<HostTuner>,
    pub capture: Arc<CaptureEngine>,
}

impl Core {
    pub fn new(config: Config) -> Self {
        let bridges = Arc::new(BridgeManager::new(
            Arc::new(CliSwitch::new(config.switch_bin.clone())),
            config.tap_prefix.clone(),
            config.base_dir.clone(),
            config.vlan_min,
            config.vlan_max,
        ));

        let rate_limiter = Arc::new(RateLimiter::new(config.launch_rate(), config.launch_burst));
        let launcher: Arc<dyn HypervisorLauncher> = Arc::new(QemuLauncher::new(
            std::env::var("VMORD_HYPERVISOR_BIN").unwrap_or_else(|_| "qemu-system-x86_64".to_string()),
            config.kill_signal,
        ));

        let host_tuner = Arc::new(HostTuner::new());

        let vms = VmSupervisor::new(
            Arc::clone(&bridges),
            rate_limiter,
            launcher,
            Arc::clone(&host_tuner),
            config.base_dir.clone(),
            config.monitor_connect_attempts,
            config.monitor_connect_delay(),
        );

        let capture = Arc::new(CaptureEngine::new(
            Arc::clone(&bridges),
            Arc::clone(&vms) as Arc<dyn crate::capture::VmTapResolver>,
            Arc::new(RealPacketSink),
        ));

        Self {
            config,
            bridges,
            vms,
            host_tuner,
            capture,
        }
    }

    /// Runs on startup before anything else touches the daemon's state:
    /// destroys any leftover bridges/taps/processes from a prior crash
    /// (spec.md §7).
    pub async fn recover(&self) -> crate::recovery::RecoveryReport {
        let switch = self.bridges.switch_handle();
        crate::recovery::nuke(&self.config.base_dir, &self.config.tap_prefix, &switch).await
    }
}

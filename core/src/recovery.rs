//! Nuke / Recovery (spec.md §4.7): crash recovery scan. Destructive and
//! manual - not run automatically except at explicit daemon startup.

use crate::bridge::switch::SwitchControl;
use crate::bridge::BridgeManager;
use std::path::Path;
use std::sync::Arc;
use sysinfo::{Pid, PidExt, ProcessExt, Signal, System, SystemExt};
use tokio::fs;
use tracing::{info, warn};
use vmord_utils::system::read_pid_file;

pub struct RecoveryReport {
    pub pids_killed: Vec<u32>,
    pub taps_reclaimed: Vec<String>,
    pub bridges_destroyed: Vec<String>,
}

/// Walks `base_dir` for `qemu.pid` files and SIGKILLs the pids found,
/// then reclaims every host interface carrying `tap_prefix`, then
/// destroys any bridge recorded in the on-disk journal with
/// `pre_existed = false`, then removes `base_dir` itself.
pub async fn nuke(base_dir: &Path, tap_prefix: &str, switch: &Arc<dyn SwitchControl>) -> RecoveryReport {
    let pids_killed = kill_stale_processes(base_dir).await;
    let taps_reclaimed = reclaim_taps(tap_prefix, switch).await;
    let bridges_destroyed = destroy_non_preexisting_bridges(base_dir, switch).await;

    if let Err(err) = fs::remove_dir_all(base_dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove base dir {}: {err}", base_dir.display());
        }
    }

    RecoveryReport {
        pids_killed,
        taps_reclaimed,
        bridges_destroyed,
    }
}

async fn kill_stale_processes(base_dir: &Path) -> Vec<u32> {
    let mut killed = Vec::new();
    let mut entries = match fs::read_dir(base_dir).await {
        Ok(entries) => entries,
        Err(_) => return killed,
    };

    let mut sys = System::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let pid_file = entry.path().join("qemu.pid");
        if !pid_file.exists() {
            continue;
        }
        let Ok(pid) = read_pid_file(&pid_file).await else {
            continue;
        };
        sys.refresh_process(Pid::from_u32(pid));
        if let Some(process) = sys.process(Pid::from_u32(pid)) {
            if process.kill_with(Signal::Kill).unwrap_or(false) {
                info!("killed stale process {pid}");
                killed.push(pid);
            }
        }
    }
    killed
}

async fn reclaim_taps(tap_prefix: &str, switch: &Arc<dyn SwitchControl>) -> Vec<String> {
    let mut reclaimed = Vec::new();
    let mut entries = match fs::read_dir("/sys/class/net").await {
        Ok(entries) => entries,
        Err(_) => return reclaimed,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(tap_prefix) {
            continue;
        }
        // Best effort: the bridge is unknown at recovery time, so every
        // configured bridge is asked to forget the tap; a switch that
        // doesn't know the port responds with a normalized not-found
        // error which we swallow here.
        let _ = switch.del_port("*", &name).await;
        if vmord_utils::cmd::run_cmd("ip", ["link", "delete", &name]).await.is_ok() {
            reclaimed.push(name);
        }
    }
    reclaimed
}

/// Reads the bridge journal (`<base>/bridges`, one `name,pre_existed`
/// pair per line) and destroys every entry recorded as not pre-existing.
async fn destroy_non_preexisting_bridges(base_dir: &Path, switch: &Arc<dyn SwitchControl>) -> Vec<String> {
    let mut destroyed = Vec::new();
    let journal_path = base_dir.join("bridges");
    let Ok(content) = fs::read_to_string(&journal_path).await else {
        return destroyed;
    };
    for line in content.lines() {
        let Some((name, pre_existed)) = line.split_once(',') else {
            continue;
        };
        if pre_existed.trim() == "true" {
            continue;
        }
        if switch.del_bridge(name.trim()).await.is_ok() {
            destroyed.push(name.trim().to_string());
        }
    }
    destroyed
}

/// Appends `(bridge, pre_existed)` to the on-disk journal so a later
/// crash-recovery pass knows which bridges it is allowed to delete.
pub async fn record_bridge_in_journal(base_dir: &Path, bridge_manager: &BridgeManager, name: &str) -> std::io::Result<()> {
    let journal_path = base_dir.join("bridges");
    let Some(bridge) = bridge_manager.get_bridge_if_exists(name).await else {
        return Ok(());
    };
    let pre_existed = bridge.lock().await.pre_existed;
    fs::create_dir_all(base_dir).await?;
    let mut content = fs::read_to_string(&journal_path).await.unwrap_or_default();
    content.push_str(&format!("{name},{pre_existed}\n"));
    fs::write(&journal_path, content).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::switch::MockSwitchControl;

    #[tokio::test]
    async fn test_destroy_non_preexisting_bridges_skips_preexisting() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bridges"), "br-fresh,false\nbr-old,true\n")
            .await
            .unwrap();

        let mut mock = MockSwitchControl::new();
        mock.expect_del_bridge()
            .withf(|name| name == "br-fresh")
            .returning(|_| Ok(()));
        let switch: Arc<dyn SwitchControl> = Arc::new(mock);

        let destroyed = destroy_non_preexisting_bridges(dir.path(), &switch).await;
        assert_eq!(destroyed, vec!["br-fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_kill_stale_processes_reads_pid_files() {
        let dir = tempfile::tempdir().unwrap();
        let vm_dir = dir.path().join("99");
        fs::create_dir_all(&vm_dir).await.unwrap();

        let mut child = tokio::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("failed to spawn sleep");
        let pid = child.id().expect("child has a pid");
        fs::write(vm_dir.join("qemu.pid"), pid.to_string()).await.unwrap();

        let killed = kill_stale_processes(dir.path()).await;
        assert_eq!(killed, vec![pid]);

        let _ = child.wait().await;
    }
}

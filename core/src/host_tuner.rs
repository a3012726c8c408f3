//! Host Resource Tuner (spec.md §4.5): KSM toggle, hugepage path storage,
//! and the CPU-affinity scheduler.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use sysinfo::{System, SystemExt};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::instrument;
use vmord_utils::system::{self, MemInfo};

const KSM_RUN_PATH: &str = "/sys/kernel/mm/ksm/run";

#[derive(Debug, Default)]
struct KsmState {
    /// The value read from `KSM_RUN_PATH` before we enabled it, restored
    /// on disable.
    previous_run_value: Option<String>,
    enabled: bool,
}

#[derive(Debug, Default)]
struct AffinityState {
    enabled: bool,
    /// Restricts selection to this set of CPU strings when non-empty.
    allowed_cpus: HashSet<String>,
    /// CPU string -> VM ids currently pinned there.
    assignments: BTreeMap<String, Vec<i64>>,
}

pub struct HostTuner {
    ksm: Mutex<KsmState>,
    hugepage_path: Mutex<Option<PathBuf>>,
    affinity: Mutex<AffinityState>,
}

impl Default for HostTuner {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTuner {
    pub fn new() -> Self {
        Self {
            ksm: Mutex::new(KsmState::default()),
            hugepage_path: Mutex::new(None),
            affinity: Mutex::new(AffinityState::default()),
        }
    }

    #[instrument(skip(self))]
    pub async fn enable_ksm(&self) -> Result<()> {
        let mut state = self.ksm.lock().await;
        if state.enabled {
            return Ok(());
        }
        let previous = fs::read_to_string(KSM_RUN_PATH)
            .await
            .map(|s| s.trim().to_string())
            .ok();
        fs::write(KSM_RUN_PATH, b"1")
            .await
            .map_err(|e| Error::external_failure(format!("failed to enable KSM: {e}")))?;
        state.previous_run_value = previous;
        state.enabled = true;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn disable_ksm(&self) -> Result<()> {
        let mut state = self.ksm.lock().await;
        if !state.enabled {
            return Ok(());
        }
        let restore = state.previous_run_value.clone().unwrap_or_else(|| "0".to_string());
        fs::write(KSM_RUN_PATH, restore.as_bytes())
            .await
            .map_err(|e| Error::external_failure(format!("failed to disable KSM: {e}")))?;
        state.enabled = false;
        state.previous_run_value = None;
        Ok(())
    }

    pub async fn is_ksm_enabled(&self) -> bool {
        self.ksm.lock().await.enabled
    }

    pub async fn set_hugepage_path(&self, path: PathBuf) {
        *self.hugepage_path.lock().await = Some(path);
    }

    pub async fn clear_hugepage_path(&self) {
        *self.hugepage_path.lock().await = None;
    }

    pub async fn hugepage_path(&self) -> Option<PathBuf> {
        self.hugepage_path.lock().await.clone()
    }

    /// Enables CPU-affinity scheduling. An empty `cpu_filter` means every
    /// discovered CPU is eligible.
    pub async fn enable_affinity(&self, cpu_filter: Vec<String>) {
        let mut state = self.affinity.lock().await;
        state.enabled = true;
        state.allowed_cpus = cpu_filter.into_iter().collect();
    }

    pub async fn disable_affinity(&self) {
        let mut state = self.affinity.lock().await;
        state.enabled = false;
        state.allowed_cpus.clear();
        state.assignments.clear();
    }

    /// Binds `vm_id` to the CPU with the smallest current VM count; ties
    /// break on the lexicographically smallest CPU string. `all_cpus`
    /// is the full set of CPU strings discovered on the host.
    #[instrument(skip(self, all_cpus))]
    pub async fn assign(&self, vm_id: i64, all_cpus: &[String]) -> Result<String> {
        let mut state = self.affinity.lock().await;
        if !state.enabled {
            return Err(Error::invalid_argument("affinity scheduling is not enabled"));
        }

        let eligible: Vec<&String> = if state.allowed_cpus.is_empty() {
            all_cpus.iter().collect()
        } else {
            all_cpus.iter().filter(|c| state.allowed_cpus.contains(*c)).collect()
        };
        if eligible.is_empty() {
            return Err(Error::invalid_argument("no eligible CPUs for affinity assignment"));
        }

        let mut best: Option<(&String, usize)> = None;
        for cpu in eligible {
            let count = state.assignments.get(cpu).map(Vec::len).unwrap_or(0);
            best = match best {
                None => Some((cpu, count)),
                Some((best_cpu, best_count)) => {
                    if count < best_count || (count == best_count && cpu < best_cpu) {
                        Some((cpu, count))
                    } else {
                        Some((best_cpu, best_count))
                    }
                }
            };
        }
        let chosen = best.expect("eligible set was non-empty").0.clone();
        state.assignments.entry(chosen.clone()).or_default().push(vm_id);
        Ok(chosen)
    }

    pub async fn unassign(&self, vm_id: i64) {
        let mut state = self.affinity.lock().await;
        for vms in state.assignments.values_mut() {
            vms.retain(|id| *id != vm_id);
        }
    }

    /// Enumerates the CPU strings this host reports, in `sysinfo`'s
    /// enumeration order. The VM Supervisor passes this to `assign` so
    /// affinity selection always sees the live CPU set.
    pub fn discover_cpus() -> Vec<String> {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.cpus().iter().enumerate().map(|(i, _)| i.to_string()).collect()
    }

    /// Host-wide memory total/available, per spec.md §6's `/proc/meminfo`
    /// interface.
    pub async fn host_meminfo(&self) -> Result<MemInfo> {
        Ok(system::read_meminfo().await?)
    }

    /// Host-wide 1/5/15-minute load average, per spec.md §6's
    /// `/proc/loadavg` interface.
    pub async fn host_loadavg(&self) -> Result<(f64, f64, f64)> {
        Ok(system::read_loadavg().await?)
    }
}

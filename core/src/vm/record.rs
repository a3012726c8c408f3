//! The VM Record data model (spec.md §3) and its state machine (§4.4).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    Building,
    Running,
    Paused,
    Quit,
    Error,
}

impl VmState {
    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Building => "BUILDING",
            VmState::Running => "RUNNING",
            VmState::Paused => "PAUSED",
            VmState::Quit => "QUIT",
            VmState::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Quit | VmState::Error)
    }

    pub fn is_active(self) -> bool {
        matches!(self, VmState::Building | VmState::Running | VmState::Paused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskMode {
    Persistent,
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    pub mode: DiskMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfigEntry {
    pub bridge: String,
    /// VLAN alias as given by the caller; resolved to an integer at
    /// launch time via `BridgeManager::lookup_vlan`.
    pub vlan_alias: String,
    /// `None` until the launch preamble assigns one.
    pub mac: Option<String>,
    pub driver: String,
    /// Tap name, populated once the Bridge Manager creates it.
    pub tap: Option<String>,
}

/// The configuration snapshot taken at launch time; persisted verbatim
/// to `<runtime>/config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub namespace: String,
    pub mem_mib: u64,
    pub vcpus: u32,
    pub disks: Vec<DiskConfig>,
    pub networks: Vec<NetworkConfigEntry>,
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct VmRecord {
    pub id: i64,
    pub config: VmConfig,
    pub state: VmState,
    pub runtime_dir: PathBuf,
    pub hypervisor_pid: Option<u32>,
    pub hotplug: HashMap<i64, PathBuf>,
    pub tags: HashMap<String, String>,
    pub created_at_unix: i64,
}

impl VmRecord {
    pub fn new(id: i64, config: VmConfig, runtime_dir: PathBuf, created_at_unix: i64) -> Self {
        Self {
            id,
            config,
            state: VmState::Building,
            runtime_dir,
            hypervisor_pid: None,
            hotplug: HashMap::new(),
            tags: HashMap::new(),
            created_at_unix,
        }
    }

    /// The lowest unused hotplug slot, reusing freed slots (spec.md §8
    /// boundary behavior).
    pub fn next_hotplug_slot(&self) -> i64 {
        let mut slot = 0;
        while self.hotplug.contains_key(&slot) {
            slot += 1;
        }
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VmConfig {
        VmConfig {
            name: "foo".to_string(),
            namespace: "default".to_string(),
            mem_mib: 512,
            vcpus: 1,
            disks: vec![],
            networks: vec![],
            uuid: None,
        }
    }

    #[test]
    fn test_next_hotplug_slot_reuses_freed_slot() {
        let mut record = VmRecord::new(1, config(), PathBuf::from("/tmp/1"), 0);
        assert_eq!(record.next_hotplug_slot(), 0);
        record.hotplug.insert(0, PathBuf::from("/tmp/a.iso"));
        assert_eq!(record.next_hotplug_slot(), 1);
        record.hotplug.insert(1, PathBuf::from("/tmp/b.iso"));
        record.hotplug.remove(&0);
        assert_eq!(record.next_hotplug_slot(), 0);
    }

    #[test]
    fn test_state_classification() {
        assert!(VmState::Building.is_active());
        assert!(VmState::Running.is_active());
        assert!(VmState::Paused.is_active());
        assert!(!VmState::Quit.is_active());
        assert!(VmState::Quit.is_terminal());
        assert!(VmState::Error.is_terminal());
    }
}

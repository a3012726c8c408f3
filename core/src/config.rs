use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, DirBuilder};
use tracing::info;

/// Daemon-wide configuration. Loaded once at startup and threaded through
/// [`crate::core::Core`]; never read from a global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory under which every VM gets `<base>/<vm-id>/...` and
    /// the bridge journal `<base>/bridges` live.
    pub base_dir: PathBuf,
    /// Prefix used for every tap/mirror interface this daemon creates.
    /// Recovery only reaps interfaces carrying this prefix.
    pub tap_prefix: String,
    /// Name of the software-switch CLI binary shelled out to by the
    /// bridge manager.
    pub switch_bin: String,
    /// Inclusive VLAN allocation range.
    pub vlan_min: u16,
    pub vlan_max: u16,
    /// Launch rate limiter defaults.
    pub launch_rate_ms: u64,
    pub launch_burst: u32,
    /// Bounded retry for the hypervisor monitor connect step.
    pub monitor_connect_attempts: u32,
    pub monitor_connect_delay_ms: u64,
    /// Signal we send for a graceful kill; any other exit signal reported
    /// by the watcher sends the VM to ERROR instead of QUIT.
    pub kill_signal: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/vmord"),
            tap_prefix: "mega_tap".to_string(),
            switch_bin: "ovs-vsctl".to_string(),
            vlan_min: 1,
            vlan_max: 4094,
            launch_rate_ms: 100,
            launch_burst: 1,
            monitor_connect_attempts: 10,
            monitor_connect_delay_ms: 100,
            kill_signal: 9,
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Config> {
        info!("Reading config: {}", path.display());
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .create(parent)
                .await
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }
        let content = toml::to_string(self).context("failed to serialize config")?;
        info!("Writing config: {}", path.display());
        fs::write(path, content)
            .await
            .with_context(|| format!("failed to write config {}", path.display()))
    }

    pub fn monitor_connect_delay(&self) -> Duration {
        Duration::from_millis(self.monitor_connect_delay_ms)
    }

    pub fn launch_rate(&self) -> Duration {
        Duration::from_millis(self.launch_rate_ms)
    }
}

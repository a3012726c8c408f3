//! The `vmordd` daemon entrypoint. Command routing, the interactive
//! shell, and the cross-host RPC fabric are all out of scope (see
//! `vmord::core`'s doc comment) - this binary only owns process
//! lifetime: load configuration, build a `Core`, run the crash-recovery
//! sweep, then wait to be told to exit.

use clap::Parser;
use eyre::{Context, Result};
use std::path::PathBuf;
use tracing::info;
use vmord::config::Config;
use vmord::core::Core;

#[derive(Parser, Debug)]
#[command(name = "vmordd", about = "VM orchestrator core daemon")]
struct Args {
    /// Path to a TOML config file; missing fields fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    base_dir: Option<PathBuf>,

    #[arg(long)]
    switch_bin: Option<String>,

    #[arg(long)]
    vlan_min: Option<u16>,

    #[arg(long)]
    vlan_max: Option<u16>,
}

impl Args {
    fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(base_dir) = &self.base_dir {
            config.base_dir = base_dir.clone();
        }
        if let Some(switch_bin) = &self.switch_bin {
            config.switch_bin = switch_bin.clone();
        }
        if let Some(vlan_min) = self.vlan_min {
            config.vlan_min = vlan_min;
        }
        if let Some(vlan_max) = self.vlan_max {
            config.vlan_max = vlan_max;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    vmord_utils::logging::setup_logging()?;
    let args = Args::parse();

    let base_config = match &args.config {
        Some(path) => Config::load(path).await.with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    let config = args.apply_overrides(base_config);

    info!(base_dir = %config.base_dir.display(), switch_bin = %config.switch_bin, "starting vmordd");
    let core = Core::new(config);

    let report = core.recover().await;
    info!(
        pids_killed = report.pids_killed.len(),
        taps_reclaimed = report.taps_reclaimed.len(),
        bridges_destroyed = report.bridges_destroyed.len(),
        "startup recovery sweep complete"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutting down");
    core.vms.shutdown().await;
    Ok(())
}

//! Persistent on-disk state layout (spec.md §6):
//! `<base>/<vm-id>/{config,name,state,taps,qmp,qemu.pid}` plus the
//! append-only `<base>/bridges` journal (handled by `crate::recovery`).

use crate::error::{Error, Result};
use crate::vm::record::{VmConfig, VmState};
use std::path::{Path, PathBuf};
use tokio::fs;

pub fn runtime_dir(base_dir: &Path, vm_id: i64) -> PathBuf {
    base_dir.join(vm_id.to_string())
}

pub fn monitor_socket_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("qmp")
}

pub fn pid_file_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("qemu.pid")
}

/// Creates the per-VM runtime directory with mode 0700 (launch preamble
/// invariant 4, spec.md §4.4).
pub async fn create_runtime_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::external_failure(format!("failed to create runtime dir {}: {e}", dir.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|e| Error::external_failure(format!("failed to chmod runtime dir {}: {e}", dir.display())))?;
    }
    Ok(())
}

pub async fn write_config(dir: &Path, config: &VmConfig) -> Result<()> {
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| Error::external_failure(format!("failed to serialize config: {e}")))?;
    write_text(&dir.join("config"), &content).await
}

pub async fn read_config(dir: &Path) -> Result<VmConfig> {
    let content = read_text(&dir.join("config")).await?;
    serde_json::from_str(&content).map_err(|e| Error::external_failure(format!("invalid persisted config: {e}")))
}

pub async fn write_name(dir: &Path, name: &str) -> Result<()> {
    write_text(&dir.join("name"), name).await
}

pub async fn write_state(dir: &Path, state: VmState) -> Result<()> {
    write_text(&dir.join("state"), state.as_str()).await
}

pub async fn read_state(dir: &Path) -> Result<String> {
    read_text(&dir.join("state")).await
}

pub async fn write_taps(dir: &Path, taps: &[String]) -> Result<()> {
    write_text(&dir.join("taps"), &taps.join("\n")).await
}

pub async fn read_taps(dir: &Path) -> Result<Vec<String>> {
    let content = read_text(&dir.join("taps")).await.unwrap_or_default();
    Ok(content.lines().map(str::to_string).filter(|l| !l.is_empty()).collect())
}

async fn write_text(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content)
        .await
        .map_err(|e| Error::external_failure(format!("failed to write {}: {e}", path.display())))
}

async fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .await
        .map_err(|e| Error::not_found(format!("failed to read {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::record::VmConfig;

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

    #[tokio::test]
    async fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), &config()).await.unwrap();
        let loaded = read_config(dir.path()).await.unwrap();
        assert_eq!(loaded.name, "foo");
        assert_eq!(loaded.mem_mib, 512);
    }

    #[tokio::test]
    async fn test_taps_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_taps(dir.path(), &["tap0".to_string(), "tap1".to_string()]).await.unwrap();
        let loaded = read_taps(dir.path()).await.unwrap();
        assert_eq!(loaded, vec!["tap0".to_string(), "tap1".to_string()]);
    }

    #[tokio::test]
    async fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        write_state(dir.path(), VmState::Running).await.unwrap();
        assert_eq!(read_state(dir.path()).await.unwrap(), "RUNNING");
    }

    #[tokio::test]
    async fn test_runtime_dir_created_with_mode_0700() {
        let base = tempfile::tempdir().unwrap();
        let dir = runtime_dir(base.path(), 42);
        create_runtime_dir(&dir).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dir).await.unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }
}

//! The hypervisor monitor protocol (spec.md §6): JSON command/response
//! framing over a unix-domain stream socket, one per VM. Modeled as a
//! capability interface so the supervisor never assumes a concrete
//! connection type (spec.md §9).

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind::WouldBlock;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use vmord_utils::retry::bounded_retry;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the VM Supervisor needs from a live hypervisor monitor
/// connection: issue a raw command, get a raw response back, close.
#[async_trait]
pub trait MonitorConnection: Send + Sync {
    async fn send_raw(&mut self, command: Value) -> Result<Value>;
    async fn close(&mut self);
}

/// Connects to `socket_path` with bounded retry (§4.4 step 6): up to
/// `attempts` tries, `delay` apart. ECONNREFUSED (the socket file exists
/// but nothing is listening yet) and "not found yet" both retry the same
/// way, matching the fork-then-connect race every hypervisor monitor has.
pub async fn connect_with_retry(socket_path: &Path, attempts: u32, delay: Duration) -> Result<UnixSocketMonitor> {
    bounded_retry(attempts, delay, || async { UnixStream::connect(socket_path).await })
        .await
        .map(UnixSocketMonitor::new)
        .map_err(|e| Error::monitor_failure(format!("failed to connect to {}: {e}", socket_path.display())))
}

pub struct UnixSocketMonitor {
    stream: Option<UnixStream>,
}

impl UnixSocketMonitor {
    fn new(stream: UnixStream) -> Self {
        Self { stream: Some(stream) }
    }

    fn stream_mut(&mut self) -> Result<&mut UnixStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::monitor_failure("monitor connection already closed".to_string()))
    }

    async fn write_json(&mut self, value: &Value) -> Result<()> {
        let data = serde_json::to_string(value)
            .map_err(|e| Error::monitor_failure(format!("failed to serialize monitor command: {e}")))?;
        let stream = self.stream_mut()?;
        let write = async {
            loop {
                stream
                    .writable()
                    .await
                    .map_err(|e| Error::monitor_failure(format!("monitor socket not writable: {e}")))?;
                match stream.try_write(data.as_bytes()) {
                    Ok(_) => return Ok(()),
                    Err(e) if e.kind() == WouldBlock => continue,
                    Err(e) => return Err(Error::monitor_failure(format!("monitor write failed: {e}"))),
                }
            }
        };
        timeout(SOCKET_TIMEOUT, write)
            .await
            .map_err(|_| Error::monitor_failure("monitor write timed out".to_string()))?
    }

    async fn read_json(&mut self) -> Result<Value> {
        let stream = self.stream_mut()?;
        let read = async {
            let mut buf = vec![0u8; 4096];
            loop {
                stream
                    .readable()
                    .await
                    .map_err(|e| Error::monitor_failure(format!("monitor socket not readable: {e}")))?;
                match stream.try_read(&mut buf) {
                    Ok(0) => return Err(Error::monitor_failure("monitor connection closed".to_string())),
                    Ok(n) => {
                        return serde_json::from_slice(&buf[..n])
                            .map_err(|e| Error::monitor_failure(format!("malformed monitor response: {e}")))
                    }
                    Err(e) if e.kind() == WouldBlock => continue,
                    Err(e) => return Err(Error::monitor_failure(format!("monitor read failed: {e}"))),
                }
            }
        };
        timeout(SOCKET_TIMEOUT, read)
            .await
            .map_err(|_| Error::monitor_failure("monitor read timed out".to_string()))?
    }
}

#[async_trait]
impl MonitorConnection for UnixSocketMonitor {
    async fn send_raw(&mut self, command: Value) -> Result<Value> {
        self.write_json(&command).await?;
        self.read_json().await
    }

    async fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.into_std().map(|s| s.shutdown(std::net::Shutdown::Both));
        }
    }
}

/// Builders for the specific monitor operations named in spec.md §4.4 /
/// §6. Kept free of any particular `MonitorConnection` so tests can
/// assert on the constructed JSON directly.
pub mod commands {
    use serde_json::{json, Value};

    pub fn drive_add(slot: i64, file: &str) -> Value {
        json!({ "execute": "drive_add", "arguments": { "id": slot, "file": file } })
    }

    pub fn usb_add(slot: i64, usb_version: Option<&str>) -> Value {
        json!({ "execute": "usb_add", "arguments": { "id": slot, "version": usb_version } })
    }

    pub fn drive_del(slot: i64) -> Value {
        json!({ "execute": "drive_del", "arguments": { "id": slot } })
    }

    pub fn usb_del(slot: i64) -> Value {
        json!({ "execute": "usb_del", "arguments": { "id": slot } })
    }

    pub fn blockdev_eject(device: &str) -> Value {
        json!({ "execute": "blockdev_eject", "arguments": { "device": device } })
    }

    pub fn blockdev_change(device: &str, file: &str) -> Value {
        json!({ "execute": "blockdev_change", "arguments": { "device": device, "file": file } })
    }

    pub fn migrate(target: &str) -> Value {
        json!({ "execute": "migrate", "arguments": { "uri": target } })
    }

    pub fn query_migrate() -> Value {
        json!({ "execute": "query_migrate" })
    }

    pub fn screendump(path: &str) -> Value {
        json!({ "execute": "screendump", "arguments": { "filename": path } })
    }

    pub fn stop() -> Value {
        json!({ "execute": "stop" })
    }

    pub fn cont() -> Value {
        json!({ "execute": "cont" })
    }
}

#[cfg(test)]
mod tests {
    use super::commands::*;

    #[test]
    fn test_drive_add_shape() {
        let cmd = drive_add(3, "/tmp/disk.img");
        assert_eq!(cmd["execute"], "drive_add");
        assert_eq!(cmd["arguments"]["id"], 3);
        assert_eq!(cmd["arguments"]["file"], "/tmp/disk.img");
    }

    #[test]
    fn test_stop_and_cont_are_bare_commands() {
        assert_eq!(stop()["execute"], "stop");
        assert_eq!(cont()["execute"], "cont");
    }
}

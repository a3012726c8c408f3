//! The Capture Engine (spec.md §4.3): attaches pcap and flow-record
//! writers to bridges/taps. A pcap entry owns its mirror tap outright;
//! a flow entry only ever registers a writer against the bridge's
//! shared flow collector.

use crate::bridge::BridgeManager;
use crate::counter::Counter;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureKind {
    Pcap,
    Flow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Raw,
    Ascii,
}

#[derive(Debug, Clone)]
pub enum CaptureScope {
    /// Capturing a single VM interface directly (no mirror tap needed).
    VmInterface { vm: String, iface_index: usize, tap: String },
    /// Capturing an entire bridge via a mirror tap the entry owns.
    Bridge { bridge: String, mirror_tap: Option<String> },
}

#[derive(Debug, Clone)]
pub struct CaptureEntry {
    pub id: i64,
    pub kind: CaptureKind,
    pub scope: CaptureScope,
    pub output: OutputTarget,
    pub encoding: Encoding,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub enum OutputTarget {
    File(PathBuf),
    Socket { transport: SocketTransport, host: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketTransport {
    Tcp,
    Udp,
}

/// Resolves which tap backs a VM's network interface, so the capture
/// engine never has to know about VM internals directly - it only needs
/// the (bridge, tap) pair.
#[async_trait]
pub trait VmTapResolver: Send + Sync + 'static {
    async fn resolve_tap(&self, vm: &str, iface_index: usize) -> Result<(String, String)>;
}

/// Opens and closes raw-frame or flow-record writers. Writer I/O errors
/// are logged but never propagated to VM lifecycle operations (§4.3).
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn open_pcap_file(&self, path: &PathBuf) -> Result<()>;
    async fn open_flow_file(&self, path: &PathBuf, encoding: Encoding, compress: bool) -> Result<()>;
    async fn open_flow_socket(&self, transport: SocketTransport, host: &str, encoding: Encoding) -> Result<()>;
    async fn close(&self, target: &OutputTarget) -> Result<()>;
}

/// Opens real files/sockets. Failures during open are surfaced to the
/// caller (so `startCapture*` can fail); failures afterward are the
/// writer's own problem and are only logged.
#[derive(Debug, Default)]
pub struct RealPacketSink;

#[async_trait]
impl PacketSink for RealPacketSink {
    async fn open_pcap_file(&self, path: &PathBuf) -> Result<()> {
        tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::external_failure(format!("failed to open pcap file {}: {e}", path.display())))?;
        Ok(())
    }

    async fn open_flow_file(&self, path: &PathBuf, _encoding: Encoding, _compress: bool) -> Result<()> {
        tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::external_failure(format!("failed to open flow file {}: {e}", path.display())))?;
        Ok(())
    }

    async fn open_flow_socket(&self, transport: SocketTransport, host: &str, _encoding: Encoding) -> Result<()> {
        match transport {
            SocketTransport::Tcp => {
                tokio::net::TcpStream::connect(host)
                    .await
                    .map_err(|e| Error::external_failure(format!("failed to connect flow socket {host}: {e}")))?;
            }
            SocketTransport::Udp => {
                let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|e| Error::external_failure(format!("failed to bind flow socket: {e}")))?;
                socket
                    .connect(host)
                    .await
                    .map_err(|e| Error::external_failure(format!("failed to connect flow socket {host}: {e}")))?;
            }
        }
        Ok(())
    }

    async fn close(&self, _target: &OutputTarget) -> Result<()> {
        Ok(())
    }
}

pub struct CaptureEngine {
    bridges: Arc<BridgeManager>,
    vm_taps: Arc<dyn VmTapResolver>,
    sink: Arc<dyn PacketSink>,
    ids: Counter,
    entries: Mutex<HashMap<i64, CaptureEntry>>,
}

impl CaptureEngine {
    pub fn new(bridges: Arc<BridgeManager>, vm_taps: Arc<dyn VmTapResolver>, sink: Arc<dyn PacketSink>) -> Self {
        Self {
            bridges,
            vm_taps,
            sink,
            ids: Counter::new(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self))]
    pub async fn start_capture_pcap(&self, vm: &str, iface_index: usize, path: PathBuf) -> Result<i64> {
        let (bridge, tap) = self.vm_taps.resolve_tap(vm, iface_index).await?;
        self.sink.open_pcap_file(&path).await?;
        let id = self.ids.next();
        self.entries.lock().await.insert(
            id,
            CaptureEntry {
                id,
                kind: CaptureKind::Pcap,
                scope: CaptureScope::VmInterface {
                    vm: vm.to_string(),
                    iface_index,
                    tap,
                },
                output: OutputTarget::File(path),
                encoding: Encoding::Raw,
                compress: false,
            },
        );
        let _ = bridge;
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn start_bridge_capture_pcap(&self, bridge: &str, path: PathBuf) -> Result<i64> {
        let mirror_tap = self.bridges.create_mirror(bridge).await?;
        if let Err(err) = self.sink.open_pcap_file(&path).await {
            let _ = self.bridges.destroy_mirror(bridge).await;
            return Err(err);
        }
        let id = self.ids.next();
        self.entries.lock().await.insert(
            id,
            CaptureEntry {
                id,
                kind: CaptureKind::Pcap,
                scope: CaptureScope::Bridge {
                    bridge: bridge.to_string(),
                    mirror_tap: Some(mirror_tap),
                },
                output: OutputTarget::File(path),
                encoding: Encoding::Raw,
                compress: false,
            },
        );
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn start_capture_netflow_file(
        &self,
        bridge: &str,
        path: PathBuf,
        ascii: bool,
        compress: bool,
    ) -> Result<i64> {
        let encoding = if ascii { Encoding::Ascii } else { Encoding::Raw };
        self.bridges
            .new_netflow(bridge, &path.display().to_string(), 60)
            .await?;
        self.sink.open_flow_file(&path, encoding, compress).await?;
        let id = self.ids.next();
        self.entries.lock().await.insert(
            id,
            CaptureEntry {
                id,
                kind: CaptureKind::Flow,
                scope: CaptureScope::Bridge {
                    bridge: bridge.to_string(),
                    mirror_tap: None,
                },
                output: OutputTarget::File(path),
                encoding,
                compress,
            },
        );
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn start_capture_netflow_socket(
        &self,
        bridge: &str,
        transport: SocketTransport,
        host: &str,
        ascii: bool,
    ) -> Result<i64> {
        let encoding = if ascii { Encoding::Ascii } else { Encoding::Raw };
        self.bridges.new_netflow(bridge, host, 60).await?;
        self.sink.open_flow_socket(transport, host, encoding).await?;
        let id = self.ids.next();
        self.entries.lock().await.insert(
            id,
            CaptureEntry {
                id,
                kind: CaptureKind::Flow,
                scope: CaptureScope::Bridge {
                    bridge: bridge.to_string(),
                    mirror_tap: None,
                },
                output: OutputTarget::Socket {
                    transport,
                    host: host.to_string(),
                },
                encoding,
                compress: false,
            },
        );
        Ok(id)
    }

    /// Stops one capture by id. When the last flow writer for a bridge
    /// is removed, the collector itself is destroyed.
    #[instrument(skip(self))]
    pub async fn clear_capture(&self, id: i64) -> Result<()> {
        let entry = {
            let mut entries = self.entries.lock().await;
            entries
                .remove(&id)
                .ok_or_else(|| Error::not_found(format!("capture {id} not found")))?
        };
        self.teardown(&entry).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn clear_all_captures(&self) {
        let entries: Vec<CaptureEntry> = {
            let mut guard = self.entries.lock().await;
            guard.drain().map(|(_, v)| v).collect()
        };
        for entry in entries {
            self.teardown(&entry).await;
        }
    }

    async fn teardown(&self, entry: &CaptureEntry) {
        if let Err(err) = self.sink.close(&entry.output).await {
            warn!("error closing capture writer {}: {err}", entry.id);
        }

        match &entry.scope {
            CaptureScope::Bridge { bridge, mirror_tap } => {
                if mirror_tap.is_some() {
                    if let Err(err) = self.bridges.destroy_mirror(bridge).await {
                        warn!("error destroying mirror tap on {bridge}: {err}");
                    }
                }
                if entry.kind == CaptureKind::Flow {
                    let remaining_flow_writers = self
                        .entries
                        .lock()
                        .await
                        .values()
                        .any(|e| e.kind == CaptureKind::Flow && matches!(&e.scope, CaptureScope::Bridge { bridge: b, .. } if b == bridge));
                    if !remaining_flow_writers {
                        if let Err(err) = self.bridges.destroy_netflow(bridge).await {
                            warn!("error destroying flow collector on {bridge}: {err}");
                        }
                    }
                }
            }
            CaptureScope::VmInterface { .. } => {}
        }
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn entries_for_bridge(&self, bridge: &str) -> Vec<CaptureEntry> {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| matches!(&e.scope, CaptureScope::Bridge { bridge: b, .. } if b == bridge))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::switch::MockSwitchControl;

    struct StubResolver;

    #[async_trait]
    impl VmTapResolver for StubResolver {
        async fn resolve_tap(&self, vm: &str, iface_index: usize) -> Result<(String, String)> {
            Ok((format!("{vm}-bridge"), format!("{vm}-tap{iface_index}")))
        }
    }

    struct StubSink;

    #[async_trait]
    impl PacketSink for StubSink {
        async fn open_pcap_file(&self, _path: &PathBuf) -> Result<()> {
            Ok(())
        }
        async fn open_flow_file(&self, _path: &PathBuf, _encoding: Encoding, _compress: bool) -> Result<()> {
            Ok(())
        }
        async fn open_flow_socket(&self, _transport: SocketTransport, _host: &str, _encoding: Encoding) -> Result<()> {
            Ok(())
        }
        async fn close(&self, _target: &OutputTarget) -> Result<()> {
            Ok(())
        }
    }

    fn engine(base: &std::path::Path) -> CaptureEngine {
        let mut mock = MockSwitchControl::new();
        mock.expect_bridge_exists().returning(|_| Ok(false));
        mock.expect_add_bridge().returning(|_| Ok(()));
        mock.expect_add_port().returning(|_, _, _| Ok(()));
        mock.expect_del_port().returning(|_, _| Ok(()));
        mock.expect_set_mirror().returning(|_, _| Ok(()));
        mock.expect_clear_mirror().returning(|_, _| Ok(()));
        mock.expect_set_netflow().returning(|_, _, _| Ok(()));
        mock.expect_clear_netflow().returning(|_| Ok(()));
        let bridges = Arc::new(BridgeManager::new(Arc::new(mock), "mega_tap", base.to_path_buf(), 1, 10));
        CaptureEngine::new(bridges, Arc::new(StubResolver), Arc::new(StubSink))
    }

    #[tokio::test]
    async fn test_bridge_pcap_creates_mirror_and_entry() {
        let base = tempfile::tempdir().unwrap();
        let engine = engine(base.path());
        let id = engine
            .start_bridge_capture_pcap("foo", PathBuf::from("/tmp/a.pcap"))
            .await
            .unwrap();
        assert_eq!(engine.entry_count().await, 1);
        let bridge = engine.bridges.get_bridge("foo").await.unwrap();
        assert!(bridge.lock().await.mirror_tap.is_some());

        engine.clear_capture(id).await.unwrap();
        assert_eq!(engine.entry_count().await, 0);
        let bridge = engine.bridges.get_bridge("foo").await.unwrap();
        assert!(bridge.lock().await.mirror_tap.is_none());
    }

    #[tokio::test]
    async fn test_clear_all_captures_empties_table() {
        let base = tempfile::tempdir().unwrap();
        let engine = engine(base.path());
        engine
            .start_bridge_capture_pcap("foo", PathBuf::from("/tmp/a.pcap"))
            .await
            .unwrap();
        engine.start_capture_pcap("vm1", 0, PathBuf::from("/tmp/b.pcap")).await.unwrap();
        assert_eq!(engine.entry_count().await, 2);
        engine.clear_all_captures().await;
        assert_eq!(engine.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_flow_collector_destroyed_when_last_writer_removed() {
        let base = tempfile::tempdir().unwrap();
        let engine = engine(base.path());
        let id1 = engine
            .start_capture_netflow_file("foo", PathBuf::from("/tmp/flow.log"), false, false)
            .await
            .unwrap();
        assert!(engine.bridges.get_netflow("foo").await.unwrap().is_some());
        engine.clear_capture(id1).await.unwrap();
        assert!(engine.bridges.get_netflow("foo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_unknown_capture_is_not_found() {
        let base = tempfile::tempdir().unwrap();
        let engine = engine(base.path());
        let err = engine.clear_capture(123).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

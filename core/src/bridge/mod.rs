//! The Bridge & Tap Manager (spec.md §4.2): owns software-switch bridges,
//! host taps, and VLAN aliases, and integrates with an external
//! collaborator through [`switch::SwitchControl`].

pub mod switch;
pub mod vlan;

use crate::counter::Counter;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use switch::{SwitchControl, TunnelKind};
use tokio::sync::{Mutex, RwLock};
use tracing::{instrument, warn};
use vlan::VlanAliasTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapKind {
    Vm,
    Host,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTapIp {
    Cidr(String),
    Dhcp,
    None,
}

#[derive(Debug, Clone)]
pub struct Tap {
    pub name: String,
    pub vlan: u16,
    pub kind: TapKind,
    pub host_ip: Option<HostTapIp>,
}

#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub iface: String,
    pub kind: TunnelKind,
    pub remote: String,
}

#[derive(Debug, Clone)]
pub struct NetflowRecord {
    pub timeout_secs: u32,
    pub targets: Vec<String>,
}

/// A named software-switch instance (spec.md §3).
#[derive(Debug, Clone)]
pub struct Bridge {
    pub name: String,
    pub pre_existed: bool,
    pub taps: HashMap<String, Tap>,
    pub trunks: HashSet<String>,
    pub tunnels: Vec<TunnelRecord>,
    pub mirror_tap: Option<String>,
    pub netflow: Option<NetflowRecord>,
}

impl Bridge {
    fn new(name: impl Into<String>, pre_existed: bool) -> Self {
        Self {
            name: name.into(),
            pre_existed,
            taps: HashMap::new(),
            trunks: HashSet::new(),
            tunnels: Vec::new(),
            mirror_tap: None,
            netflow: None,
        }
    }

    /// A bridge with nothing attached is eligible for destruction,
    /// provided it did not pre-exist the daemon.
    pub fn is_empty(&self) -> bool {
        self.taps.is_empty() && self.trunks.is_empty() && self.tunnels.is_empty()
    }
}

struct BandwidthSample {
    at: Instant,
    rx_bytes: u64,
    tx_bytes: u64,
}

pub struct BridgeManager {
    switch: Arc<dyn SwitchControl>,
    tap_prefix: String,
    /// Root directory for the crash-recovery bridge journal
    /// (`<base_dir>/bridges`); see `get_bridge`.
    base_dir: PathBuf,
    bridges: RwLock<HashMap<String, Arc<Mutex<Bridge>>>>,
    /// Tap names are a host-wide kernel namespace: the reserved-name
    /// predicate is process-wide and checked before any create,
    /// independent of which bridge owns the tap (spec.md §4.2).
    tap_owner: Mutex<HashMap<String, String>>,
    tap_counter: Counter,
    vlan_table: Mutex<VlanAliasTable>,
    last_bandwidth_sample: Mutex<Option<BandwidthSample>>,
}

impl BridgeManager {
    pub fn new(
        switch: Arc<dyn SwitchControl>,
        tap_prefix: impl Into<String>,
        base_dir: PathBuf,
        vlan_min: u16,
        vlan_max: u16,
    ) -> Self {
        Self {
            switch,
            tap_prefix: tap_prefix.into(),
            base_dir,
            bridges: RwLock::new(HashMap::new()),
            tap_owner: Mutex::new(HashMap::new()),
            tap_counter: Counter::new(),
            vlan_table: Mutex::new(VlanAliasTable::new(vlan_min, vlan_max)),
            last_bandwidth_sample: Mutex::new(None),
        }
    }

    pub fn reserved_prefix(&self) -> &str {
        &self.tap_prefix
    }

    /// Hands out the underlying switch collaborator, e.g. for recovery's
    /// startup sweep which needs to issue `del_port`/`del_bridge` calls
    /// outside this manager's own in-memory bookkeeping.
    pub fn switch_handle(&self) -> Arc<dyn SwitchControl> {
        Arc::clone(&self.switch)
    }

    /// Returns the bridge, creating it if absent. Creation is idempotent:
    /// it succeeds if the bridge already exists on the host (recorded
    /// `pre_existed = true`) or if the switch accepts a create call.
    #[instrument(skip(self))]
    pub async fn get_bridge(&self, name: &str) -> Result<Arc<Mutex<Bridge>>> {
        if let Some(bridge) = self.bridges.read().await.get(name) {
            return Ok(Arc::clone(bridge));
        }

        let bridge = {
            let mut bridges = self.bridges.write().await;
            if let Some(bridge) = bridges.get(name) {
                return Ok(Arc::clone(bridge));
            }

            let pre_existed = self.switch.bridge_exists(name).await.unwrap_or(false);
            if !pre_existed {
                self.switch.add_bridge(name).await?;
            }
            let bridge = Arc::new(Mutex::new(Bridge::new(name, pre_existed)));
            bridges.insert(name.to_string(), Arc::clone(&bridge));
            bridge
        };

        // Recorded once outside the table lock: `record_bridge_in_journal`
        // re-reads the bridge through `get_bridge_if_exists`, which would
        // deadlock against the write lock above.
        if let Err(err) = crate::recovery::record_bridge_in_journal(&self.base_dir, self, name).await {
            warn!("failed to record bridge {name} in crash-recovery journal: {err}");
        }
        Ok(bridge)
    }

    async fn next_tap_name(&self) -> String {
        format!("{}{}", self.tap_prefix, self.tap_counter.next())
    }

    /// Allocates a fresh tap name if `name` is empty, attaches it to
    /// `bridge_name` on `vlan`. Fails with `Conflict` if the name
    /// collides with an existing tap anywhere on the host.
    #[instrument(skip(self))]
    pub async fn tap_create(&self, bridge_name: &str, vlan: u16, name: Option<&str>) -> Result<String> {
        let bridge = self.get_bridge(bridge_name).await?;

        let mut tap_owner = self.tap_owner.lock().await;
        let tap_name = match name {
            Some(n) if !n.is_empty() => {
                if tap_owner.contains_key(n) {
                    return Err(Error::conflict(format!("tap {n} already exists")));
                }
                n.to_string()
            }
            _ => loop {
                let candidate = self.next_tap_name().await;
                if !tap_owner.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        self.switch.add_port(bridge_name, &tap_name, vlan).await?;

        let mut bridge_guard = bridge.lock().await;
        bridge_guard.taps.insert(
            tap_name.clone(),
            Tap {
                name: tap_name.clone(),
                vlan,
                kind: TapKind::Vm,
                host_ip: None,
            },
        );
        tap_owner.insert(tap_name.clone(), bridge_name.to_string());
        Ok(tap_name)
    }

    /// Detaches and deletes the tap. `vlan` is checked as a sanity bound
    /// against the recorded attachment.
    #[instrument(skip(self))]
    pub async fn tap_destroy(&self, vlan: u16, name: &str) -> Result<()> {
        let mut tap_owner = self.tap_owner.lock().await;
        let bridge_name = tap_owner
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("tap {name} not found")))?;

        let bridge = {
            let bridges = self.bridges.read().await;
            bridges
                .get(&bridge_name)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("bridge {bridge_name} not found")))?
        };

        {
            let mut bridge_guard = bridge.lock().await;
            let tap = bridge_guard
                .taps
                .get(name)
                .ok_or_else(|| Error::not_found(format!("tap {name} not found on bridge {bridge_name}")))?;
            if tap.vlan != vlan {
                return Err(Error::conflict(format!(
                    "tap {name} is on vlan {}, not {vlan}",
                    tap.vlan
                )));
            }
            self.switch.del_port(&bridge_name, name).await?;
            bridge_guard.taps.remove(name);
        }
        tap_owner.remove(name);
        Ok(())
    }

    /// Moves a tap to `new_bridge_name` at `new_vlan`, or just retags it
    /// if it is already on that bridge. Used by the VM Supervisor's
    /// `networkConnect` (spec.md §4.4), which takes the bridge lock
    /// across the whole move.
    #[instrument(skip(self))]
    pub async fn move_tap(&self, tap_name: &str, new_bridge_name: &str, new_vlan: u16) -> Result<()> {
        let mut tap_owner = self.tap_owner.lock().await;
        let old_bridge_name = tap_owner
            .get(tap_name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("tap {tap_name} not found")))?;

        if old_bridge_name == new_bridge_name {
            let bridge = self.get_bridge(&old_bridge_name).await?;
            self.switch.set_port_vlan(&old_bridge_name, tap_name, new_vlan).await?;
            if let Some(tap) = bridge.lock().await.taps.get_mut(tap_name) {
                tap.vlan = new_vlan;
            }
            return Ok(());
        }

        let new_bridge = self.get_bridge(new_bridge_name).await?;
        self.switch.del_port(&old_bridge_name, tap_name).await?;
        self.switch.add_port(new_bridge_name, tap_name, new_vlan).await?;

        if let Some(old_bridge) = self.get_bridge_if_exists(&old_bridge_name).await {
            old_bridge.lock().await.taps.remove(tap_name);
        }
        new_bridge.lock().await.taps.insert(
            tap_name.to_string(),
            Tap {
                name: tap_name.to_string(),
                vlan: new_vlan,
                kind: TapKind::Vm,
                host_ip: None,
            },
        );
        tap_owner.insert(tap_name.to_string(), new_bridge_name.to_string());
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn trunk_add(&self, bridge_name: &str, iface: &str) -> Result<()> {
        let bridge = self.get_bridge(bridge_name).await?;
        self.switch.add_trunk(bridge_name, iface).await?;
        bridge.lock().await.trunks.insert(iface.to_string());
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn trunk_remove(&self, bridge_name: &str, iface: &str) -> Result<()> {
        let bridge = self.get_bridge(bridge_name).await?;
        self.switch.del_trunk(bridge_name, iface).await?;
        bridge.lock().await.trunks.remove(iface);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn tunnel_add(&self, bridge_name: &str, kind: TunnelKind, remote: &str) -> Result<String> {
        let bridge = self.get_bridge(bridge_name).await?;
        let iface = self.next_tap_name().await;
        self.switch.add_tunnel(bridge_name, &iface, kind, remote).await?;
        bridge.lock().await.tunnels.push(TunnelRecord {
            iface: iface.clone(),
            kind,
            remote: remote.to_string(),
        });
        Ok(iface)
    }

    #[instrument(skip(self))]
    pub async fn tunnel_remove(&self, bridge_name: &str, iface: &str) -> Result<()> {
        let bridge = self.get_bridge(bridge_name).await?;
        self.switch.del_port(bridge_name, iface).await?;
        bridge.lock().await.tunnels.retain(|t| t.iface != iface);
        Ok(())
    }

    /// Allocates a mirror tap that receives a copy of every frame on the
    /// bridge; used by the capture engine.
    #[instrument(skip(self))]
    pub async fn create_mirror(&self, bridge_name: &str) -> Result<String> {
        let bridge = self.get_bridge(bridge_name).await?;
        let mut bridge_guard = bridge.lock().await;
        if let Some(existing) = &bridge_guard.mirror_tap {
            return Ok(existing.clone());
        }
        let mirror_name = self.next_tap_name().await;
        self.switch.add_port(bridge_name, &mirror_name, 0).await?;
        self.switch.set_mirror(bridge_name, &mirror_name).await?;
        bridge_guard.taps.insert(
            mirror_name.clone(),
            Tap {
                name: mirror_name.clone(),
                vlan: 0,
                kind: TapKind::Mirror,
                host_ip: None,
            },
        );
        bridge_guard.mirror_tap = Some(mirror_name.clone());
        self.tap_owner
            .lock()
            .await
            .insert(mirror_name.clone(), bridge_name.to_string());
        Ok(mirror_name)
    }

    #[instrument(skip(self))]
    pub async fn destroy_mirror(&self, bridge_name: &str) -> Result<()> {
        let bridge = self.get_bridge(bridge_name).await?;
        let mirror_name = {
            let mut bridge_guard = bridge.lock().await;
            let Some(mirror_name) = bridge_guard.mirror_tap.take() else {
                return Ok(());
            };
            bridge_guard.taps.remove(&mirror_name);
            mirror_name
        };
        self.switch.clear_mirror(bridge_name, &mirror_name).await?;
        self.switch.del_port(bridge_name, &mirror_name).await?;
        self.tap_owner.lock().await.remove(&mirror_name);
        Ok(())
    }

    /// At most one flow collector per bridge; `timeout_secs` may be
    /// updated atomically by calling again.
    #[instrument(skip(self))]
    pub async fn new_netflow(&self, bridge_name: &str, target: &str, timeout_secs: u32) -> Result<()> {
        let bridge = self.get_bridge(bridge_name).await?;
        self.switch.set_netflow(bridge_name, target, timeout_secs).await?;
        let mut bridge_guard = bridge.lock().await;
        match &mut bridge_guard.netflow {
            Some(record) => {
                record.timeout_secs = timeout_secs;
                if !record.targets.contains(&target.to_string()) {
                    record.targets.push(target.to_string());
                }
            }
            None => {
                bridge_guard.netflow = Some(NetflowRecord {
                    timeout_secs,
                    targets: vec![target.to_string()],
                })
            }
        }
        Ok(())
    }

    pub async fn get_netflow(&self, bridge_name: &str) -> Result<Option<NetflowRecord>> {
        let bridge = self.get_bridge(bridge_name).await?;
        Ok(bridge.lock().await.netflow.clone())
    }

    #[instrument(skip(self))]
    pub async fn destroy_netflow(&self, bridge_name: &str) -> Result<()> {
        let bridge = self.get_bridge(bridge_name).await?;
        {
            let mut bridge_guard = bridge.lock().await;
            if bridge_guard.netflow.is_none() {
                return Ok(());
            }
            bridge_guard.netflow = None;
        }
        self.switch.clear_netflow(bridge_name).await
    }

    /// Resolves an alias-or-integer VLAN for the given namespace.
    pub async fn lookup_vlan(&self, namespace: &str, alias_or_integer: &str) -> Result<u16> {
        self.vlan_table.lock().await.lookup_vlan(namespace, alias_or_integer)
    }

    pub async fn delete_vlan_aliases(&self, prefix: &str) {
        self.vlan_table.lock().await.delete_by_prefix(prefix);
    }

    /// Aggregate (rx, tx) rate in bytes/sec across every managed tap,
    /// sampled from `/sys/class/net/<tap>/statistics/*`. Best-effort:
    /// interfaces that can't be read contribute zero rather than
    /// failing the whole call.
    pub async fn bandwidth_stats(&self) -> Result<(f64, f64)> {
        let tap_names: Vec<String> = self.tap_owner.lock().await.keys().cloned().collect();
        let mut rx_bytes = 0u64;
        let mut tx_bytes = 0u64;
        for name in tap_names {
            rx_bytes += read_sysfs_counter(&name, "rx_bytes").await.unwrap_or(0);
            tx_bytes += read_sysfs_counter(&name, "tx_bytes").await.unwrap_or(0);
        }

        let mut sample_guard = self.last_bandwidth_sample.lock().await;
        let now = Instant::now();
        let rates = match &*sample_guard {
            Some(prev) => {
                let elapsed = now.duration_since(prev.at).as_secs_f64().max(f64::EPSILON);
                (
                    (rx_bytes.saturating_sub(prev.rx_bytes) as f64) / elapsed,
                    (tx_bytes.saturating_sub(prev.tx_bytes) as f64) / elapsed,
                )
            }
            None => (0.0, 0.0),
        };
        *sample_guard = Some(BandwidthSample {
            at: now,
            rx_bytes,
            tx_bytes,
        });
        Ok(rates)
    }

    /// Snapshot of every bridge's name, for read-only iteration. Mutation
    /// never happens under this lock.
    pub async fn bridge_names(&self) -> Vec<String> {
        self.bridges.read().await.keys().cloned().collect()
    }

    pub async fn get_bridge_if_exists(&self, name: &str) -> Option<Arc<Mutex<Bridge>>> {
        self.bridges.read().await.get(name).cloned()
    }

    /// Removes a bridge entirely from the table; used by recovery when
    /// destroying an empty, non-pre-existing bridge.
    pub async fn forget_bridge(&self, name: &str) {
        self.bridges.write().await.remove(name);
    }
}

async fn read_sysfs_counter(iface: &str, stat: &str) -> Option<u64> {
    let path = format!("/sys/class/net/{iface}/statistics/{stat}");
    tokio::fs::read_to_string(path).await.ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use switch::MockSwitchControl;

    fn always_ok_switch() -> Arc<dyn SwitchControl> {
        let mut mock = MockSwitchControl::new();
        mock.expect_bridge_exists().returning(|_| Ok(false));
        mock.expect_add_bridge().returning(|_| Ok(()));
        mock.expect_add_port().returning(|_, _, _| Ok(()));
        mock.expect_del_port().returning(|_, _| Ok(()));
        mock.expect_set_port_vlan().returning(|_, _, _| Ok(()));
        mock.expect_set_mirror().returning(|_, _| Ok(()));
        mock.expect_clear_mirror().returning(|_, _| Ok(()));
        mock.expect_set_netflow().returning(|_, _, _| Ok(()));
        mock.expect_clear_netflow().returning(|_| Ok(()));
        Arc::new(mock)
    }

    fn manager(base_dir: &std::path::Path) -> BridgeManager {
        BridgeManager::new(always_ok_switch(), "mega_tap", base_dir.to_path_buf(), 1, 10)
    }

    #[tokio::test]
    async fn test_get_bridge_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        let b1 = mgr.get_bridge("default").await.unwrap();
        let b2 = mgr.get_bridge("default").await.unwrap();
        assert!(Arc::ptr_eq(&b1, &b2));
        assert_eq!(mgr.bridge_names().await.len(), 1);
    }

    #[tokio::test]
    async fn test_get_bridge_records_journal_entry() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        mgr.get_bridge("default").await.unwrap();
        let journal = tokio::fs::read_to_string(base.path().join("bridges")).await.unwrap();
        assert_eq!(journal, "default,false\n");
    }

    #[tokio::test]
    async fn test_tap_create_then_destroy_restores_empty_set() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        let name = mgr.tap_create("default", 5, None).await.unwrap();
        assert!(name.starts_with("mega_tap"));
        {
            let bridge = mgr.get_bridge("default").await.unwrap();
            assert_eq!(bridge.lock().await.taps.len(), 1);
        }
        mgr.tap_destroy(5, &name).await.unwrap();
        let bridge = mgr.get_bridge("default").await.unwrap();
        assert!(bridge.lock().await.taps.is_empty());
    }

    #[tokio::test]
    async fn test_tap_create_name_collision_is_conflict() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        mgr.tap_create("default", 5, Some("fixed")).await.unwrap();
        let err = mgr.tap_create("other", 5, Some("fixed")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_mirror_create_then_destroy() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        let mirror = mgr.create_mirror("foo").await.unwrap();
        {
            let bridge = mgr.get_bridge("foo").await.unwrap();
            let guard = bridge.lock().await;
            assert_eq!(guard.mirror_tap.as_deref(), Some(mirror.as_str()));
        }
        mgr.destroy_mirror("foo").await.unwrap();
        let bridge = mgr.get_bridge("foo").await.unwrap();
        let guard = bridge.lock().await;
        assert!(guard.mirror_tap.is_none());
        assert!(guard.taps.is_empty());
    }

    #[tokio::test]
    async fn test_create_mirror_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        let m1 = mgr.create_mirror("foo").await.unwrap();
        let m2 = mgr.create_mirror("foo").await.unwrap();
        assert_eq!(m1, m2);
    }

    #[tokio::test]
    async fn test_netflow_lifecycle() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        assert!(mgr.get_netflow("foo").await.unwrap().is_none());
        mgr.new_netflow("foo", "127.0.0.1:2055", 60).await.unwrap();
        let record = mgr.get_netflow("foo").await.unwrap().unwrap();
        assert_eq!(record.timeout_secs, 60);
        mgr.destroy_netflow("foo").await.unwrap();
        assert!(mgr.get_netflow("foo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tap_destroy_unknown_is_not_found() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        let err = mgr.tap_destroy(5, "ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_move_tap_to_new_bridge() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        let tap = mgr.tap_create("foo", 5, None).await.unwrap();
        mgr.move_tap(&tap, "bar", 9).await.unwrap();

        let foo = mgr.get_bridge("foo").await.unwrap();
        assert!(foo.lock().await.taps.is_empty());
        let bar = mgr.get_bridge("bar").await.unwrap();
        let bar_guard = bar.lock().await;
        assert_eq!(bar_guard.taps.get(&tap).unwrap().vlan, 9);
    }

    #[tokio::test]
    async fn test_move_tap_same_bridge_just_retags() {
        let base = tempfile::tempdir().unwrap();
        let mgr = manager(base.path());
        let tap = mgr.tap_create("foo", 5, None).await.unwrap();
        mgr.move_tap(&tap, "foo", 9).await.unwrap();
        let foo = mgr.get_bridge("foo").await.unwrap();
        assert_eq!(foo.lock().await.taps.get(&tap).unwrap().vlan, 9);
    }
}

//! The external software-switch collaborator (§6 "Software-switch CLI").
//! The bridge manager never shells out directly; it goes through this
//! capability interface so tests substitute [`MockSwitchControl`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use vmord_utils::cmd::output_cmd;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    Vxlan,
    Gre,
}

impl TunnelKind {
    fn as_str(self) -> &'static str {
        match self {
            TunnelKind::Vxlan => "vxlan",
            TunnelKind::Gre => "gre",
        }
    }
}

/// Everything the Bridge & Tap Manager needs from the external
/// software-switch tool. One call per sub-command so a mock can assert
/// call sequences precisely.
#[async_trait]
pub trait SwitchControl: Send + Sync + 'static {
    async fn add_bridge(&self, bridge: &str) -> Result<()>;
    async fn del_bridge(&self, bridge: &str) -> Result<()>;
    async fn bridge_exists(&self, bridge: &str) -> Result<bool>;
    async fn add_port(&self, bridge: &str, port: &str, vlan: u16) -> Result<()>;
    async fn del_port(&self, bridge: &str, port: &str) -> Result<()>;
    async fn set_port_vlan(&self, bridge: &str, port: &str, vlan: u16) -> Result<()>;
    async fn set_mirror(&self, bridge: &str, mirror_port: &str) -> Result<()>;
    async fn clear_mirror(&self, bridge: &str, mirror_port: &str) -> Result<()>;
    async fn set_netflow(&self, bridge: &str, target: &str, timeout_secs: u32) -> Result<()>;
    async fn clear_netflow(&self, bridge: &str) -> Result<()>;
    async fn add_tunnel(&self, bridge: &str, iface: &str, kind: TunnelKind, remote: &str) -> Result<()>;
    async fn add_trunk(&self, bridge: &str, iface: &str) -> Result<()>;
    async fn del_trunk(&self, bridge: &str, iface: &str) -> Result<()>;
}

/// Shells out to an OVS-compatible `ovs-vsctl`-style CLI, normalizing
/// well-known stderr phrases into typed errors per §6.
#[derive(Debug, Clone)]
pub struct CliSwitch {
    binary: String,
}

impl CliSwitch {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        match output_cmd(&self.binary, args.iter().copied()).await {
            Ok(_) => Ok(()),
            Err(err) => Err(normalize_switch_error(&err.to_string())),
        }
    }
}

/// Normalizes well-known stderr phrases from the switch CLI into typed
/// errors; anything unrecognized becomes `ExternalFailure`.
fn normalize_switch_error(stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("no such port") || lower.contains("no bridge named") {
        Error::not_found(stderr.to_string())
    } else if lower.contains("already exists") {
        Error::conflict(stderr.to_string())
    } else {
        Error::external_failure(stderr.to_string())
    }
}

#[async_trait]
impl SwitchControl for CliSwitch {
    async fn add_bridge(&self, bridge: &str) -> Result<()> {
        self.run(&["--may-exist", "add-br", bridge]).await
    }

    async fn del_bridge(&self, bridge: &str) -> Result<()> {
        self.run(&["--if-exists", "del-br", bridge]).await
    }

    async fn bridge_exists(&self, bridge: &str) -> Result<bool> {
        match output_cmd(&self.binary, ["br-exists", bridge]).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn add_port(&self, bridge: &str, port: &str, vlan: u16) -> Result<()> {
        let tag = vlan.to_string();
        self.run(&["--may-exist", "add-port", bridge, port, "tag", &tag])
            .await
    }

    async fn del_port(&self, bridge: &str, port: &str) -> Result<()> {
        self.run(&["--if-exists", "del-port", bridge, port]).await
    }

    async fn set_port_vlan(&self, bridge: &str, port: &str, vlan: u16) -> Result<()> {
        let _ = bridge;
        let tag = format!("tag={vlan}");
        self.run(&["set", "port", port, &tag]).await
    }

    async fn set_mirror(&self, bridge: &str, mirror_port: &str) -> Result<()> {
        let mirror_name = format!("{bridge}-mirror");
        let select_all = "select-all=true".to_string();
        let output_port = format!("output-port={mirror_port}");
        self.run(&[
            "--",
            "--id=@m",
            "create",
            "mirror",
            &format!("name={mirror_name}"),
            &select_all,
            &output_port,
            "--",
            "set",
            "bridge",
            bridge,
            "mirrors=@m",
        ])
        .await
    }

    async fn clear_mirror(&self, bridge: &str, mirror_port: &str) -> Result<()> {
        let _ = mirror_port;
        self.run(&["clear", "bridge", bridge, "mirrors"]).await
    }

    async fn set_netflow(&self, bridge: &str, target: &str, timeout_secs: u32) -> Result<()> {
        let targets = format!("targets={target}");
        let active_timeout = format!("active-timeout={timeout_secs}");
        self.run(&[
            "--",
            "--id=@n",
            "create",
            "netflow",
            &targets,
            &active_timeout,
            "--",
            "set",
            "bridge",
            bridge,
            "netflow=@n",
        ])
        .await
    }

    async fn clear_netflow(&self, bridge: &str) -> Result<()> {
        self.run(&["clear", "bridge", bridge, "netflow"]).await
    }

    async fn add_tunnel(&self, bridge: &str, iface: &str, kind: TunnelKind, remote: &str) -> Result<()> {
        let type_arg = format!("type={}", kind.as_str());
        let options = format!("options:remote_ip={remote}");
        self.run(&[
            "add-port",
            bridge,
            iface,
            "--",
            "set",
            "interface",
            iface,
            &type_arg,
            &options,
        ])
        .await
    }

    async fn add_trunk(&self, bridge: &str, iface: &str) -> Result<()> {
        self.run(&["add-port", bridge, iface, "--", "set", "port", iface, "vlan_mode=trunk"])
            .await
    }

    async fn del_trunk(&self, bridge: &str, iface: &str) -> Result<()> {
        self.del_port(bridge, iface).await
    }
}

#[cfg(test)]
mockall::mock! {
    pub SwitchControl {}

    #[async_trait]
    impl SwitchControl for SwitchControl {
        async fn add_bridge(&self, bridge: &str) -> Result<()>;
        async fn del_bridge(&self, bridge: &str) -> Result<()>;
        async fn bridge_exists(&self, bridge: &str) -> Result<bool>;
        async fn add_port(&self, bridge: &str, port: &str, vlan: u16) -> Result<()>;
        async fn del_port(&self, bridge: &str, port: &str) -> Result<()>;
        async fn set_port_vlan(&self, bridge: &str, port: &str, vlan: u16) -> Result<()>;
        async fn set_mirror(&self, bridge: &str, mirror_port: &str) -> Result<()>;
        async fn clear_mirror(&self, bridge: &str, mirror_port: &str) -> Result<()>;
        async fn set_netflow(&self, bridge: &str, target: &str, timeout_secs: u32) -> Result<()>;
        async fn clear_netflow(&self, bridge: &str) -> Result<()>;
        async fn add_tunnel(&self, bridge: &str, iface: &str, kind: TunnelKind, remote: &str) -> Result<()>;
        async fn add_trunk(&self, bridge: &str, iface: &str) -> Result<()>;
        async fn del_trunk(&self, bridge: &str, iface: &str) -> Result<()>;
    }
}

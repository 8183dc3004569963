use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Formatter;
use std::path::Path;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// The native, untagged vlan of every bridge. Never handed out to a logical bridge.
pub const NATIVE_VID: u16 = 1;

/// The uplink bridge of a pod. It is never torn down, only the listed members are guaranteed to
/// keep their place on it across reconciliation.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WanBridge {
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
}

/// One bridge realised on a pod, either the WAN bridge or a dedicated bridge for a logical
/// bridge.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    pub vid: u16,
    #[serde(default)]
    pub physical_members: Vec<String>,
    #[serde(default)]
    pub virtual_members: Vec<String>,
}

impl BridgeConfig {
    pub fn new(vid: u16) -> Self {
        Self {
            vid,
            physical_members: Vec::new(),
            virtual_members: Vec::new(),
        }
    }
}

/// One endpoint of a gretap link between two tunneling pods
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TunnelConfig {
    pub local: String,
    pub remote: String,
    pub key: u32,
}

/// What lives inside a simulated client's network namespace. The json shape is
/// `{"client_type": "wired", "port": ..}` or `{"client_type": "wireless", "phy": ..}`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "client_type", rename_all = "snake_case")]
pub enum ClientDescriptor {
    Wired {
        port: String,
    },
    Wireless {
        phy: String,
    },
}

/// The compiled, declarative network configuration of a single pod. This is what the topology
/// compiler hands over to the reconciler running on the pod, so the field names and shapes are a
/// stable contract.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PodConfig {
    pub wan_bridge: WanBridge,
    #[serde(default)]
    pub trunk_ports: Vec<String>,
    #[serde(default)]
    pub bridges: BTreeMap<String, BridgeConfig>,
    #[serde(default)]
    pub tunnels: BTreeMap<String, TunnelConfig>,
    #[serde(default)]
    pub veth_pairs: BTreeMap<String, String>,
    #[serde(default)]
    pub namespaces: BTreeMap<String, ClientDescriptor>,
}

impl PodConfig {
    pub fn new(wan_bridge: WanBridge, trunk_ports: Vec<String>) -> Self {
        Self {
            wan_bridge,
            trunk_ports,
            ..Default::default()
        }
    }

    pub fn is_wan_bridge(&self, bridge: &str) -> bool {
        self.wan_bridge.name == bridge
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: PodConfig = serde_json::from_str(text).context("parsing pod config json")?;
        Ok(config)
    }

    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path).await.context("reading pod config file")?;
        Self::from_json(&text)
    }

    pub async fn save_to<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let mut file = File::create(path).await?;
        file.write_all(serde_json::to_string_pretty(&self)?.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

impl fmt::Display for PodConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(&self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

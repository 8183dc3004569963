use std::collections::BTreeMap;
use std::path::Path;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use crate::pod_config::WanBridge;

/// The lab hardware description (`hardware.yaml`). This is static infrastructure maintained by
/// the lab administrator, the rest of the system only ever reads it.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct Inventory {
    pub sites: BTreeMap<String, Site>,
    /// smart plug per DUT, used for power planning
    #[serde(default)]
    pub power: BTreeMap<String, PowerPlug>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct Site {
    /// the pod terminating gretap tunnels for this site, needed once a logical bridge spans sites
    pub tunneling_pod: Option<String>,
    pub pods: BTreeMap<String, Pod>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct Pod {
    /// address of the pod, used both for ssh and as the gretap endpoint
    pub host: String,
    pub wan_bridge: WanBridge,
    #[serde(default)]
    pub trunk_ports: Vec<String>,
    /// local netdev name to the DUT port plugged into it
    #[serde(default)]
    pub ethernet: BTreeMap<String, EthernetPort>,
    #[serde(default)]
    pub console: Option<ConsoleMap>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EthernetPort {
    pub dut_name: String,
    pub dut_port: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct ConsoleMap {
    #[serde(default)]
    pub serial: BTreeMap<String, ConsoleEntry>,
    #[serde(default)]
    pub tty: BTreeMap<String, ConsoleEntry>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct ConsoleEntry {
    pub dut_name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConsoleKind {
    Serial,
    Tty,
}

/// Where to find the console of a DUT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLocation {
    pub pod: String,
    pub host: String,
    pub kind: ConsoleKind,
    pub id: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct PowerPlug {
    pub host: String,
    #[serde(rename = "type")]
    pub plug_type: PlugType,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugType {
    #[serde(rename = "tasmota")]
    Tasmota,
    #[serde(rename = "tp-link")]
    TpLink,
}

impl Inventory {
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path).await.context("Reading hardware file")?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let value: Self = serde_yaml::from_str(text).context("Parsing hardware YAML")?;
        Ok(value)
    }

    /// Iterate over every pod as `(site, pod name, pod)`, ordered by site then pod name
    pub fn pods(&self) -> impl Iterator<Item = (&str, &str, &Pod)> {
        self.sites.iter().flat_map(|(site_name, site)| {
            site.pods.iter().map(move |(pod_name, pod)| (site_name.as_str(), pod_name.as_str(), pod))
        })
    }

    pub fn pod(&self, name: &str) -> Option<&Pod> {
        self.sites.values().find_map(|site| site.pods.get(name))
    }

    pub fn site_of(&self, pod: &str) -> Option<&str> {
        self.sites.iter()
            .find(|(_, site)| site.pods.contains_key(pod))
            .map(|(name, _)| name.as_str())
    }

    /// Find the pod and local netdev that a DUT port is cabled to
    pub fn find_dut_port(&self, dut_name: &str, dut_port: &str) -> Option<(&str, &str)> {
        self.pods().find_map(|(_, pod_name, pod)| {
            pod.ethernet.iter()
                .find(|(_, port)| port.dut_name == dut_name && port.dut_port == dut_port)
                .map(|(dev, _)| (pod_name, dev.as_str()))
        })
    }

    pub fn console_for_dut(&self, dut_name: &str) -> Option<ConsoleLocation> {
        for (_, pod_name, pod) in self.pods() {
            let Some(console) = &pod.console else {
                continue;
            };
            let entries = [(ConsoleKind::Serial, &console.serial), (ConsoleKind::Tty, &console.tty)];
            for (kind, map) in entries {
                if let Some((id, _)) = map.iter().find(|(_, entry)| entry.dut_name == dut_name) {
                    return Some(ConsoleLocation {
                        pod: pod_name.to_string(),
                        host: pod.host.clone(),
                        kind,
                        id: id.clone(),
                    });
                }
            }
        }
        None
    }
}

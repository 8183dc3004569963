use std::fmt;
use std::path::Path;
use anyhow::Context;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The operator's desired L2 topology (`topology.yaml`)
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct DesiredTopology {
    pub bridges: LogicalBridges,
    #[serde(default)]
    pub sim_wireless_clients: Vec<SimWirelessClient>,
    /// DUTs that should be powered even when they are not bridge members
    #[serde(default)]
    pub power_on: Vec<String>,
}

/// Logical bridges keyed by name, in the order they were declared. The declared order decides
/// which vlan tag each bridge gets, so a plain map is not enough here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogicalBridges(pub Vec<(String, LogicalBridge)>);

impl LogicalBridges {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &LogicalBridge)> {
        self.0.iter().map(|(name, bridge)| (name.as_str(), bridge))
    }

    pub fn get(&self, name: &str) -> Option<&LogicalBridge> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, bridge)| bridge)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

struct LogicalBridgesVisitor;

impl<'de> Visitor<'de> for LogicalBridgesVisitor {
    type Value = LogicalBridges;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a map of logical bridge name to bridge definition")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut bridges: Vec<(String, LogicalBridge)> = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((name, bridge)) = map.next_entry::<String, LogicalBridge>()? {
            if bridges.iter().any(|(existing, _)| *existing == name) {
                return Err(serde::de::Error::custom(format!("duplicate logical bridge {name}")));
            }
            bridges.push((name, bridge));
        }
        Ok(LogicalBridges(bridges))
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(LogicalBridges::default())
    }
}

impl<'de> Deserialize<'de> for LogicalBridges {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(LogicalBridgesVisitor)
    }
}

impl Serialize for LogicalBridges {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, bridge) in &self.0 {
            map.serialize_entry(name, bridge)?;
        }
        map.end()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LogicalBridge {
    /// the site whose WAN bridge gives this segment its egress
    #[serde(default)]
    pub wan: Option<String>,
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Member {
    Dut {
        dut_name: String,
        dut_port: String,
    },
    SimWiredClient {
        pod: String,
        namespace: String,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SimWirelessClient {
    pub pod: String,
    pub namespace: String,
    pub phy: String,
}

impl DesiredTopology {
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = tokio::fs::read_to_string(path).await.context("Reading topology file")?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let value: Self = serde_yaml::from_str(text).context("Parsing topology YAML")?;
        Ok(value)
    }
}

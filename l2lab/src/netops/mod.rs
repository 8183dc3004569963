use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter};
use l2lab_schemas::pod_config::TunnelConfig;
use crate::error::OpError;
use crate::orchestration::run_subprocess_command;

pub mod netlink;
pub mod simulated;
pub mod tools;

pub use netlink::NetlinkOps;
pub use simulated::SimulatedKernel;
pub use tools::HostTools;

#[macro_export]
macro_rules! vec_of_strings {
    ($($x:expr),*) => (vec![$($x.to_string()),*]);
}

/// The kinds of link the reconciler creates and tears down. Links are always found by kind, a
/// name prefix says nothing about what a device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, AsRefStr, Deserialize, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Gretap,
    Veth,
    Vlan,
    Bridge,
}

/// How a vlan filter entry is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlanMode {
    /// tagged membership of a bridge port
    Tagged,
    /// the bridge's own (CPU port) filter
    SelfCpu,
    /// ingress untagged frames land in this vlan, egress is untagged
    PvidUntagged,
}

/// One vlan filter entry of a bridge or bridge port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct VlanEntry {
    pub vid: u16,
    pub pvid: bool,
    pub untagged: bool,
}

impl VlanEntry {
    pub fn tagged(vid: u16) -> Self {
        Self { vid, pvid: false, untagged: false }
    }

    pub fn pvid_untagged(vid: u16) -> Self {
        Self { vid, pvid: true, untagged: true }
    }
}

/// The primitive kernel operations a pod's network is built from. Every mutation is a single
/// kernel change and fails the way the kernel would, callers decide whether that matters.
#[async_trait]
pub trait NetworkOps: Send + Sync {
    /// Links of a kind in the default namespace
    async fn links(&self, kind: LinkKind) -> Result<Vec<String>, OpError>;
    async fn namespaces(&self) -> Result<Vec<String>, OpError>;
    async fn bridge_ports(&self, bridge: &str) -> Result<Vec<String>, OpError>;
    /// Vlan filter of a device, for a bridge this is its own filter
    async fn vlans(&self, dev: &str) -> Result<Vec<VlanEntry>, OpError>;
    /// Wireless radios that currently live in a namespace
    async fn namespace_phys(&self, namespace: &str) -> Result<Vec<String>, OpError>;
    async fn forward_block_installed(&self) -> Result<bool, OpError>;

    async fn add_gretap(&self, name: &str, tunnel: &TunnelConfig) -> Result<(), OpError>;
    async fn add_veth(&self, name: &str, peer: &str) -> Result<(), OpError>;
    /// Create `{parent}.{vid}` and return its name
    async fn add_vlan(&self, parent: &str, vid: u16) -> Result<String, OpError>;
    async fn delete_link(&self, name: &str) -> Result<(), OpError>;
    async fn add_bridge(&self, name: &str) -> Result<(), OpError>;
    async fn set_link_state(&self, name: &str, up: bool) -> Result<(), OpError>;
    async fn set_vlan_filtering(&self, bridge: &str, enabled: bool) -> Result<(), OpError>;
    /// Bring the member up with a 1500 mtu and enslave it to the bridge
    async fn attach(&self, bridge: &str, member: &str) -> Result<(), OpError>;
    async fn detach(&self, member: &str) -> Result<(), OpError>;
    async fn vlan_add(&self, dev: &str, vid: u16, mode: VlanMode) -> Result<(), OpError>;
    async fn vlan_del(&self, dev: &str, vid: u16, mode: VlanMode) -> Result<(), OpError>;
    async fn set_learning(&self, dev: &str, enabled: bool) -> Result<(), OpError>;
    async fn add_namespace(&self, name: &str) -> Result<(), OpError>;
    async fn delete_namespace(&self, name: &str) -> Result<(), OpError>;
    async fn move_link_to_namespace(&self, dev: &str, namespace: &str) -> Result<(), OpError>;
    async fn move_phy_to_namespace(&self, phy: &str, namespace: &str) -> Result<(), OpError>;
    /// Hand a radio back to the default namespace
    async fn rescue_phy(&self, namespace: &str, phy: &str) -> Result<(), OpError>;
    /// Drop bridged frames from one gretap device to another
    async fn install_forward_block(&self) -> Result<(), OpError>;
}

/// Runs one command line and returns its stdout, failing with stderr when it exits non zero
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: Vec<String>) -> anyhow::Result<String>;
}

pub struct SubprocessRunner;

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, cmd: Vec<String>) -> anyhow::Result<String> {
        let Some((program, args)) = cmd.split_first() else {
            anyhow::bail!("empty command");
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_subprocess_command(program, args).await
    }
}

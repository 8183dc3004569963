use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use async_trait::async_trait;
use l2lab_schemas::pod_config::{TunnelConfig, NATIVE_VID};
use crate::error::OpError;
use crate::netops::{LinkKind, NetworkOps, VlanEntry, VlanMode};

/// A network device as the in-memory kernel sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// `None` for physical devices, which can never be created or deleted
    pub kind: Option<LinkKind>,
    pub up: bool,
    pub mtu: u32,
    pub master: Option<String>,
    pub namespace: Option<String>,
    pub peer: Option<String>,
    pub parent: Option<String>,
    pub tunnel: Option<TunnelConfig>,
    /// port filter for bridge ports, the bridge's own filter for bridges
    pub vlans: BTreeMap<u16, VlanEntry>,
    pub learning: bool,
    pub vlan_filtering: bool,
}

impl Link {
    fn new(kind: Option<LinkKind>) -> Self {
        Self {
            kind,
            up: false,
            mtu: 1500,
            master: None,
            namespace: None,
            peer: None,
            parent: None,
            tunnel: None,
            vlans: BTreeMap::new(),
            learning: true,
            vlan_filtering: false,
        }
    }

    fn is_bridge(&self) -> bool {
        self.kind == Some(LinkKind::Bridge)
    }

    fn enslave(&mut self, bridge: &str) {
        if self.master.as_deref() != Some(bridge) {
            self.master = Some(bridge.to_string());
            self.vlans = default_vlans();
            self.learning = true;
        }
    }

    fn release(&mut self) {
        self.master = None;
        self.vlans.clear();
        self.learning = true;
    }
}

fn default_vlans() -> BTreeMap<u16, VlanEntry> {
    BTreeMap::from([(NATIVE_VID, VlanEntry::pvid_untagged(NATIVE_VID))])
}

/// Everything the simulated kernel knows, comparable as a whole
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    pub links: BTreeMap<String, Link>,
    pub namespaces: BTreeSet<String>,
    /// radio to the namespace it lives in, `None` is the default namespace
    pub phys: BTreeMap<String, Option<String>>,
    /// number of gretap forwarding drop rules in the ebtables FORWARD chain
    pub forward_block_rules: usize,
}

/// Order the kernel enumerates objects in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListingOrder {
    #[default]
    Sorted,
    Reversed,
}

#[derive(Default)]
struct Inner {
    state: KernelState,
    journal: Vec<String>,
}

/// An in-memory stand in for a pod's kernel. Operations fail the way the kernel does, including
/// losing radios whose namespace is deleted under them.
#[derive(Default)]
pub struct SimulatedKernel {
    inner: Mutex<Inner>,
    order: ListingOrder,
}

fn no_device(name: &str) -> String {
    format!("Cannot find device \"{name}\"")
}

const EXISTS: &str = "RTNETLINK answers: File exists";
const NOT_SUPPORTED: &str = "RTNETLINK answers: Operation not supported";
const BUSY: &str = "RTNETLINK answers: Device or resource busy";
const NO_ENTRY: &str = "RTNETLINK answers: No such file or directory";

impl KernelState {
    fn visible(&self, name: &str) -> Result<&Link, String> {
        self.links.get(name)
            .filter(|link| link.namespace.is_none())
            .ok_or_else(|| no_device(name))
    }

    fn visible_mut(&mut self, name: &str) -> Result<&mut Link, String> {
        self.links.get_mut(name)
            .filter(|link| link.namespace.is_none())
            .ok_or_else(|| no_device(name))
    }

    fn bridge(&self, name: &str) -> Result<&Link, String> {
        let link = self.visible(name)?;
        if link.is_bridge() { Ok(link) } else { Err(NOT_SUPPORTED.to_string()) }
    }

    fn port_mut(&mut self, name: &str) -> Result<&mut Link, String> {
        let link = self.visible_mut(name)?;
        if link.master.is_some() { Ok(link) } else { Err(NOT_SUPPORTED.to_string()) }
    }

    fn create(&mut self, name: &str, link: Link) -> Result<(), String> {
        if self.links.contains_key(name) {
            return Err(EXISTS.to_string());
        }
        self.links.insert(name.to_string(), link);
        Ok(())
    }

    fn namespace(&self, name: &str) -> Result<(), String> {
        if self.namespaces.contains(name) {
            Ok(())
        } else {
            Err(format!("Invalid netns name \"{name}\""))
        }
    }

    /// Remove a link along with everything that cannot outlive it
    fn destroy(&mut self, name: &str) {
        let Some(link) = self.links.remove(name) else {
            return;
        };
        if let Some(peer) = link.peer {
            self.links.remove(&peer);
        }
        let children: Vec<String> = self.links.iter()
            .filter(|(_, l)| l.parent.as_deref() == Some(name))
            .map(|(n, _)| n.clone())
            .collect();
        for child in children {
            self.destroy(&child);
        }
    }
}

impl SimulatedKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listing_order(mut self, order: ListingOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_physical(self, name: &str) -> Self {
        self.lock().state.links.entry(name.to_string()).or_insert_with(|| {
            let mut link = Link::new(None);
            link.up = true;
            link
        });
        self
    }

    /// A pre-existing bridge, up and with its members attached
    pub fn with_bridge(self, name: &str, members: &[&str]) -> Self {
        let mut kernel = self;
        for member in members {
            kernel = kernel.with_physical(member);
        }
        {
            let mut inner = kernel.lock();
            let mut bridge = Link::new(Some(LinkKind::Bridge));
            bridge.up = true;
            bridge.vlans = default_vlans();
            inner.state.links.insert(name.to_string(), bridge);
            for member in members {
                if let Some(link) = inner.state.links.get_mut(*member) {
                    link.enslave(name);
                }
            }
        }
        kernel
    }

    pub fn with_phy(self, phy: &str) -> Self {
        self.lock().state.phys.insert(phy.to_string(), None);
        self
    }

    pub fn set_listing_order(&mut self, order: ListingOrder) {
        self.order = order;
    }

    pub fn snapshot(&self) -> KernelState {
        self.lock().state.clone()
    }

    /// Every mutation attempted so far, in order
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listed(&self, mut names: Vec<String>) -> Vec<String> {
        names.sort();
        if self.order == ListingOrder::Reversed {
            names.reverse();
        }
        names
    }

    fn query<T>(&self, operation: &str, f: impl FnOnce(&KernelState) -> Result<T, String>) -> Result<T, OpError> {
        let inner = self.lock();
        f(&inner.state).map_err(|reason| OpError::new(operation, reason))
    }

    fn mutate<T>(&self, operation: String, f: impl FnOnce(&mut KernelState) -> Result<T, String>) -> Result<T, OpError> {
        let mut inner = self.lock();
        inner.journal.push(operation.clone());
        f(&mut inner.state).map_err(|reason| OpError::new(operation, reason))
    }
}

#[async_trait]
impl NetworkOps for SimulatedKernel {
    async fn links(&self, kind: LinkKind) -> Result<Vec<String>, OpError> {
        let names = self.query("link show", |state| {
            Ok(state.links.iter()
                .filter(|(_, link)| link.kind == Some(kind) && link.namespace.is_none())
                .map(|(name, _)| name.clone())
                .collect())
        })?;
        Ok(self.listed(names))
    }

    async fn namespaces(&self) -> Result<Vec<String>, OpError> {
        let names = self.query("netns list", |state| Ok(state.namespaces.iter().cloned().collect()))?;
        Ok(self.listed(names))
    }

    async fn bridge_ports(&self, bridge: &str) -> Result<Vec<String>, OpError> {
        let names = self.query("link show master", |state| {
            state.bridge(bridge)?;
            Ok(state.links.iter()
                .filter(|(_, link)| link.master.as_deref() == Some(bridge) && link.namespace.is_none())
                .map(|(name, _)| name.clone())
                .collect())
        })?;
        Ok(self.listed(names))
    }

    async fn vlans(&self, dev: &str) -> Result<Vec<VlanEntry>, OpError> {
        self.query("vlan show", |state| Ok(state.visible(dev)?.vlans.values().copied().collect()))
    }

    async fn namespace_phys(&self, namespace: &str) -> Result<Vec<String>, OpError> {
        let phys = self.query("iw list", |state| {
            state.namespace(namespace)?;
            Ok(state.phys.iter()
                .filter(|(_, ns)| ns.as_deref() == Some(namespace))
                .map(|(phy, _)| phy.clone())
                .collect())
        })?;
        Ok(self.listed(phys))
    }

    async fn forward_block_installed(&self) -> Result<bool, OpError> {
        self.query("ebtables list", |state| Ok(state.forward_block_rules > 0))
    }

    async fn add_gretap(&self, name: &str, tunnel: &TunnelConfig) -> Result<(), OpError> {
        self.mutate(format!("link add {name} type gretap key {}", tunnel.key), |state| {
            let mut link = Link::new(Some(LinkKind::Gretap));
            link.tunnel = Some(tunnel.clone());
            state.create(name, link)
        })
    }

    async fn add_veth(&self, name: &str, peer: &str) -> Result<(), OpError> {
        self.mutate(format!("link add {name} type veth peer {peer}"), |state| {
            if state.links.contains_key(peer) {
                return Err(EXISTS.to_string());
            }
            let mut first = Link::new(Some(LinkKind::Veth));
            first.peer = Some(peer.to_string());
            let mut second = Link::new(Some(LinkKind::Veth));
            second.peer = Some(name.to_string());
            state.create(name, first)?;
            state.create(peer, second)
        })
    }

    async fn add_vlan(&self, parent: &str, vid: u16) -> Result<String, OpError> {
        let name = format!("{parent}.{vid}");
        self.mutate(format!("link add {name} type vlan id {vid}"), |state| {
            state.visible(parent)?;
            let mut link = Link::new(Some(LinkKind::Vlan));
            link.parent = Some(parent.to_string());
            state.create(&name, link)?;
            Ok(name.clone())
        })
    }

    async fn delete_link(&self, name: &str) -> Result<(), OpError> {
        self.mutate(format!("link del {name}"), |state| {
            let link = state.visible(name)?;
            if link.kind.is_none() {
                return Err(NOT_SUPPORTED.to_string());
            }
            if link.is_bridge() && state.links.values().any(|l| l.master.as_deref() == Some(name)) {
                return Err(BUSY.to_string());
            }
            state.destroy(name);
            Ok(())
        })
    }

    async fn add_bridge(&self, name: &str) -> Result<(), OpError> {
        self.mutate(format!("link add {name} type bridge"), |state| {
            let mut bridge = Link::new(Some(LinkKind::Bridge));
            bridge.vlans = default_vlans();
            state.create(name, bridge)
        })
    }

    async fn set_link_state(&self, name: &str, up: bool) -> Result<(), OpError> {
        let word = if up { "up" } else { "down" };
        self.mutate(format!("link set {name} {word}"), |state| {
            state.visible_mut(name)?.up = up;
            Ok(())
        })
    }

    async fn set_vlan_filtering(&self, bridge: &str, enabled: bool) -> Result<(), OpError> {
        self.mutate(format!("link set {bridge} vlan_filtering {}", u8::from(enabled)), |state| {
            state.bridge(bridge)?;
            state.visible_mut(bridge)?.vlan_filtering = enabled;
            Ok(())
        })
    }

    async fn attach(&self, bridge: &str, member: &str) -> Result<(), OpError> {
        self.mutate(format!("link set {member} master {bridge}"), |state| {
            state.bridge(bridge)?;
            if member == bridge {
                return Err(NOT_SUPPORTED.to_string());
            }
            let link = state.visible_mut(member)?;
            link.up = true;
            link.mtu = 1500;
            link.enslave(bridge);
            Ok(())
        })
    }

    async fn detach(&self, member: &str) -> Result<(), OpError> {
        self.mutate(format!("link set {member} nomaster"), |state| {
            state.visible_mut(member)?.release();
            Ok(())
        })
    }

    async fn vlan_add(&self, dev: &str, vid: u16, mode: VlanMode) -> Result<(), OpError> {
        self.mutate(format!("vlan add {dev} vid {vid} {mode:?}"), |state| {
            match mode {
                VlanMode::SelfCpu => {
                    state.bridge(dev)?;
                    state.visible_mut(dev)?.vlans.insert(vid, VlanEntry::tagged(vid));
                }
                VlanMode::Tagged => {
                    state.port_mut(dev)?.vlans.insert(vid, VlanEntry::tagged(vid));
                }
                VlanMode::PvidUntagged => {
                    let port = state.port_mut(dev)?;
                    for entry in port.vlans.values_mut() {
                        entry.pvid = false;
                    }
                    port.vlans.insert(vid, VlanEntry::pvid_untagged(vid));
                }
            }
            Ok(())
        })
    }

    async fn vlan_del(&self, dev: &str, vid: u16, mode: VlanMode) -> Result<(), OpError> {
        self.mutate(format!("vlan del {dev} vid {vid} {mode:?}"), |state| {
            let link = match mode {
                VlanMode::SelfCpu => {
                    state.bridge(dev)?;
                    state.visible_mut(dev)?
                }
                VlanMode::Tagged | VlanMode::PvidUntagged => state.port_mut(dev)?,
            };
            link.vlans.remove(&vid).map(|_| ()).ok_or_else(|| NO_ENTRY.to_string())
        })
    }

    async fn set_learning(&self, dev: &str, enabled: bool) -> Result<(), OpError> {
        self.mutate(format!("link set {dev} learning {enabled}"), |state| {
            state.port_mut(dev)?.learning = enabled;
            Ok(())
        })
    }

    async fn add_namespace(&self, name: &str) -> Result<(), OpError> {
        self.mutate(format!("netns add {name}"), |state| {
            if !state.namespaces.insert(name.to_string()) {
                return Err(format!("Cannot create namespace file \"/run/netns/{name}\": File exists"));
            }
            Ok(())
        })
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), OpError> {
        self.mutate(format!("netns del {name}"), |state| {
            if !state.namespaces.remove(name) {
                return Err(format!("Cannot remove namespace file \"/run/netns/{name}\": No such file or directory"));
            }
            let inside: Vec<String> = state.links.iter()
                .filter(|(_, link)| link.namespace.as_deref() == Some(name))
                .map(|(n, _)| n.clone())
                .collect();
            for dev in inside {
                let physical = state.links.get(&dev).map(|l| l.kind.is_none()).unwrap_or(false);
                if physical {
                    if let Some(link) = state.links.get_mut(&dev) {
                        link.namespace = None;
                        link.up = false;
                    }
                } else {
                    state.destroy(&dev);
                }
            }
            // radios are not handed back, they are gone until the driver is reloaded
            state.phys.retain(|_, ns| ns.as_deref() != Some(name));
            Ok(())
        })
    }

    async fn move_link_to_namespace(&self, dev: &str, namespace: &str) -> Result<(), OpError> {
        self.mutate(format!("link set {dev} netns {namespace}"), |state| {
            state.namespace(namespace)?;
            let link = state.visible_mut(dev)?;
            link.release();
            link.up = false;
            link.namespace = Some(namespace.to_string());
            Ok(())
        })
    }

    async fn move_phy_to_namespace(&self, phy: &str, namespace: &str) -> Result<(), OpError> {
        self.mutate(format!("phy {phy} netns {namespace}"), |state| {
            state.namespace(namespace)?;
            match state.phys.get_mut(phy) {
                Some(location) if location.is_none() => {
                    *location = Some(namespace.to_string());
                    Ok(())
                }
                _ => Err("command failed: No such file or directory (-2)".to_string()),
            }
        })
    }

    async fn rescue_phy(&self, namespace: &str, phy: &str) -> Result<(), OpError> {
        self.mutate(format!("netns {namespace} phy {phy} netns 1"), |state| {
            state.namespace(namespace)?;
            match state.phys.get_mut(phy) {
                Some(location) if location.as_deref() == Some(namespace) => {
                    *location = None;
                    Ok(())
                }
                _ => Err("command failed: No such file or directory (-2)".to_string()),
            }
        })
    }

    async fn install_forward_block(&self) -> Result<(), OpError> {
        self.mutate("ebtables append FORWARD gretap drop".to_string(), |state| {
            state.forward_block_rules += 1;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel() -> TunnelConfig {
        TunnelConfig { local: "10.0.0.1".into(), remote: "10.0.1.2".into(), key: 1 }
    }

    #[tokio::test]
    async fn test_veth_peer_goes_with_it() {
        let kernel = SimulatedKernel::new();
        kernel.add_namespace("c1").await.unwrap();
        kernel.add_veth("veth0", "veth1").await.unwrap();
        kernel.move_link_to_namespace("veth1", "c1").await.unwrap();
        assert_eq!(kernel.links(LinkKind::Veth).await.unwrap(), vec!["veth0".to_string()]);
        kernel.delete_link("veth0").await.unwrap();
        assert!(kernel.snapshot().links.is_empty());
        let err = kernel.delete_link("veth1").await.unwrap_err();
        assert_eq!(err.reason, "Cannot find device \"veth1\"");
    }

    #[tokio::test]
    async fn test_duplicate_link_rejected() {
        let kernel = SimulatedKernel::new();
        kernel.add_gretap("gretap1", &tunnel()).await.unwrap();
        let err = kernel.add_gretap("gretap1", &tunnel()).await.unwrap_err();
        assert_eq!(err.reason, EXISTS);
    }

    #[tokio::test]
    async fn test_bridge_with_ports_is_busy() {
        let kernel = SimulatedKernel::new().with_physical("eth2");
        kernel.add_bridge("guest").await.unwrap();
        kernel.attach("guest", "eth2").await.unwrap();
        assert_eq!(kernel.delete_link("guest").await.unwrap_err().reason, BUSY);
        kernel.detach("eth2").await.unwrap();
        kernel.delete_link("guest").await.unwrap();
        assert_eq!(kernel.delete_link("eth2").await.unwrap_err().reason, NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_attach_sets_default_port_vlan() {
        let kernel = SimulatedKernel::new().with_bridge("br0", &["eth0"]).with_physical("eth2");
        kernel.attach("br0", "eth2").await.unwrap();
        assert_eq!(kernel.vlans("eth2").await.unwrap(), vec![VlanEntry::pvid_untagged(1)]);
        kernel.vlan_del("eth2", 1, VlanMode::Tagged).await.unwrap();
        kernel.vlan_add("eth2", 5, VlanMode::PvidUntagged).await.unwrap();
        kernel.set_learning("eth2", false).await.unwrap();
        let eth2 = &kernel.snapshot().links["eth2"];
        assert_eq!(eth2.vlans.values().copied().collect::<Vec<_>>(), vec![VlanEntry::pvid_untagged(5)]);
        assert!(!eth2.learning);
        kernel.detach("eth2").await.unwrap();
        assert!(kernel.vlans("eth2").await.unwrap().is_empty());
        // port only settings need a master
        assert!(kernel.set_learning("eth2", false).await.is_err());
        assert!(kernel.vlan_add("eth2", 5, VlanMode::Tagged).await.is_err());
    }

    #[tokio::test]
    async fn test_self_vlans_only_on_bridges() {
        let kernel = SimulatedKernel::new().with_bridge("br0", &["eth0"]);
        kernel.vlan_add("br0", 2, VlanMode::SelfCpu).await.unwrap();
        assert_eq!(kernel.vlans("br0").await.unwrap(), vec![VlanEntry::pvid_untagged(1), VlanEntry::tagged(2)]);
        assert!(kernel.vlan_add("eth0", 2, VlanMode::SelfCpu).await.is_err());
        assert_eq!(kernel.vlan_del("br0", 3, VlanMode::SelfCpu).await.unwrap_err().reason, NO_ENTRY);
    }

    #[tokio::test]
    async fn test_vlan_child_removed_with_parent() {
        let kernel = SimulatedKernel::new();
        kernel.add_bridge("br9").await.unwrap();
        let name = kernel.add_vlan("br9", 4).await.unwrap();
        assert_eq!(kernel.links(LinkKind::Vlan).await.unwrap(), vec![name]);
        kernel.delete_link("br9").await.unwrap();
        assert!(kernel.links(LinkKind::Vlan).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_phy_lost_without_rescue() {
        let kernel = SimulatedKernel::new().with_phy("phy0").with_phy("phy1");
        kernel.add_namespace("w1").await.unwrap();
        kernel.move_phy_to_namespace("phy0", "w1").await.unwrap();
        kernel.move_phy_to_namespace("phy1", "w1").await.unwrap();
        assert_eq!(kernel.namespace_phys("w1").await.unwrap(), vec!["phy0".to_string(), "phy1".to_string()]);
        kernel.rescue_phy("w1", "phy1").await.unwrap();
        kernel.delete_namespace("w1").await.unwrap();
        let phys = kernel.snapshot().phys;
        assert!(!phys.contains_key("phy0"));
        assert_eq!(phys.get("phy1"), Some(&None));
    }

    #[tokio::test]
    async fn test_listing_order() {
        let kernel = SimulatedKernel::new().with_listing_order(ListingOrder::Reversed);
        kernel.add_namespace("a").await.unwrap();
        kernel.add_namespace("b").await.unwrap();
        assert_eq!(kernel.namespaces().await.unwrap(), vec!["b".to_string(), "a".to_string()]);
        assert_eq!(kernel.journal(), vec!["netns add a".to_string(), "netns add b".to_string()]);
    }
}

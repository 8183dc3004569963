use std::collections::BTreeSet;
use l2lab_schemas::pod_config::NATIVE_VID;
use crate::netops::{LinkKind, NetworkOps, VlanMode};
use crate::reconciler::{pending, Reconciler};

impl<'a, N: NetworkOps + ?Sized> Reconciler<'a, N> {
    /// Tear down everything a previous run could have built. Virtual devices go before the bridges
    /// they hang off, namespaces go last once their radios are handed back.
    pub(super) async fn clean(&mut self) {
        tracing::info!("{}: cleaning previous configuration", self.report.pod);
        self.prune_wan_bridge().await;
        self.prune_trunk_ports().await;
        self.delete_links(LinkKind::Gretap).await;
        self.delete_links(LinkKind::Veth).await;
        self.delete_links(LinkKind::Vlan).await;
        self.clean_bridges().await;
        self.delete_namespaces().await;
    }

    /// The WAN bridge keeps the pod reachable, so it only loses the vlans it was given
    async fn prune_wan_bridge(&mut self) {
        let config = self.config;
        let wan = config.wan_bridge.name.as_str();
        let vlans = self.kernel.vlans(wan).await;
        let Some(vlans) = self.record(format!("list self vlans of {wan}"), vlans) else {
            return;
        };
        for entry in vlans.iter().filter(|e| e.vid != NATIVE_VID) {
            let res = self.kernel.vlan_del(wan, entry.vid, VlanMode::SelfCpu).await;
            self.record(format!("remove vid {} from {wan} self", entry.vid), res);
        }
    }

    async fn prune_trunk_ports(&mut self) {
        let config = self.config;
        for trunk in &config.trunk_ports {
            let vlans = self.kernel.vlans(trunk).await;
            if let Some(vlans) = self.record(format!("list vlans of {trunk}"), vlans) {
                for entry in vlans.iter().filter(|e| e.vid != NATIVE_VID) {
                    let res = self.kernel.vlan_del(trunk, entry.vid, VlanMode::Tagged).await;
                    self.record(format!("remove vid {} from trunk {trunk}", entry.vid), res);
                }
            }
            let res = self.kernel.set_learning(trunk, true).await;
            self.record(format!("enable learning on {trunk}"), res);
        }
    }

    /// Delete every link of a kind. The kernel is asked again after each deletion since removing
    /// one end of a veth pair also removes the other.
    async fn delete_links(&mut self, kind: LinkKind) {
        let mut attempted = BTreeSet::new();
        loop {
            let live = self.kernel.links(kind).await;
            let Some(live) = self.record(format!("list {kind} links"), live) else {
                return;
            };
            let Some(name) = pending(&live, &attempted).cloned() else {
                return;
            };
            attempted.insert(name.clone());
            let res = self.kernel.delete_link(&name).await;
            self.record(format!("delete {kind} {name}"), res);
        }
    }

    async fn clean_bridges(&mut self) {
        let config = self.config;
        let mut attempted = BTreeSet::new();
        loop {
            let live = self.kernel.links(LinkKind::Bridge).await;
            let Some(live) = self.record("list bridge links".to_string(), live) else {
                return;
            };
            let Some(bridge) = pending(&live, &attempted).cloned() else {
                return;
            };
            attempted.insert(bridge.clone());

            let keep: &[String] = if config.is_wan_bridge(&bridge) {
                &config.wan_bridge.members
            } else {
                &[]
            };
            let ports = self.kernel.bridge_ports(&bridge).await;
            if let Some(ports) = self.record(format!("list ports of {bridge}"), ports) {
                for port in ports.iter().filter(|p| !keep.contains(p)) {
                    let res = self.kernel.detach(port).await;
                    self.record(format!("detach {port} from {bridge}"), res);
                }
            }
            if config.is_wan_bridge(&bridge) {
                continue;
            }
            let res = self.kernel.set_link_state(&bridge, false).await;
            self.record(format!("set {bridge} down"), res);
            let res = self.kernel.delete_link(&bridge).await;
            self.record(format!("delete bridge {bridge}"), res);
        }
    }

    async fn delete_namespaces(&mut self) {
        let namespaces = self.kernel.namespaces().await;
        let Some(namespaces) = self.record("list namespaces".to_string(), namespaces) else {
            return;
        };
        for namespace in namespaces {
            // a radio inside a deleted namespace is lost, hand it back first
            let phys = self.kernel.namespace_phys(&namespace).await;
            if let Some(phys) = self.record(format!("list radios in {namespace}"), phys) {
                for phy in phys {
                    let res = self.kernel.rescue_phy(&namespace, &phy).await;
                    self.record(format!("rescue {phy} from {namespace}"), res);
                }
            }
            let res = self.kernel.delete_namespace(&namespace).await;
            self.record(format!("delete namespace {namespace}"), res);
        }
    }
}

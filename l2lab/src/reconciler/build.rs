use l2lab_schemas::pod_config::{BridgeConfig, ClientDescriptor, NATIVE_VID};
use crate::netops::{LinkKind, NetworkOps, VlanMode};
use crate::reconciler::Reconciler;

impl<'a, N: NetworkOps + ?Sized> Reconciler<'a, N> {
    pub(super) async fn build(&mut self) {
        let config = self.config;
        let wan = config.wan_bridge.name.as_str();
        tracing::info!("{}: building {} bridges", self.report.pod, config.bridges.len());

        let res = self.kernel.set_vlan_filtering(wan, true).await;
        self.record(format!("enable vlan filtering on {wan}"), res);

        for namespace in config.namespaces.keys() {
            let res = self.kernel.add_namespace(namespace).await;
            self.record(format!("create namespace {namespace}"), res);
        }
        for (name, tunnel) in &config.tunnels {
            let res = self.kernel.add_gretap(name, tunnel).await;
            self.record(format!("create gretap {name}"), res);
        }
        for (name, peer) in &config.veth_pairs {
            let res = self.kernel.add_veth(name, peer).await;
            self.record(format!("create veth {name} peer {peer}"), res);
        }
        for (name, bridge) in &config.bridges {
            self.build_bridge(name, bridge).await;
        }
    }

    async fn build_bridge(&mut self, name: &str, bridge: &BridgeConfig) {
        let config = self.config;
        let wan = config.wan_bridge.name.as_str();

        let existing = self.kernel.links(LinkKind::Bridge).await;
        if let Some(existing) = self.record("list bridge links".to_string(), existing) {
            if !existing.iter().any(|b| b == name) {
                let res = self.kernel.add_bridge(name).await;
                self.record(format!("create bridge {name}"), res);
            }
        }
        let res = self.kernel.set_link_state(name, true).await;
        self.record(format!("set {name} up"), res);
        let res = self.kernel.set_vlan_filtering(name, true).await;
        self.record(format!("enable vlan filtering on {name}"), res);

        if !config.is_wan_bridge(name) {
            // carry the segment between pods of the site and out of the WAN bridge, tagged
            for trunk in &config.trunk_ports {
                let res = self.kernel.vlan_add(trunk, bridge.vid, VlanMode::Tagged).await;
                self.record(format!("allow vid {} on trunk {trunk}", bridge.vid), res);
                let res = self.kernel.set_learning(trunk, false).await;
                self.record(format!("disable learning on {trunk}"), res);
            }
            let res = self.kernel.vlan_add(wan, bridge.vid, VlanMode::SelfCpu).await;
            self.record(format!("allow vid {} on {wan} self", bridge.vid), res);
            let res = self.kernel.add_vlan(wan, bridge.vid).await;
            if let Some(sub_interface) = self.record(format!("create vlan {wan}.{}", bridge.vid), res) {
                self.attach(name, &sub_interface).await;
            }
        }

        // DUT cables always land on the WAN bridge, the vid picks the segment
        for member in &bridge.physical_members {
            if !self.attach(wan, member).await {
                continue;
            }
            let res = self.kernel.vlan_del(member, NATIVE_VID, VlanMode::Tagged).await;
            self.record(format!("remove vid {NATIVE_VID} from {member}"), res);
            let res = self.kernel.vlan_add(member, bridge.vid, VlanMode::PvidUntagged).await;
            self.record(format!("set pvid {} untagged on {member}", bridge.vid), res);
            // roaming clients would otherwise stay pinned to the port they were first seen on
            let res = self.kernel.set_learning(member, false).await;
            self.record(format!("disable learning on {member}"), res);
        }
        for member in &bridge.virtual_members {
            self.attach(name, member).await;
        }
    }

    pub(super) async fn populate_namespaces(&mut self) {
        let config = self.config;
        for (namespace, client) in &config.namespaces {
            match client {
                ClientDescriptor::Wired { port } => {
                    let res = self.kernel.move_link_to_namespace(port, namespace).await;
                    self.record(format!("move {port} into {namespace}"), res);
                }
                ClientDescriptor::Wireless { phy } => {
                    let res = self.kernel.move_phy_to_namespace(phy, namespace).await;
                    self.record(format!("move {phy} into {namespace}"), res);
                }
            }
        }
    }
}

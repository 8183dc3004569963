use std::collections::{BTreeMap, BTreeSet};
use l2lab_schemas::inventory::{Inventory, Pod};
use l2lab_schemas::pod_config::{BridgeConfig, ClientDescriptor, PodConfig, TunnelConfig, NATIVE_VID};
use l2lab_schemas::topology::{DesiredTopology, LogicalBridge, Member, SimWirelessClient};
use crate::error::CompileError;

pub mod run;

pub use run::CompileRun;

/// Compile the desired topology into one declarative config per pod in the inventory. Pods that
/// take no part in the topology still get a config, which tears down whatever they had before.
pub fn compile(
    inventory: &Inventory,
    topology: &DesiredTopology,
) -> Result<BTreeMap<String, PodConfig>, CompileError> {
    let mut compiler = TopologyCompiler::new(inventory);
    for (name, bridge) in topology.bridges.iter() {
        compiler.add_logical_bridge(name, bridge)?;
    }
    for client in &topology.sim_wireless_clients {
        compiler.add_wireless_client(client)?;
    }
    Ok(compiler.configs)
}

/// Find the pod that hosts a simulated client's namespace
pub fn namespace_owner<'a>(configs: &'a BTreeMap<String, PodConfig>, namespace: &str) -> Option<&'a str> {
    configs.iter()
        .find(|(_, config)| config.namespaces.contains_key(namespace))
        .map(|(pod, _)| pod.as_str())
}

#[derive(Clone, Copy)]
enum MemberList {
    Physical,
    Virtual,
}

struct TopologyCompiler<'a> {
    inventory: &'a Inventory,
    run: CompileRun,
    configs: BTreeMap<String, PodConfig>,
}

impl<'a> TopologyCompiler<'a> {
    fn new(inventory: &'a Inventory) -> Self {
        let configs = inventory.pods()
            .map(|(_, name, pod)| {
                (name.to_string(), PodConfig::new(pod.wan_bridge.clone(), pod.trunk_ports.clone()))
            })
            .collect();
        Self {
            inventory,
            run: CompileRun::new(),
            configs,
        }
    }

    fn add_logical_bridge(&mut self, name: &str, bridge: &LogicalBridge) -> Result<(), CompileError> {
        if let Some(pod) = device_owner(self.inventory, name) {
            return Err(CompileError::ReservedBridgeName {
                bridge: name.to_string(),
                pod: pod.to_string(),
            });
        }
        let vid = self.run.next_vid()
            .ok_or_else(|| CompileError::VlanSpaceExhausted { bridge: name.to_string() })?;
        tracing::debug!("logical bridge {name} gets vid {vid}");
        let mut sites = BTreeSet::new();

        for member in &bridge.members {
            let (pod, device, list) = match member {
                Member::Dut { dut_name, dut_port } => {
                    let (pod, device) = self.inventory.find_dut_port(dut_name, dut_port)
                        .ok_or_else(|| CompileError::UnknownMember {
                            dut_name: dut_name.clone(),
                            dut_port: dut_port.clone(),
                        })?;
                    (pod.to_string(), device.to_string(), MemberList::Physical)
                }
                Member::SimWiredClient { pod, namespace } => {
                    locate(self.inventory, pod)?;
                    let (bridge_side, namespace_side) = self.run.next_veth_pair();
                    let config = self.config_mut(pod)?;
                    claim_namespace(config, pod, namespace, ClientDescriptor::Wired {
                        port: namespace_side.clone(),
                    })?;
                    config.veth_pairs.insert(bridge_side.clone(), namespace_side);
                    (pod.clone(), bridge_side, MemberList::Virtual)
                }
            };
            let (site, _) = locate(self.inventory, &pod)?;
            sites.insert(site.to_string());
            let effective = effective_bridge_name(self.inventory, name, bridge, &pod)?;
            let entry = bridge_entry(self.config_mut(&pod)?, &effective, vid);
            match list {
                MemberList::Physical => entry.physical_members.push(device),
                MemberList::Virtual => entry.virtual_members.push(device),
            }
        }

        if let Some(wan_site) = &bridge.wan {
            if !self.inventory.sites.contains_key(wan_site) {
                return Err(CompileError::UnknownSite { site: wan_site.clone() });
            }
            sites.insert(wan_site.clone());
        }

        self.span_sites(name, bridge, vid, &sites)
    }

    /// Give every pod of every touched site the bridge, then mesh the sites' tunneling pods
    fn span_sites(
        &mut self,
        name: &str,
        bridge: &LogicalBridge,
        vid: u16,
        sites: &BTreeSet<String>,
    ) -> Result<(), CompileError> {
        let inventory = self.inventory;
        for site in sites {
            let pods = inventory.sites.get(site)
                .ok_or_else(|| CompileError::UnknownSite { site: site.clone() })?
                .pods.keys();
            for pod in pods {
                let effective = effective_bridge_name(inventory, name, bridge, pod)?;
                bridge_entry(self.config_mut(pod)?, &effective, vid);
            }
        }

        let sites: Vec<&String> = sites.iter().collect();
        for (index, left_site) in sites.iter().enumerate() {
            for right_site in &sites[index + 1..] {
                let (left_pod, left) = tunneling_pod(inventory, left_site)?;
                let (right_pod, right) = tunneling_pod(inventory, right_site)?;
                let (key, device) = self.run.next_tunnel();
                tracing::debug!("{name}: {device} between {left_site} ({left_pod}) and {right_site} ({right_pod})");
                for (pod, local, remote) in [(left_pod, left, right), (right_pod, right, left)] {
                    let effective = effective_bridge_name(inventory, name, bridge, pod)?;
                    let config = self.config_mut(pod)?;
                    config.tunnels.insert(device.clone(), TunnelConfig {
                        local: local.host.clone(),
                        remote: remote.host.clone(),
                        key,
                    });
                    bridge_entry(config, &effective, vid).virtual_members.push(device.clone());
                }
            }
        }
        Ok(())
    }

    fn add_wireless_client(&mut self, client: &SimWirelessClient) -> Result<(), CompileError> {
        locate(self.inventory, &client.pod)?;
        let config = self.config_mut(&client.pod)?;
        claim_namespace(config, &client.pod, &client.namespace, ClientDescriptor::Wireless {
            phy: client.phy.clone(),
        })
    }

    fn config_mut(&mut self, pod: &str) -> Result<&mut PodConfig, CompileError> {
        self.configs.get_mut(pod)
            .ok_or_else(|| CompileError::UnknownPod { pod: pod.to_string() })
    }
}

fn locate<'a>(inventory: &'a Inventory, pod: &str) -> Result<(&'a str, &'a Pod), CompileError> {
    inventory.pods()
        .find(|(_, name, _)| *name == pod)
        .map(|(site, _, config)| (site, config))
        .ok_or_else(|| CompileError::UnknownPod { pod: pod.to_string() })
}

fn tunneling_pod<'a>(inventory: &'a Inventory, site: &str) -> Result<(&'a str, &'a Pod), CompileError> {
    let site_config = inventory.sites.get(site)
        .ok_or_else(|| CompileError::UnknownSite { site: site.to_string() })?;
    let pod = site_config.tunneling_pod.as_deref()
        .ok_or_else(|| CompileError::NoTunnelingPod { site: site.to_string() })?;
    site_config.pods.get_key_value(pod)
        .map(|(name, config)| (name.as_str(), config))
        .ok_or_else(|| CompileError::UnknownPod { pod: pod.to_string() })
}

/// The first pod that already owns a device or WAN bridge called `name`
fn device_owner<'a>(inventory: &'a Inventory, name: &str) -> Option<&'a str> {
    inventory.pods()
        .find(|(_, _, pod)| {
            pod.wan_bridge.name == name
                || pod.wan_bridge.members.iter().any(|m| m == name)
                || pod.trunk_ports.iter().any(|t| t == name)
                || pod.ethernet.contains_key(name)
        })
        .map(|(_, pod_name, _)| pod_name)
}

/// Pods in the egress site carry the segment on their WAN bridge, everyone else on a bridge named
/// after the logical bridge
fn effective_bridge_name(
    inventory: &Inventory,
    name: &str,
    bridge: &LogicalBridge,
    pod: &str,
) -> Result<String, CompileError> {
    let (site, config) = locate(inventory, pod)?;
    if bridge.wan.as_deref() == Some(site) {
        Ok(config.wan_bridge.name.clone())
    } else {
        Ok(name.to_string())
    }
}

fn bridge_entry<'c>(config: &'c mut PodConfig, bridge: &str, vid: u16) -> &'c mut BridgeConfig {
    let vid = if config.is_wan_bridge(bridge) { NATIVE_VID } else { vid };
    config.bridges.entry(bridge.to_string()).or_insert_with(|| BridgeConfig::new(vid))
}

fn claim_namespace(
    config: &mut PodConfig,
    pod: &str,
    namespace: &str,
    descriptor: ClientDescriptor,
) -> Result<(), CompileError> {
    if config.namespaces.contains_key(namespace) {
        return Err(CompileError::DuplicateNamespace {
            pod: pod.to_string(),
            namespace: namespace.to_string(),
        });
    }
    config.namespaces.insert(namespace.to_string(), descriptor);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use pretty_assertions::assert_eq;
    use l2lab_schemas::pod_config::WanBridge;
    use crate::fixtures::{inventory, topology, GUEST_TOPOLOGY};
    use super::*;

    fn compile_text(text: &str) -> Result<BTreeMap<String, PodConfig>, CompileError> {
        compile(&inventory(), &topology(text))
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_guest_scenario() {
        let configs = compile_text(GUEST_TOPOLOGY).unwrap();

        let mut pod1 = PodConfig::new(
            WanBridge { name: "br0".into(), members: strings(&["eth0", "eth1"]) },
            strings(&["eth1"]),
        );
        pod1.bridges.insert("br0".into(), BridgeConfig {
            vid: 1,
            physical_members: strings(&["eth2"]),
            virtual_members: strings(&["gretap1"]),
        });
        pod1.tunnels.insert("gretap1".into(), TunnelConfig {
            local: "10.0.0.1".into(),
            remote: "10.0.1.2".into(),
            key: 1,
        });
        assert_eq!(configs["pod1"], pod1);

        let mut pod2 = PodConfig::new(
            WanBridge { name: "br-wan".into(), members: strings(&["eth0"]) },
            vec![],
        );
        pod2.bridges.insert("guest".into(), BridgeConfig {
            vid: 2,
            physical_members: vec![],
            virtual_members: strings(&["veth0", "gretap1"]),
        });
        pod2.tunnels.insert("gretap1".into(), TunnelConfig {
            local: "10.0.1.2".into(),
            remote: "10.0.0.1".into(),
            key: 1,
        });
        pod2.veth_pairs.insert("veth0".into(), "veth1".into());
        pod2.namespaces.insert("c1".into(), ClientDescriptor::Wired { port: "veth1".into() });
        assert_eq!(configs["pod2"], pod2);

        // the other pod of the egress site carries the segment on its WAN bridge too
        assert_eq!(configs["pod4"].bridges["br0"], BridgeConfig::new(1));
        assert!(configs["pod3"].bridges.is_empty());
        assert!(configs["pod5"].bridges.is_empty());
    }

    #[test]
    fn test_every_pod_gets_a_config() {
        let configs = compile_text("bridges: {}").unwrap();
        let pods: Vec<&str> = configs.keys().map(String::as_str).collect();
        assert_eq!(pods, vec!["pod1", "pod2", "pod3", "pod4", "pod5"]);
        assert!(configs.values().all(|c| c.bridges.is_empty() && c.tunnels.is_empty()));
        assert_eq!(configs["pod4"].trunk_ports, strings(&["eth0"]));
    }

    #[test]
    fn test_vids_distinct_and_above_native() {
        let configs = compile_text(r#"
bridges:
  one:
    members: [{ type: dut, dut_name: ap1, dut_port: lan1 }]
  two:
    members: [{ type: dut, dut_name: ap1, dut_port: wan }]
  three:
    members: [{ type: sim_wired_client, pod: pod1, namespace: c3 }]
"#).unwrap();
        let bridges = &configs["pod1"].bridges;
        assert_eq!(bridges["one"].vid, 2);
        assert_eq!(bridges["two"].vid, 3);
        assert_eq!(bridges["three"].vid, 4);
        // pod4 shares the site, so it carries all three segments over the trunk
        let vids: BTreeSet<u16> = configs["pod4"].bridges.values().map(|b| b.vid).collect();
        assert_eq!(vids, BTreeSet::from([2, 3, 4]));
    }

    #[test]
    fn test_single_site_without_wan_has_no_tunnels() {
        let configs = compile_text(r#"
bridges:
  local:
    members:
      - { type: dut, dut_name: ap1, dut_port: lan1 }
      - { type: dut, dut_name: ap3, dut_port: lan1 }
"#).unwrap();
        assert!(configs.values().all(|c| c.tunnels.is_empty()));
        assert_eq!(configs["pod1"].bridges["local"].physical_members, strings(&["eth2"]));
        assert_eq!(configs["pod4"].bridges["local"].physical_members, strings(&["eth2"]));
        assert_eq!(configs["pod1"].bridges["local"].vid, 2);
    }

    #[test]
    fn test_full_mesh_over_three_sites() {
        let configs = compile_text(r#"
bridges:
  wide:
    members:
      - { type: dut, dut_name: ap1, dut_port: lan1 }
      - { type: dut, dut_name: ap2, dut_port: lan1 }
      - { type: sim_wired_client, pod: pod3, namespace: c1 }
"#).unwrap();

        // C(3, 2) links, two endpoints each
        let mut endpoints: HashMap<u32, Vec<(&str, &TunnelConfig)>> = HashMap::new();
        for (pod, config) in &configs {
            for (device, tunnel) in &config.tunnels {
                assert_eq!(*device, format!("gretap{}", tunnel.key));
                assert!(config.bridges["wide"].virtual_members.contains(device));
                endpoints.entry(tunnel.key).or_default().push((pod.as_str(), tunnel));
            }
        }
        assert_eq!(endpoints.len(), 3);
        for ends in endpoints.values() {
            assert_eq!(ends.len(), 2);
            assert_ne!(ends[0].0, ends[1].0);
            assert_eq!(ends[0].1.local, ends[1].1.remote);
            assert_eq!(ends[0].1.remote, ends[1].1.local);
        }
        // sites are meshed in sorted order: a-b, a-c, b-c
        assert_eq!(configs["pod1"].tunnels.keys().collect::<Vec<_>>(), vec!["gretap1", "gretap2"]);
        assert_eq!(configs["pod2"].tunnels.keys().collect::<Vec<_>>(), vec!["gretap1", "gretap3"]);
        assert_eq!(configs["pod3"].tunnels.keys().collect::<Vec<_>>(), vec!["gretap2", "gretap3"]);
        // only tunneling pods terminate tunnels
        assert!(configs["pod4"].tunnels.is_empty());
    }

    #[test]
    fn test_tunnel_keys_unique_across_bridges() {
        let configs = compile_text(r#"
bridges:
  first:
    members:
      - { type: dut, dut_name: ap1, dut_port: lan1 }
      - { type: dut, dut_name: ap2, dut_port: lan1 }
  second:
    members:
      - { type: dut, dut_name: ap1, dut_port: wan }
      - { type: sim_wired_client, pod: pod2, namespace: c2 }
"#).unwrap();
        let keys: Vec<u32> = configs["pod1"].tunnels.values().map(|t| t.key).collect();
        assert_eq!(keys, vec![1, 2]);
        assert_eq!(configs["pod1"].bridges["first"].virtual_members, strings(&["gretap1"]));
        assert_eq!(configs["pod1"].bridges["second"].virtual_members, strings(&["gretap2"]));
        assert_eq!(configs["pod2"].bridges["second"].virtual_members, strings(&["veth0", "gretap2"]));
    }

    #[test]
    fn test_pure_transit_egress_site() {
        let configs = compile_text(r#"
bridges:
  uplink:
    wan: lab-a
    members: [{ type: sim_wired_client, pod: pod3, namespace: c1 }]
"#).unwrap();
        assert_eq!(configs["pod1"].bridges["br0"].vid, 1);
        assert_eq!(configs["pod1"].bridges["br0"].virtual_members, strings(&["gretap1"]));
        assert!(configs["pod1"].bridges["br0"].physical_members.is_empty());
        assert_eq!(configs["pod3"].bridges["uplink"].virtual_members, strings(&["veth0", "gretap1"]));
    }

    #[test]
    fn test_wireless_client_only_adds_namespace() {
        let configs = compile_text(r#"
bridges: {}
sim_wireless_clients:
  - { pod: pod3, namespace: ns1, phy: phy0 }
"#).unwrap();
        let pod3 = &configs["pod3"];
        assert_eq!(pod3.namespaces["ns1"], ClientDescriptor::Wireless { phy: "phy0".into() });
        assert!(pod3.bridges.is_empty());
        assert!(pod3.veth_pairs.is_empty());
        assert_eq!(namespace_owner(&configs, "ns1"), Some("pod3"));
        assert_eq!(namespace_owner(&configs, "ns2"), None);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let text = r#"
bridges:
  b:
    wan: lab-b
    members:
      - { type: dut, dut_name: ap1, dut_port: lan1 }
      - { type: sim_wired_client, pod: pod3, namespace: c1 }
  a:
    members:
      - { type: sim_wired_client, pod: pod1, namespace: c2 }
      - { type: dut, dut_name: ap2, dut_port: lan1 }
"#;
        assert_eq!(compile_text(text).unwrap(), compile_text(text).unwrap());
    }

    #[test]
    fn test_unknown_member() {
        let res = compile_text("bridges:\n  x:\n    members: [{ type: dut, dut_name: ap9, dut_port: lan1 }]\n");
        assert_eq!(res.unwrap_err(), CompileError::UnknownMember {
            dut_name: "ap9".into(),
            dut_port: "lan1".into(),
        });
    }

    #[test]
    fn test_unknown_pod() {
        let res = compile_text("bridges:\n  x:\n    members: [{ type: sim_wired_client, pod: pod9, namespace: c1 }]\n");
        assert_eq!(res.unwrap_err(), CompileError::UnknownPod { pod: "pod9".into() });
        let res = compile_text("bridges: {}\nsim_wireless_clients: [{ pod: pod9, namespace: n, phy: phy0 }]\n");
        assert_eq!(res.unwrap_err(), CompileError::UnknownPod { pod: "pod9".into() });
    }

    #[test]
    fn test_unknown_site() {
        let res = compile_text("bridges:\n  x:\n    wan: lab-z\n    members: []\n");
        assert_eq!(res.unwrap_err(), CompileError::UnknownSite { site: "lab-z".into() });
    }

    #[test]
    fn test_site_without_tunneling_pod() {
        let res = compile_text(r#"
bridges:
  x:
    wan: lab-d
    members: [{ type: dut, dut_name: ap1, dut_port: lan1 }]
"#);
        assert_eq!(res.unwrap_err(), CompileError::NoTunnelingPod { site: "lab-d".into() });
    }

    #[test]
    fn test_bridge_named_after_wan_bridge() {
        // pod1's WAN bridge is br0, pod2's is br-wan
        let res = compile_text(r#"
bridges:
  br0:
    members:
      - { type: dut, dut_name: ap1, dut_port: lan1 }
      - { type: dut, dut_name: ap2, dut_port: lan1 }
"#);
        assert_eq!(res.unwrap_err(), CompileError::ReservedBridgeName {
            bridge: "br0".into(),
            pod: "pod1".into(),
        });
        let res = compile_text("bridges:\n  br-wan:\n    members: [{ type: sim_wired_client, pod: pod1, namespace: c1 }]\n");
        assert_eq!(res.unwrap_err(), CompileError::ReservedBridgeName {
            bridge: "br-wan".into(),
            pod: "pod2".into(),
        });
    }

    #[test]
    fn test_bridge_named_after_pod_device() {
        let res = compile_text("bridges:\n  eth2:\n    members: []\n");
        assert_eq!(res.unwrap_err(), CompileError::ReservedBridgeName {
            bridge: "eth2".into(),
            pod: "pod1".into(),
        });
        let res = compile_text("bridges:\n  eth1:\n    members: []\n");
        assert!(matches!(res, Err(CompileError::ReservedBridgeName { .. })));
    }

    #[test]
    fn test_vlan_space_exhausted() {
        let mut text = String::from("bridges:\n");
        for n in 0..4094 {
            text.push_str(&format!("  seg{n}:\n    members: []\n"));
        }
        let res = compile_text(&text);
        assert_eq!(res.unwrap_err(), CompileError::VlanSpaceExhausted { bridge: "seg4093".into() });
    }

    #[test]
    fn test_duplicate_namespace() {
        let res = compile_text(r#"
bridges:
  x:
    members: [{ type: sim_wired_client, pod: pod2, namespace: c1 }]
sim_wireless_clients:
  - { pod: pod2, namespace: c1, phy: phy0 }
"#);
        assert_eq!(res.unwrap_err(), CompileError::DuplicateNamespace {
            pod: "pod2".into(),
            namespace: "c1".into(),
        });
    }
}

use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use anyhow::Context;
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST};
use netlink_packet_route::link::nlas::{AfSpecBridge, BridgeVlanInfo, Info, InfoBridge, InfoData, InfoKind, Nla};
use netlink_packet_route::{
    LinkMessage, RtnlMessage, AF_BRIDGE, BRIDGE_FLAGS_SELF, BRIDGE_VLAN_INFO_PVID,
    BRIDGE_VLAN_INFO_UNTAGGED, IFLA_PROTINFO, RTEXT_FILTER_BRVLAN,
};
use netlink_packet_utils::nla::{DefaultNla, NLA_F_NESTED};
use netlink_packet_utils::Emitable;
use rtnetlink::{Handle, NetworkNamespace, NETNS_PATH};
use l2lab_schemas::pod_config::TunnelConfig;
use crate::error::OpError;
use crate::netops::{CommandRunner, HostTools, LinkKind, NetworkOps, SubprocessRunner, VlanEntry, VlanMode};

// linux/if_tunnel.h
const IFLA_GRE_IFLAGS: u16 = 2;
const IFLA_GRE_OFLAGS: u16 = 3;
const IFLA_GRE_IKEY: u16 = 4;
const IFLA_GRE_OKEY: u16 = 5;
const IFLA_GRE_LOCAL: u16 = 6;
const IFLA_GRE_REMOTE: u16 = 7;
const IFLA_GRE_PMTUDISC: u16 = 10;
const IFLA_GRE_IGNORE_DF: u16 = 19;
const GRE_KEY: u16 = 0x2000;

// linux/if_link.h
const IFLA_BRPORT_LEARNING: u16 = 8;

const MEMBER_MTU: u32 = 1500;

/// Network primitives spoken directly to the kernel over route netlink. Radios and the bridge
/// firewall have no rtnetlink interface and go through [`HostTools`].
pub struct NetlinkOps<R: CommandRunner = SubprocessRunner> {
    handle: Handle,
    tools: HostTools<R>,
}

impl NetlinkOps<SubprocessRunner> {
    /// Open a route netlink socket. Its connection is driven by a task on the current runtime.
    pub fn connect() -> anyhow::Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection().context("opening route netlink socket")?;
        tokio::spawn(connection);
        Ok(Self::with_tools(handle, HostTools::new()))
    }
}

fn reason(err: rtnetlink::Error) -> String {
    match err {
        rtnetlink::Error::NetlinkError(message) => message.to_string(),
        err => err.to_string(),
    }
}

fn failed(operation: String) -> impl FnOnce(rtnetlink::Error) -> OpError {
    move |err| OpError::new(operation, reason(err))
}

fn emit_attributes(attributes: &[DefaultNla]) -> Vec<u8> {
    let mut buffer = vec![0; attributes.buffer_len()];
    attributes.emit(&mut buffer);
    buffer
}

/// IFLA_INFO_DATA of a keyed gretap link. Keys and flags are big endian on the wire.
fn gretap_data(tunnel: &TunnelConfig) -> Result<Vec<u8>, String> {
    let local: Ipv4Addr = tunnel.local.parse()
        .map_err(|err| format!("local address {}: {err}", tunnel.local))?;
    let remote: Ipv4Addr = tunnel.remote.parse()
        .map_err(|err| format!("remote address {}: {err}", tunnel.remote))?;
    let flags = GRE_KEY.to_be_bytes().to_vec();
    let key = tunnel.key.to_be_bytes().to_vec();
    Ok(emit_attributes(&[
        DefaultNla::new(IFLA_GRE_LOCAL, local.octets().to_vec()),
        DefaultNla::new(IFLA_GRE_REMOTE, remote.octets().to_vec()),
        DefaultNla::new(IFLA_GRE_IFLAGS, flags.clone()),
        DefaultNla::new(IFLA_GRE_OFLAGS, flags),
        DefaultNla::new(IFLA_GRE_IKEY, key.clone()),
        DefaultNla::new(IFLA_GRE_OKEY, key),
        // nopmtudisc and ignore-df keep a 1500 mtu for whatever is bridged over the tunnel
        DefaultNla::new(IFLA_GRE_PMTUDISC, vec![0]),
        DefaultNla::new(IFLA_GRE_IGNORE_DF, vec![1]),
    ]))
}

fn link_kind(link: &LinkMessage) -> Option<LinkKind> {
    link.nlas.iter().find_map(|nla| match nla {
        Nla::Info(infos) => infos.iter().find_map(|info| match info {
            Info::Kind(InfoKind::GreTap) => Some(LinkKind::Gretap),
            Info::Kind(InfoKind::Veth) => Some(LinkKind::Veth),
            Info::Kind(InfoKind::Vlan) => Some(LinkKind::Vlan),
            Info::Kind(InfoKind::Bridge) => Some(LinkKind::Bridge),
            _ => None,
        }),
        _ => None,
    })
}

fn link_name(link: &LinkMessage) -> Option<&str> {
    link.nlas.iter().find_map(|nla| match nla {
        Nla::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

fn link_master(link: &LinkMessage) -> Option<u32> {
    link.nlas.iter().find_map(|nla| match nla {
        Nla::Master(index) => Some(*index),
        _ => None,
    })
}

/// An AF_BRIDGE message, which the kernel hands to the bridge code instead of the link itself
fn bridge_message(index: u32) -> LinkMessage {
    let mut message = LinkMessage::default();
    message.header.interface_family = AF_BRIDGE as u8;
    message.header.index = index;
    message
}

fn vlan_message(index: u32, vid: u16, mode: VlanMode) -> LinkMessage {
    let mut info = BridgeVlanInfo::default();
    info.vid = vid;
    let mut spec = Vec::new();
    match mode {
        VlanMode::Tagged => {}
        VlanMode::SelfCpu => spec.push(AfSpecBridge::Flags(BRIDGE_FLAGS_SELF)),
        VlanMode::PvidUntagged => info.flags = BRIDGE_VLAN_INFO_PVID | BRIDGE_VLAN_INFO_UNTAGGED,
    }
    spec.push(AfSpecBridge::VlanInfo(info));
    let mut message = bridge_message(index);
    message.nlas.push(Nla::AfSpecBridge(spec));
    message
}

/// Port settings only count as such inside a nested IFLA_PROTINFO
fn learning_message(index: u32, enabled: bool) -> LinkMessage {
    let protinfo = emit_attributes(&[DefaultNla::new(IFLA_BRPORT_LEARNING, vec![u8::from(enabled)])]);
    let mut message = bridge_message(index);
    message.nlas.push(Nla::Other(DefaultNla::new(IFLA_PROTINFO | NLA_F_NESTED, protinfo)));
    message
}

fn vlan_filtering_message(index: u32, enabled: bool) -> LinkMessage {
    let mut message = LinkMessage::default();
    message.header.index = index;
    message.nlas.push(Nla::Info(vec![
        Info::Kind(InfoKind::Bridge),
        Info::Data(InfoData::Bridge(vec![InfoBridge::VlanFiltering(u8::from(enabled))])),
    ]));
    message
}

/// Vlan filter entries of one device out of an AF_BRIDGE dump. A bridge port and the bridge
/// itself can both report, so entries are deduplicated.
fn vlan_entries(links: &[LinkMessage], index: u32) -> Vec<VlanEntry> {
    let mut entries: Vec<VlanEntry> = links.iter()
        .filter(|link| link.header.index == index)
        .flat_map(|link| link.nlas.iter())
        .filter_map(|nla| match nla {
            Nla::AfSpecBridge(spec) => Some(spec),
            _ => None,
        })
        .flatten()
        .filter_map(|spec| match spec {
            AfSpecBridge::VlanInfo(info) => Some(VlanEntry {
                vid: info.vid,
                pvid: info.flags & BRIDGE_VLAN_INFO_PVID != 0,
                untagged: info.flags & BRIDGE_VLAN_INFO_UNTAGGED != 0,
            }),
            _ => None,
        })
        .collect();
    entries.sort();
    entries.dedup();
    entries
}

impl<R: CommandRunner> NetlinkOps<R> {
    pub fn with_tools(handle: Handle, tools: HostTools<R>) -> Self {
        Self { handle, tools }
    }

    async fn dump(&self, operation: String) -> Result<Vec<LinkMessage>, OpError> {
        self.handle.link().get().execute().try_collect().await.map_err(failed(operation))
    }

    async fn index_of(&self, name: &str) -> Result<u32, OpError> {
        let operation = format!("look up {name}");
        let links: Vec<LinkMessage> = self.handle.link().get().match_name(name.to_string()).execute()
            .try_collect().await
            .map_err(failed(operation.clone()))?;
        links.first()
            .map(|link| link.header.index)
            .ok_or_else(|| OpError::new(operation, "no such device"))
    }

    /// RTM_NEWLINK on a link that exists, which the kernel treats as a change of its settings.
    /// The add request always asks for creation, so this one is sent by hand.
    async fn change_link(&self, message: LinkMessage, operation: String) -> Result<(), OpError> {
        let mut handle = self.handle.clone();
        let mut request = NetlinkMessage::from(RtnlMessage::NewLink(message));
        request.header.flags = NLM_F_REQUEST | NLM_F_ACK;
        let mut response = handle.request(request).map_err(failed(operation.clone()))?;
        while let Some(message) = response.next().await {
            if let NetlinkPayload::Error(err) = message.payload {
                // an error message without a code is the ack
                if err.code.is_some() {
                    return Err(OpError::new(operation, err.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<R: CommandRunner> NetworkOps for NetlinkOps<R> {
    async fn links(&self, kind: LinkKind) -> Result<Vec<String>, OpError> {
        let links = self.dump(format!("list {kind} links")).await?;
        Ok(links.iter()
            .filter(|link| link_kind(link) == Some(kind))
            .filter_map(link_name)
            .map(str::to_string)
            .collect())
    }

    async fn namespaces(&self) -> Result<Vec<String>, OpError> {
        let operation = "list namespaces";
        let mut entries = match tokio::fs::read_dir(NETNS_PATH).await {
            Ok(entries) => entries,
            // nothing ever created a namespace on this pod
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(OpError::new(operation, err.to_string())),
        };
        let mut namespaces = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|err| OpError::new(operation, err.to_string()))? {
            namespaces.push(entry.file_name().to_string_lossy().into_owned());
        }
        namespaces.sort();
        Ok(namespaces)
    }

    async fn bridge_ports(&self, bridge: &str) -> Result<Vec<String>, OpError> {
        let index = self.index_of(bridge).await?;
        let links = self.dump(format!("list ports of {bridge}")).await?;
        Ok(links.iter()
            .filter(|link| link_master(link) == Some(index))
            .filter_map(link_name)
            .map(str::to_string)
            .collect())
    }

    async fn vlans(&self, dev: &str) -> Result<Vec<VlanEntry>, OpError> {
        let index = self.index_of(dev).await?;
        let links: Vec<LinkMessage> = self.handle.link().get()
            .set_filter_mask(AF_BRIDGE as u8, RTEXT_FILTER_BRVLAN)
            .execute()
            .try_collect().await
            .map_err(failed(format!("list vlans of {dev}")))?;
        Ok(vlan_entries(&links, index))
    }

    async fn namespace_phys(&self, namespace: &str) -> Result<Vec<String>, OpError> {
        self.tools.namespace_phys(namespace).await
    }

    async fn forward_block_installed(&self) -> Result<bool, OpError> {
        self.tools.forward_block_installed().await
    }

    async fn add_gretap(&self, name: &str, tunnel: &TunnelConfig) -> Result<(), OpError> {
        let operation = format!("add gretap {name}");
        let data = gretap_data(tunnel).map_err(|reason| OpError::new(operation.clone(), reason))?;
        let mut request = self.handle.link().add();
        request.message_mut().nlas.push(Nla::IfName(name.to_string()));
        request.message_mut().nlas.push(Nla::Info(vec![
            Info::Kind(InfoKind::GreTap),
            Info::Data(InfoData::GreTap(data)),
        ]));
        request.execute().await.map_err(failed(operation))
    }

    async fn add_veth(&self, name: &str, peer: &str) -> Result<(), OpError> {
        self.handle.link().add().veth(name.to_string(), peer.to_string()).execute().await
            .map_err(failed(format!("add veth {name} peer {peer}")))
    }

    async fn add_vlan(&self, parent: &str, vid: u16) -> Result<String, OpError> {
        let name = format!("{parent}.{vid}");
        let parent_index = self.index_of(parent).await?;
        self.handle.link().add().vlan(name.clone(), parent_index, vid).execute().await
            .map_err(failed(format!("add vlan {name}")))?;
        Ok(name)
    }

    async fn delete_link(&self, name: &str) -> Result<(), OpError> {
        let index = self.index_of(name).await?;
        self.handle.link().del(index).execute().await.map_err(failed(format!("delete {name}")))
    }

    async fn add_bridge(&self, name: &str) -> Result<(), OpError> {
        self.handle.link().add().bridge(name.to_string()).execute().await
            .map_err(failed(format!("add bridge {name}")))
    }

    async fn set_link_state(&self, name: &str, up: bool) -> Result<(), OpError> {
        let index = self.index_of(name).await?;
        let request = self.handle.link().set(index);
        let request = if up { request.up() } else { request.down() };
        let state = if up { "up" } else { "down" };
        request.execute().await.map_err(failed(format!("set {name} {state}")))
    }

    async fn set_vlan_filtering(&self, bridge: &str, enabled: bool) -> Result<(), OpError> {
        let index = self.index_of(bridge).await?;
        self.change_link(
            vlan_filtering_message(index, enabled),
            format!("set vlan_filtering {} on {bridge}", u8::from(enabled)),
        ).await
    }

    async fn attach(&self, bridge: &str, member: &str) -> Result<(), OpError> {
        let member_index = self.index_of(member).await?;
        let bridge_index = self.index_of(bridge).await?;
        self.handle.link().set(member_index).up().mtu(MEMBER_MTU).execute().await
            .map_err(failed(format!("set {member} up mtu {MEMBER_MTU}")))?;
        self.handle.link().set(member_index).master(bridge_index).execute().await
            .map_err(failed(format!("set {member} master {bridge}")))
    }

    async fn detach(&self, member: &str) -> Result<(), OpError> {
        let index = self.index_of(member).await?;
        self.handle.link().set(index).nomaster().execute().await
            .map_err(failed(format!("set {member} nomaster")))
    }

    async fn vlan_add(&self, dev: &str, vid: u16, mode: VlanMode) -> Result<(), OpError> {
        let index = self.index_of(dev).await?;
        let mut request = self.handle.link().set(index);
        *request.message_mut() = vlan_message(index, vid, mode);
        request.execute().await.map_err(failed(format!("add vid {vid} to {dev}")))
    }

    async fn vlan_del(&self, dev: &str, vid: u16, mode: VlanMode) -> Result<(), OpError> {
        // pvid/untagged are attributes of an entry, the entry itself is removed by vid
        let mode = if mode == VlanMode::PvidUntagged { VlanMode::Tagged } else { mode };
        let index = self.index_of(dev).await?;
        let mut request = self.handle.link().del(index);
        *request.message_mut() = vlan_message(index, vid, mode);
        request.execute().await.map_err(failed(format!("delete vid {vid} from {dev}")))
    }

    async fn set_learning(&self, dev: &str, enabled: bool) -> Result<(), OpError> {
        let index = self.index_of(dev).await?;
        let mut request = self.handle.link().set(index);
        *request.message_mut() = learning_message(index, enabled);
        request.execute().await.map_err(failed(format!("set learning {} on {dev}", u8::from(enabled))))
    }

    async fn add_namespace(&self, name: &str) -> Result<(), OpError> {
        NetworkNamespace::add(name.to_string()).await.map_err(failed(format!("add namespace {name}")))
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), OpError> {
        NetworkNamespace::del(name.to_string()).await.map_err(failed(format!("delete namespace {name}")))
    }

    async fn move_link_to_namespace(&self, dev: &str, namespace: &str) -> Result<(), OpError> {
        let operation = format!("move {dev} into {namespace}");
        let index = self.index_of(dev).await?;
        let path = format!("{NETNS_PATH}{namespace}");
        // the fd has to stay open until the kernel has answered
        let netns = tokio::fs::File::open(&path).await
            .map_err(|err| OpError::new(operation.clone(), format!("{path}: {err}")))?;
        self.handle.link().set(index).setns_by_fd(netns.as_raw_fd()).execute().await
            .map_err(failed(operation))
    }

    async fn move_phy_to_namespace(&self, phy: &str, namespace: &str) -> Result<(), OpError> {
        self.tools.move_phy_to_namespace(phy, namespace).await
    }

    async fn rescue_phy(&self, namespace: &str, phy: &str) -> Result<(), OpError> {
        self.tools.rescue_phy(namespace, phy).await
    }

    async fn install_forward_block(&self) -> Result<(), OpError> {
        self.tools.install_forward_block().await
    }
}

#[cfg(test)]
mod tests {
    use netlink_packet_utils::nla::{Nla as _, NlasIterator};
    use pretty_assertions::assert_eq;
    use super::*;

    fn attributes(bytes: &[u8]) -> Vec<(u16, Vec<u8>)> {
        NlasIterator::new(bytes)
            .map(|nla| {
                let nla = nla.unwrap();
                (nla.kind(), nla.value().to_vec())
            })
            .collect()
    }

    fn link(index: u32, nlas: Vec<Nla>) -> LinkMessage {
        let mut message = LinkMessage::default();
        message.header.index = index;
        message.nlas = nlas;
        message
    }

    fn vlan_info(vid: u16, flags: u16) -> AfSpecBridge {
        let mut info = BridgeVlanInfo::default();
        info.vid = vid;
        info.flags = flags;
        AfSpecBridge::VlanInfo(info)
    }

    #[test]
    fn test_gretap_data() {
        let tunnel = TunnelConfig { local: "10.0.0.1".into(), remote: "10.0.1.2".into(), key: 3 };
        let data = gretap_data(&tunnel).unwrap();
        assert_eq!(attributes(&data), vec![
            (IFLA_GRE_LOCAL, vec![10, 0, 0, 1]),
            (IFLA_GRE_REMOTE, vec![10, 0, 1, 2]),
            (IFLA_GRE_IFLAGS, vec![0x20, 0]),
            (IFLA_GRE_OFLAGS, vec![0x20, 0]),
            (IFLA_GRE_IKEY, vec![0, 0, 0, 3]),
            (IFLA_GRE_OKEY, vec![0, 0, 0, 3]),
            (IFLA_GRE_PMTUDISC, vec![0]),
            (IFLA_GRE_IGNORE_DF, vec![1]),
        ]);
    }

    #[test]
    fn test_gretap_needs_ipv4_endpoints() {
        let tunnel = TunnelConfig { local: "pod1.lab".into(), remote: "10.0.1.2".into(), key: 1 };
        let reason = gretap_data(&tunnel).unwrap_err();
        assert!(reason.starts_with("local address pod1.lab"), "{reason}");
    }

    #[test]
    fn test_vlan_messages() {
        let tagged = vlan_message(7, 2, VlanMode::Tagged);
        assert_eq!(tagged.header.interface_family, AF_BRIDGE as u8);
        assert_eq!(tagged.header.index, 7);
        assert_eq!(tagged.nlas, vec![Nla::AfSpecBridge(vec![vlan_info(2, 0)])]);

        let cpu = vlan_message(3, 4, VlanMode::SelfCpu);
        assert_eq!(cpu.nlas, vec![Nla::AfSpecBridge(vec![
            AfSpecBridge::Flags(BRIDGE_FLAGS_SELF),
            vlan_info(4, 0),
        ])]);

        let access = vlan_message(9, 2, VlanMode::PvidUntagged);
        assert_eq!(access.nlas, vec![Nla::AfSpecBridge(vec![
            vlan_info(2, BRIDGE_VLAN_INFO_PVID | BRIDGE_VLAN_INFO_UNTAGGED),
        ])]);
    }

    #[test]
    fn test_learning_message() {
        for enabled in [false, true] {
            let message = learning_message(5, enabled);
            assert_eq!(message.header.interface_family, AF_BRIDGE as u8);
            let [Nla::Other(protinfo)] = message.nlas.as_slice() else {
                panic!("unexpected attributes {:?}", message.nlas);
            };
            assert_eq!(protinfo.kind(), IFLA_PROTINFO | NLA_F_NESTED);
            let mut value = vec![0; protinfo.value_len()];
            protinfo.emit_value(&mut value);
            assert_eq!(attributes(&value), vec![(IFLA_BRPORT_LEARNING, vec![u8::from(enabled)])]);
        }
    }

    #[test]
    fn test_vlan_filtering_message() {
        let message = vlan_filtering_message(4, true);
        assert_eq!(message.header.index, 4);
        assert_eq!(message.nlas, vec![Nla::Info(vec![
            Info::Kind(InfoKind::Bridge),
            Info::Data(InfoData::Bridge(vec![InfoBridge::VlanFiltering(1)])),
        ])]);
    }

    #[test]
    fn test_link_attributes() {
        let veth = link(7, vec![
            Nla::IfName("veth0".into()),
            Nla::Master(3),
            Nla::Info(vec![Info::Kind(InfoKind::Veth)]),
        ]);
        assert_eq!(link_kind(&veth), Some(LinkKind::Veth));
        assert_eq!(link_name(&veth), Some("veth0"));
        assert_eq!(link_master(&veth), Some(3));

        let gretap = link(8, vec![Nla::IfName("gretap1".into()), Nla::Info(vec![Info::Kind(InfoKind::GreTap)])]);
        assert_eq!(link_kind(&gretap), Some(LinkKind::Gretap));
        assert_eq!(link_master(&gretap), None);

        // physical ports carry no link info at all
        let eth = link(2, vec![Nla::IfName("eth0".into())]);
        assert_eq!(link_kind(&eth), None);
        let dummy = link(9, vec![Nla::Info(vec![Info::Kind(InfoKind::Dummy)])]);
        assert_eq!(link_kind(&dummy), None);
    }

    #[test]
    fn test_vlan_entries() {
        let pvid_untagged = BRIDGE_VLAN_INFO_PVID | BRIDGE_VLAN_INFO_UNTAGGED;
        let links = vec![
            link(3, vec![Nla::IfName("br0".into()), Nla::AfSpecBridge(vec![vlan_info(1, pvid_untagged), vlan_info(2, 0)])]),
            link(7, vec![Nla::IfName("eth2".into()), Nla::AfSpecBridge(vec![vlan_info(2, pvid_untagged)])]),
            link(3, vec![Nla::IfName("br0".into()), Nla::AfSpecBridge(vec![vlan_info(2, 0), vlan_info(3, 0)])]),
        ];
        assert_eq!(vlan_entries(&links, 3), vec![
            VlanEntry::pvid_untagged(1),
            VlanEntry::tagged(2),
            VlanEntry::tagged(3),
        ]);
        assert_eq!(vlan_entries(&links, 7), vec![VlanEntry::pvid_untagged(2)]);
        assert!(vlan_entries(&links, 9).is_empty());
    }
}

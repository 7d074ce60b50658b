use log::debug;
use netlink_packet_route::link::{
    AfSpecBridge, BridgeVlanInfo, BridgeVlanInfoFlags, LinkAttribute, LinkMessage,
};
use netlink_packet_route::AddressFamily;
use rtnetlink::Handle;

use crate::error::{ok_if_exists, ok_if_not_found, Result};

/// How a VLAN rides a bridge port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortMode {
    /// Access port: the VLAN is the port's PVID and egresses untagged.
    Access,
    /// Trunk member: frames carry the tag.
    Trunk,
}

fn vlan_message(port_index: u32, vid: u16, mode: PortMode) -> LinkMessage {
    let flags = match mode {
        PortMode::Access => BridgeVlanInfoFlags::Pvid | BridgeVlanInfoFlags::Untagged,
        PortMode::Trunk => BridgeVlanInfoFlags::empty(),
    };
    let mut msg = LinkMessage::default();
    msg.header.interface_family = AddressFamily::Bridge;
    msg.header.index = port_index;
    msg.attributes
        .push(LinkAttribute::AfSpecBridge(vec![AfSpecBridge::VlanInfo(
            BridgeVlanInfo { flags, vid },
        )]));
    msg
}

/// Adds a VLAN entry to a bridge port. An entry that is already present is
/// success.
pub async fn bridge_vlan_add(
    handle: &Handle,
    port_index: u32,
    vid: u16,
    mode: PortMode,
) -> Result<()> {
    debug!("bridge vlan add vid {vid} ({mode:?}) on port {port_index}");
    ok_if_exists(
        handle
            .link()
            .set_port(vlan_message(port_index, vid, mode))
            .execute()
            .await
            .map_err(crate::NetError::from),
    )
}

/// Removes a VLAN entry from a bridge port. An absent entry is success.
pub async fn bridge_vlan_del(
    handle: &Handle,
    port_index: u32,
    vid: u16,
    mode: PortMode,
) -> Result<()> {
    debug!("bridge vlan del vid {vid} ({mode:?}) on port {port_index}");
    let mut req = handle.link().del(port_index);
    let source = vlan_message(port_index, vid, mode);
    let msg = req.message_mut();
    msg.header.interface_family = source.header.interface_family;
    msg.attributes = source.attributes;
    ok_if_not_found(req.execute().await.map_err(crate::NetError::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlan_entry(msg: &LinkMessage) -> Option<&BridgeVlanInfo> {
        msg.attributes.iter().find_map(|attr| match attr {
            LinkAttribute::AfSpecBridge(entries) => entries.iter().find_map(|e| match e {
                AfSpecBridge::VlanInfo(info) => Some(info),
                _ => None,
            }),
            _ => None,
        })
    }

    #[test]
    fn test_access_port_message_carries_pvid_untagged() {
        let msg = vlan_message(7, 10, PortMode::Access);
        assert_eq!(msg.header.interface_family, AddressFamily::Bridge);
        assert_eq!(msg.header.index, 7);

        let info = vlan_entry(&msg).unwrap();
        assert_eq!(info.vid, 10);
        assert!(info.flags.contains(BridgeVlanInfoFlags::Pvid));
        assert!(info.flags.contains(BridgeVlanInfoFlags::Untagged));
    }

    #[test]
    fn test_trunk_member_message_carries_bare_tag() {
        let msg = vlan_message(3, 200, PortMode::Trunk);
        let info = vlan_entry(&msg).unwrap();
        assert_eq!(info.vid, 200);
        assert!(info.flags.is_empty());
    }
}

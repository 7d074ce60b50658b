use log::info;
use netlink_packet_route::link::{InfoBridge, InfoData};
use rtnetlink::packet_core::{NLM_F_ACK, NLM_F_REQUEST};
use rtnetlink::{Handle, LinkBridge};

use crate::error::{ok_if_exists, Result};
use crate::ip::link;

/// Creates a VLAN-aware bridge if absent and returns its index. An existing
/// bridge is reused; VLAN filtering is (re)applied either way so a bridge
/// left behind by an earlier run converges.
pub async fn ensure_bridge(handle: &Handle, name: &str) -> Result<u32> {
    let msg = LinkBridge::new(name)
        .set_info_data(InfoData::Bridge(vec![InfoBridge::VlanFiltering(true)]))
        .up()
        .build();

    ok_if_exists(link::add_link(handle, msg).await)?;

    let index = link::link_index(handle, name).await?;

    let mut set = LinkBridge::new(name)
        .set_info_data(InfoData::Bridge(vec![InfoBridge::VlanFiltering(true)]))
        .build();
    set.header.index = index;
    handle
        .link()
        .add(set)
        .set_flags(NLM_F_ACK | NLM_F_REQUEST)
        .execute()
        .await
        .map_err(crate::NetError::from)?;

    info!("bridge {name} ready (index {index}, vlan filtering on)");
    Ok(index)
}

/// Deletes a bridge; an absent bridge is success.
pub async fn del_bridge(handle: &Handle, name: &str) -> Result<()> {
    link::del_link_by_name(handle, name).await
}

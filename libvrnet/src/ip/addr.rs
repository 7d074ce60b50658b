use std::net::IpAddr;

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use log::debug;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::AddressFamily;
use rtnetlink::Handle;

use crate::error::{ok_if_exists, ok_if_not_found, Result};

/// Dumps the raw IPv4 address messages attached to a link.
pub async fn addr_messages(handle: &Handle, index: u32) -> Result<Vec<AddressMessage>> {
    let mut stream = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();

    let mut messages = Vec::new();
    while let Some(msg) = stream.try_next().await.map_err(crate::NetError::from)? {
        if msg.header.family == AddressFamily::Inet {
            messages.push(msg);
        }
    }
    Ok(messages)
}

/// Reads the IPv4 address of an address message, with its prefix length.
pub fn message_ipv4(msg: &AddressMessage) -> Option<Ipv4Network> {
    msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(IpAddr::V4(ip)) => {
            Ipv4Network::new(*ip, msg.header.prefix_len).ok()
        }
        _ => None,
    })
}

/// Lists the IPv4 addresses on a link.
pub async fn addr_list_v4(handle: &Handle, index: u32) -> Result<Vec<Ipv4Network>> {
    Ok(addr_messages(handle, index)
        .await?
        .iter()
        .filter_map(message_ipv4)
        .collect())
}

/// Adds an address; an address that is already present is success.
pub async fn addr_add(handle: &Handle, index: u32, addr: IpAddr, prefix_len: u8) -> Result<()> {
    debug!("addr add {addr}/{prefix_len} on link {index}");
    ok_if_exists(
        handle
            .address()
            .add(index, addr, prefix_len)
            .execute()
            .await
            .map_err(crate::NetError::from),
    )
}

/// Deletes one address from a link; an absent address is success.
pub async fn addr_del(handle: &Handle, index: u32, addr: IpAddr) -> Result<()> {
    let target = match addr {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Ok(()),
    };
    for msg in addr_messages(handle, index).await? {
        if message_ipv4(&msg).map(|net| net.ip()) == Some(target) {
            return ok_if_not_found(
                handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(crate::NetError::from),
            );
        }
    }
    Ok(())
}

/// Removes every IPv4 address from a link.
pub async fn addr_flush(handle: &Handle, index: u32) -> Result<()> {
    for msg in addr_messages(handle, index).await? {
        ok_if_not_found(
            handle
                .address()
                .del(msg)
                .execute()
                .await
                .map_err(crate::NetError::from),
        )?;
    }
    Ok(())
}

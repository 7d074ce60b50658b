use std::os::fd::RawFd;

use futures::TryStreamExt;
use log::debug;
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use rtnetlink::{Handle, LinkMessageBuilder, LinkUnspec};

use crate::error::{NetError, Result};

/// Looks a link up by name. A missing link is `None`, not an error.
pub async fn link_by_name(handle: &Handle, name: &str) -> Result<Option<LinkMessage>> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(e) => {
            let err = NetError::from(e);
            if err.is_not_found() {
                Ok(None)
            } else {
                Err(err)
            }
        }
    }
}

/// Like [`link_by_name`] but a missing link is an error.
pub async fn link_index(handle: &Handle, name: &str) -> Result<u32> {
    link_by_name(handle, name)
        .await?
        .map(|link| link.header.index)
        .ok_or_else(|| NetError::LinkNotFound(name.to_string()))
}

pub async fn link_exists(handle: &Handle, name: &str) -> Result<bool> {
    Ok(link_by_name(handle, name).await?.is_some())
}

pub async fn add_link(handle: &Handle, msg: LinkMessage) -> Result<()> {
    handle.link().add(msg).execute().await?;
    Ok(())
}

pub async fn set_link(handle: &Handle, msg: LinkMessage) -> Result<()> {
    handle.link().set(msg).execute().await?;
    Ok(())
}

pub async fn link_set_up(handle: &Handle, index: u32) -> Result<()> {
    let mut msg = LinkMessage::default();
    msg.header.index = index;
    msg.header.flags |= LinkFlags::Up;
    msg.header.change_mask |= LinkFlags::Up;
    set_link(handle, msg).await
}

pub async fn link_set_down(handle: &Handle, index: u32) -> Result<()> {
    let mut msg = LinkMessage::default();
    msg.header.index = index;
    msg.header.flags &= !LinkFlags::Up;
    msg.header.change_mask |= LinkFlags::Up;
    set_link(handle, msg).await
}

/// Enslaves a link to a bridge (or any controller device).
pub async fn link_set_master(handle: &Handle, index: u32, master_index: u32) -> Result<()> {
    let mut msg = LinkMessage::default();
    msg.header.index = index;
    msg.attributes.push(LinkAttribute::Controller(master_index));
    set_link(handle, msg).await
}

/// Moves a link into the namespace referenced by `ns_fd`.
pub async fn move_link_to_ns(handle: &Handle, index: u32, ns_fd: RawFd) -> Result<()> {
    let mut msg = LinkMessageBuilder::<LinkUnspec>::new().setns_by_fd(ns_fd).build();
    msg.header.index = index;
    set_link(handle, msg).await
}

pub async fn del_link(handle: &Handle, index: u32) -> Result<()> {
    handle.link().del(index).execute().await?;
    Ok(())
}

/// Removes an interface by name; an absent interface is success.
pub async fn del_link_by_name(handle: &Handle, name: &str) -> Result<()> {
    match link_by_name(handle, name).await? {
        Some(link) => {
            debug!("deleting link {name} (index {})", link.header.index);
            del_link(handle, link.header.index).await
        }
        None => Ok(()),
    }
}

/// Extracts the interface name from a link message.
pub fn link_name(msg: &LinkMessage) -> Option<&str> {
    msg.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::IfName(name) => Some(name.as_str()),
        _ => None,
    })
}

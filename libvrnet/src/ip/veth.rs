use std::os::fd::RawFd;

use log::info;
use netlink_packet_route::link::{InfoData, InfoKind, InfoVeth};
use rtnetlink::{Handle, LinkMessageBuilder, LinkUnspec, LinkVeth};

use crate::error::{ok_if_exists, Result};
use crate::ip::link;

/// Creates a veth pair with both ends in the handle's namespace. A pair that
/// already exists (by the first end's name) is left untouched.
pub async fn ensure_veth_pair(handle: &Handle, name: &str, peer_name: &str) -> Result<()> {
    if link::link_exists(handle, name).await? {
        return Ok(());
    }
    info!("creating veth pair {name}/{peer_name}");
    let peer = LinkMessageBuilder::<LinkUnspec>::new()
        .name(peer_name.to_string())
        .build();
    let msg = LinkMessageBuilder::<LinkVeth>::new_with_info_kind(InfoKind::Veth)
        .name(name.to_string())
        .up()
        .set_info_data(InfoData::Veth(InfoVeth::Peer(peer)))
        .build();
    ok_if_exists(link::add_link(handle, msg).await)
}

/// Creates a veth pair whose peer end is born directly inside another
/// namespace, under its final name.
///
/// # Arguments
/// * `name` - Name of the end staying in the handle's namespace.
/// * `peer_name` - Name of the peer end inside the target namespace.
/// * `peer_ns_fd` - File descriptor of the target network namespace.
///
/// # Returns
/// * `Ok(())` - The pair exists, whether just created or already present.
/// * `Err(NetError)` - The kernel rejected the creation.
pub async fn ensure_veth_with_peer_in_ns(
    handle: &Handle,
    name: &str,
    peer_name: &str,
    peer_ns_fd: RawFd,
) -> Result<()> {
    if link::link_exists(handle, name).await? {
        return Ok(());
    }
    info!("creating veth pair {name}/{peer_name} (peer in fd {peer_ns_fd})");
    let peer = LinkMessageBuilder::<LinkUnspec>::new()
        .name(peer_name.to_string())
        .setns_by_fd(peer_ns_fd)
        .build();
    let msg = LinkMessageBuilder::<LinkVeth>::new_with_info_kind(InfoKind::Veth)
        .name(name.to_string())
        .up()
        .set_info_data(InfoData::Veth(InfoVeth::Peer(peer)))
        .build();
    ok_if_exists(link::add_link(handle, msg).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns::netns::root_handle;

    #[tokio::test]
    #[ignore = "requires root and a live netlink socket"]
    async fn test_ensure_veth_pair_is_idempotent() {
        let handle = root_handle().unwrap();
        ensure_veth_pair(&handle, "vrtest0", "vrtest1").await.unwrap();
        ensure_veth_pair(&handle, "vrtest0", "vrtest1").await.unwrap();
        link::del_link_by_name(&handle, "vrtest0").await.unwrap();
    }
}

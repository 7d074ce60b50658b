use std::net::Ipv4Addr;
use std::sync::Arc;

use common::router::netmask_to_prefix;
use libvrnet::ip::vlan::PortMode;
use libvrnet::ip::{addr, link, route, rule, veth, vlan};
use libvrnet::ns::netns::Netns;
use log::{debug, info};
use netlink_packet_route::route::RouteScope;
use rtnetlink::Handle;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};

/// Firewall mark steered into the policy routing table.
pub const DEFAULT_FWMARK: u32 = 200;
/// Routing table holding each container's egress routes.
pub const DEFAULT_TABLE: u32 = 200;

/// Canonical in-container interface names.
pub const CONTAINER_INTERNAL_IFNAME: &str = "ethint";
pub const CONTAINER_EXTERNAL_IFNAME: &str = "ethext";

/// Which of the two layer-2 paths an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Internal,
    External,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Internal, Side::External];

    pub fn container_ifname(self) -> &'static str {
        match self {
            Side::Internal => CONTAINER_INTERNAL_IFNAME,
            Side::External => CONTAINER_EXTERNAL_IFNAME,
        }
    }

    fn host_prefix(self) -> &'static str {
        match self {
            Side::Internal => "int",
            Side::External => "ext",
        }
    }
}

/// Host-side veth name for a container: `int<cid7>` / `ext<cid7>`.
pub fn host_veth_name(side: Side, container_id: &str) -> Result<String> {
    let short = container_id
        .get(..7)
        .ok_or_else(|| DaemonError::Config(format!("container id {container_id:?} shorter than 7 characters")))?;
    Ok(format!("{}{}", side.host_prefix(), short))
}

/// Per-container kernel programming. Every operation is idempotent; the
/// reconciler retries freely.
pub struct RouterBinding {
    cfg: Arc<DaemonConfig>,
    root: Handle,
}

impl RouterBinding {
    pub fn new(cfg: Arc<DaemonConfig>, root: Handle) -> Self {
        Self { cfg, root }
    }

    /// Creates the host/container veth pair for one side, enslaves the host
    /// end to the side's bridge, and brings both ends up. A host end that
    /// already exists makes the whole call a no-op.
    pub async fn attach_veth(&self, container_id: &str, pid: i32, side: Side) -> Result<()> {
        let host_name = host_veth_name(side, container_id)?;
        if link::link_exists(&self.root, &host_name).await? {
            return Ok(());
        }

        let bridge_index = link::link_by_name(&self.root, self.cfg.bridge_name(side))
            .await?
            .map(|l| l.header.index)
            .ok_or_else(|| {
                DaemonError::Programming(format!("bridge {} is absent", self.cfg.bridge_name(side)))
            })?;

        let ns = Netns::from_pid(pid)?;
        veth::ensure_veth_with_peer_in_ns(
            &self.root,
            &host_name,
            side.container_ifname(),
            ns.raw_fd(),
        )
        .await?;

        let host_index = link::link_index(&self.root, &host_name).await?;
        link::link_set_master(&self.root, host_index, bridge_index).await?;
        link::link_set_up(&self.root, host_index).await?;

        let container = ns.handle()?;
        let peer_index = link::link_index(&container, side.container_ifname()).await?;
        link::link_set_up(&container, peer_index).await?;

        info!(
            "attached {host_name} to {} (peer {} in pid {pid})",
            self.cfg.bridge_name(side),
            side.container_ifname()
        );
        Ok(())
    }

    /// Replaces whatever addresses `eth<side>` carries with exactly
    /// `ip/prefix(netmask)` and brings the link up.
    pub async fn assign_address(
        &self,
        pid: i32,
        side: Side,
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
    ) -> Result<()> {
        let prefix = netmask_to_prefix(netmask).ok_or_else(|| {
            DaemonError::Config(format!("non-contiguous netmask {netmask}"))
        })?;

        let ns = Netns::from_pid(pid)?;
        let handle = ns.handle()?;
        let index = link::link_index(&handle, side.container_ifname()).await?;

        addr::addr_flush(&handle, index).await?;
        addr::addr_add(&handle, index, ip.into(), prefix).await?;
        link::link_set_up(&handle, index).await?;

        info!(
            "assigned {ip}/{prefix} to {} in pid {pid}",
            side.container_ifname()
        );
        Ok(())
    }

    /// Re-tags a container's two host-side ports. The access (PVID,
    /// untagged) entries follow the container; the trunk tags on the
    /// uplinks are shared across containers, so the old tag is only removed
    /// once the caller knows no other container uses it.
    pub async fn set_vlan(
        &self,
        container_id: &str,
        new_vlan: u16,
        old_vlan: u16,
        old_vlan_still_in_use: bool,
    ) -> Result<()> {
        if old_vlan != 0 {
            for side in Side::BOTH {
                let port = host_veth_name(side, container_id)?;
                if let Some(link) = link::link_by_name(&self.root, &port).await? {
                    vlan::bridge_vlan_del(&self.root, link.header.index, old_vlan, PortMode::Access)
                        .await?;
                }
                if !old_vlan_still_in_use {
                    let uplink = link::link_index(&self.root, self.cfg.uplink(side)).await?;
                    vlan::bridge_vlan_del(&self.root, uplink, old_vlan, PortMode::Trunk).await?;
                }
            }
        }

        if new_vlan != 0 {
            for side in Side::BOTH {
                let port = host_veth_name(side, container_id)?;
                let port_index = link::link_index(&self.root, &port).await?;
                vlan::bridge_vlan_add(&self.root, port_index, new_vlan, PortMode::Access).await?;

                let uplink = link::link_index(&self.root, self.cfg.uplink(side)).await?;
                vlan::bridge_vlan_add(&self.root, uplink, new_vlan, PortMode::Trunk).await?;
            }
        }

        info!("vlan for {container_id}: {old_vlan} -> {new_vlan}");
        Ok(())
    }

    /// Points the default route of `table` inside the container at
    /// `gateway`, replacing any previous default route there.
    pub async fn set_default_gateway(&self, pid: i32, gateway: Ipv4Addr, table: u32) -> Result<()> {
        let ns = Netns::from_pid(pid)?;
        let handle = ns.handle()?;

        if let Some(existing) = route::default_route_in_table(&handle, table).await? {
            route::route_del(&handle, &existing).await?;
        }
        route::route_add(
            &handle,
            &route::RouteEntry {
                gateway: Some(gateway),
                table,
                scope: RouteScope::Universe,
                ..Default::default()
            },
        )
        .await?;

        info!("default route in table {table} via {gateway} (pid {pid})");
        Ok(())
    }

    /// Clones the kernel's connected-scope routes for an interface into an
    /// alternate table, preserving destination, scope, source and link.
    pub async fn mirror_routes_to_table(
        &self,
        pid: i32,
        interface_name: &str,
        table: u32,
    ) -> Result<()> {
        let ns = Netns::from_pid(pid)?;
        let handle = ns.handle()?;
        let index = link::link_index(&handle, interface_name).await?;

        for mut entry in route::connected_routes(&handle, index).await? {
            entry.table = table;
            debug!("mirroring {entry:?} into table {table}");
            route::route_add(&handle, &entry).await?;
        }
        Ok(())
    }

    /// Installs `fwmark <mark> lookup <table>` inside the container if it
    /// is not there yet.
    pub async fn install_fwmark_rule(&self, pid: i32, mark: u32, table: u32) -> Result<()> {
        let ns = Netns::from_pid(pid)?;
        let handle = ns.handle()?;

        if rule::fwmark_rule_exists(&handle, mark, table).await? {
            return Ok(());
        }
        rule::rule_add_fwmark(&handle, mark, table).await?;
        info!("installed fwmark {mark} -> table {table} rule (pid {pid})");
        Ok(())
    }

    /// Deletes the host-side veth of one side; the kernel removes the
    /// in-container peer with it. Absent veths are success.
    pub async fn clear_veth(&self, container_id: &str, side: Side) -> Result<()> {
        let host_name = host_veth_name(side, container_id)?;
        link::del_link_by_name(&self.root, &host_name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_veth_name_truncates_to_seven() {
        let cid = "abc1234567890def";
        assert_eq!(host_veth_name(Side::Internal, cid).unwrap(), "intabc1234");
        assert_eq!(host_veth_name(Side::External, cid).unwrap(), "extabc1234");

        let exact = "abc1234";
        assert_eq!(host_veth_name(Side::Internal, exact).unwrap(), "intabc1234");
    }

    #[test]
    fn test_host_veth_name_rejects_short_ids() {
        let err = host_veth_name(Side::Internal, "abc12").unwrap_err();
        assert!(matches!(err, DaemonError::Config(_)));
    }

    #[test]
    fn test_side_names() {
        assert_eq!(Side::Internal.container_ifname(), "ethint");
        assert_eq!(Side::External.container_ifname(), "ethext");
    }
}

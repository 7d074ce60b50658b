use std::net::Ipv4Addr;

use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use log::debug;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteScope};
use rtnetlink::{Handle, RouteMessageBuilder};

use crate::error::{ok_if_exists, ok_if_not_found, Result};

pub const MAIN_TABLE: u32 = 254;

/// One IPv4 route, decoupled from the netlink wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// `None` is the default route.
    pub dst: Option<Ipv4Network>,
    pub gateway: Option<Ipv4Addr>,
    pub oif: Option<u32>,
    pub src: Option<Ipv4Addr>,
    pub scope: RouteScope,
    pub table: u32,
}

impl Default for RouteEntry {
    fn default() -> Self {
        Self {
            dst: None,
            gateway: None,
            oif: None,
            src: None,
            scope: RouteScope::Universe,
            table: MAIN_TABLE,
        }
    }
}

impl RouteEntry {
    pub fn is_default(&self) -> bool {
        match self.dst {
            None => true,
            Some(net) => net.prefix() == 0,
        }
    }
}

/// Dumps all IPv4 routes visible to the handle (every table).
pub async fn route_list_v4(handle: &Handle) -> Result<Vec<RouteEntry>> {
    let msg = RouteMessageBuilder::<Ipv4Addr>::new().build();
    let mut stream = handle.route().get(msg).execute();

    let mut routes = Vec::new();
    while let Some(msg) = stream.try_next().await.map_err(crate::NetError::from)? {
        let mut entry = RouteEntry {
            scope: msg.header.scope,
            table: msg.header.table as u32,
            ..Default::default()
        };
        let mut dst_ip = None;
        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => dst_ip = Some(*ip),
                RouteAttribute::Gateway(RouteAddress::Inet(ip)) => entry.gateway = Some(*ip),
                RouteAttribute::PrefSource(RouteAddress::Inet(ip)) => entry.src = Some(*ip),
                RouteAttribute::Oif(index) => entry.oif = Some(*index),
                RouteAttribute::Table(table) => entry.table = *table,
                _ => {}
            }
        }
        if let Some(ip) = dst_ip {
            entry.dst = Ipv4Network::new(ip, msg.header.destination_prefix_length).ok();
        }
        routes.push(entry);
    }
    Ok(routes)
}

/// The connected-scope routes the kernel installed for an interface, from
/// the main table.
pub async fn connected_routes(handle: &Handle, oif: u32) -> Result<Vec<RouteEntry>> {
    Ok(route_list_v4(handle)
        .await?
        .into_iter()
        .filter(|r| r.oif == Some(oif) && r.scope == RouteScope::Link && r.table == MAIN_TABLE)
        .collect())
}

/// The gateway of the main-table default route, if one is installed.
pub async fn default_gateway(handle: &Handle) -> Result<Option<Ipv4Addr>> {
    Ok(route_list_v4(handle)
        .await?
        .into_iter()
        .find(|r| r.table == MAIN_TABLE && r.is_default() && r.gateway.is_some())
        .and_then(|r| r.gateway))
}

/// The default route of a given table, if present.
pub async fn default_route_in_table(handle: &Handle, table: u32) -> Result<Option<RouteEntry>> {
    Ok(route_list_v4(handle)
        .await?
        .into_iter()
        .find(|r| r.table == table && r.is_default()))
}

fn build_message(route: &RouteEntry) -> netlink_packet_route::route::RouteMessage {
    let dst = route
        .dst
        .unwrap_or_else(|| Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap());
    let mut builder = RouteMessageBuilder::<Ipv4Addr>::new()
        .destination_prefix(dst.ip(), dst.prefix())
        .scope(route.scope)
        .table_id(route.table);
    if let Some(gw) = route.gateway {
        builder = builder.gateway(gw);
    }
    if let Some(oif) = route.oif {
        builder = builder.output_interface(oif);
    }
    if let Some(src) = route.src {
        builder = builder.pref_source(src);
    }
    builder.build()
}

/// Installs a route; a route that is already present is success.
pub async fn route_add(handle: &Handle, route: &RouteEntry) -> Result<()> {
    debug!("route add {route:?}");
    ok_if_exists(
        handle
            .route()
            .add(build_message(route))
            .execute()
            .await
            .map_err(crate::NetError::from),
    )
}

/// Deletes a route; an absent route is success.
pub async fn route_del(handle: &Handle, route: &RouteEntry) -> Result<()> {
    debug!("route del {route:?}");
    ok_if_not_found(
        handle
            .route()
            .del(build_message(route))
            .execute()
            .await
            .map_err(crate::NetError::from),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_message_sets_table_and_gateway() {
        let entry = RouteEntry {
            gateway: Some(Ipv4Addr::new(192, 168, 9, 1)),
            table: 200,
            ..Default::default()
        };
        let msg = build_message(&entry);

        assert!(msg.attributes.iter().any(|a| matches!(
            a,
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) if *ip == Ipv4Addr::new(192, 168, 9, 1)
        )));
        let table_attr = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Table(t) => Some(*t),
            _ => None,
        });
        assert!(table_attr == Some(200) || msg.header.table as u32 == 200);
        assert_eq!(msg.header.destination_prefix_length, 0);
    }

    #[test]
    fn test_build_message_preserves_connected_route_shape() {
        let entry = RouteEntry {
            dst: Some("192.168.9.0/24".parse().unwrap()),
            oif: Some(4),
            src: Some(Ipv4Addr::new(192, 168, 9, 10)),
            scope: RouteScope::Link,
            table: 200,
            ..Default::default()
        };
        let msg = build_message(&entry);

        assert_eq!(msg.header.destination_prefix_length, 24);
        assert_eq!(msg.header.scope, RouteScope::Link);
        assert!(msg
            .attributes
            .iter()
            .any(|a| matches!(a, RouteAttribute::Oif(4))));
        assert!(msg.attributes.iter().any(|a| matches!(
            a,
            RouteAttribute::PrefSource(RouteAddress::Inet(ip)) if *ip == Ipv4Addr::new(192, 168, 9, 10)
        )));
    }

    #[test]
    fn test_default_route_detection() {
        assert!(RouteEntry::default().is_default());
        assert!(RouteEntry {
            dst: Some(Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).unwrap()),
            ..Default::default()
        }
        .is_default());
        assert!(!RouteEntry {
            dst: Some("10.0.0.0/24".parse().unwrap()),
            ..Default::default()
        }
        .is_default());
    }

    #[tokio::test]
    #[ignore = "requires root and a live netlink socket"]
    async fn test_route_list_v4() {
        let handle = crate::ns::netns::root_handle().unwrap();
        let routes = route_list_v4(&handle).await.unwrap();
        assert!(routes.iter().any(|r| r.table == MAIN_TABLE));
    }
}

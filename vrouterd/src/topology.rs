use std::net::Ipv4Addr;
use std::path::Path;

use ipnetwork::Ipv4Network;
use libvrnet::ip::{addr, bridge, link, route, veth};
use log::{error, info, warn};
use rtnetlink::Handle;
use serde::{Deserialize, Serialize};

use crate::binding::Side;
use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};

pub const SNAPSHOT_PATH: &str = "/run/vrouterd/origin.json";

/// Captured state of the host's uplinks at install time: everything needed
/// to put them back verbatim on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OriginSnapshot {
    pub internal_uplink: String,
    pub external_uplink: String,
    pub internal_addrs: Vec<Ipv4Network>,
    pub external_addrs: Vec<Ipv4Network>,
    pub default_gateway: Option<Ipv4Addr>,
    pub synthesized_veths: Vec<String>,
}

impl OriginSnapshot {
    pub fn uplink(&self, side: Side) -> &str {
        match side {
            Side::Internal => &self.internal_uplink,
            Side::External => &self.external_uplink,
        }
    }

    pub fn addrs(&self, side: Side) -> &[Ipv4Network] {
        match side {
            Side::Internal => &self.internal_addrs,
            Side::External => &self.external_addrs,
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::Transient(format!("{}: {e}", path.display())))?;
        let snapshot = serde_json::from_str(&content)
            .map_err(|e| DaemonError::Config(format!("{}: {e}", path.display())))?;
        Ok(Some(snapshot))
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DaemonError::Transient(format!("{}: {e}", parent.display())))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DaemonError::Programming(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| DaemonError::Transient(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}

/// Installs the host-side scaffold once and returns the origin snapshot.
/// Safe to re-run after a crash: every step is idempotent, and a snapshot
/// persisted by an earlier run wins over re-capturing uplinks that were
/// already stripped.
pub async fn install(handle: &Handle, cfg: &DaemonConfig) -> Result<OriginSnapshot> {
    install_at(handle, cfg, Path::new(SNAPSHOT_PATH)).await
}

pub async fn install_at(
    handle: &Handle,
    cfg: &DaemonConfig,
    snapshot_path: &Path,
) -> Result<OriginSnapshot> {
    let persisted = match OriginSnapshot::load(snapshot_path) {
        Ok(snap) => snap,
        Err(e) => {
            warn!("ignoring unreadable origin snapshot: {e}");
            None
        }
    };
    if persisted.is_some() {
        info!("reusing origin snapshot from {}", snapshot_path.display());
    }

    let mut snapshot = OriginSnapshot {
        internal_uplink: cfg.internal_interface.clone(),
        external_uplink: cfg.external_interface.clone(),
        ..Default::default()
    };
    for side in Side::BOTH {
        let base = cfg.veth_base(side);
        snapshot.synthesized_veths.push(format!("{base}0"));
        snapshot.synthesized_veths.push(format!("{base}1"));
    }

    snapshot.default_gateway = match &persisted {
        Some(p) => p.default_gateway,
        None => route::default_gateway(handle).await?,
    };

    // capture first, wire after: everything install removes from an uplink
    // must already be in the snapshot when it is removed
    for side in Side::BOTH {
        let captured = match &persisted {
            Some(p) => Ok(p.addrs(side).to_vec()),
            None => capture_uplink_addrs(handle, cfg.uplink(side)).await,
        };
        match captured {
            Ok(addrs) => match side {
                Side::Internal => snapshot.internal_addrs = addrs,
                Side::External => snapshot.external_addrs = addrs,
            },
            Err(e) => error!("snapshotting {} failed: {e}", cfg.uplink(side)),
        }
    }
    if let Err(e) = snapshot.persist(snapshot_path) {
        warn!("could not persist origin snapshot: {e}");
    }

    for side in Side::BOTH {
        // one broken side must not leave the other unwired
        if let Err(e) = install_side(handle, cfg, side, snapshot.addrs(side)).await {
            error!("install of {side:?} side failed: {e}");
        }
    }

    if let Some(gateway) = snapshot.default_gateway {
        let entry = route::RouteEntry {
            gateway: Some(gateway),
            ..Default::default()
        };
        if let Err(e) = route::route_add(handle, &entry).await {
            error!("re-installing default gateway {gateway} failed: {e}");
        }
    }

    info!("host topology installed: {snapshot:?}");
    Ok(snapshot)
}

async fn capture_uplink_addrs(handle: &Handle, uplink_name: &str) -> Result<Vec<Ipv4Network>> {
    let index = link::link_index(handle, uplink_name).await?;
    Ok(addr::addr_list_v4(handle, index).await?)
}

/// Wires one side: bridge, `<base>0`/`<base>1` veth pair, uplink and
/// `<base>0` enslaved to the bridge, uplink addresses migrated onto
/// `<base>1`.
async fn install_side(
    handle: &Handle,
    cfg: &DaemonConfig,
    side: Side,
    addrs: &[Ipv4Network],
) -> Result<()> {
    let bridge_name = cfg.bridge_name(side);
    let uplink_name = cfg.uplink(side);
    let base = cfg.veth_base(side);
    let veth0 = format!("{base}0");
    let veth1 = format!("{base}1");

    let bridge_index = bridge::ensure_bridge(handle, bridge_name).await?;
    veth::ensure_veth_pair(handle, &veth0, &veth1).await?;

    let uplink_index = link::link_index(handle, uplink_name).await?;
    link::link_set_master(handle, uplink_index, bridge_index).await?;
    let veth0_index = link::link_index(handle, &veth0).await?;
    link::link_set_master(handle, veth0_index, bridge_index).await?;

    // the uplink becomes a plain bridge port; host-bound traffic now enters
    // through <base>1
    let veth1_index = link::link_index(handle, &veth1).await?;
    for net in addrs {
        addr::addr_del(handle, uplink_index, net.ip().into()).await?;
        addr::addr_add(handle, veth1_index, net.ip().into(), net.prefix()).await?;
    }

    link::link_set_up(handle, uplink_index).await?;
    link::link_set_up(handle, veth0_index).await?;
    link::link_set_up(handle, veth1_index).await?;
    link::link_set_up(handle, bridge_index).await?;

    info!("{side:?} side wired: uplink {uplink_name} + {veth0} on {bridge_name}, addresses on {veth1}");
    Ok(())
}

/// Puts the host back the way install found it. Every step logs and
/// continues; restore must run to completion.
pub async fn restore(handle: &Handle, cfg: &DaemonConfig, snapshot: &OriginSnapshot) {
    restore_at(handle, cfg, snapshot, Path::new(SNAPSHOT_PATH)).await
}

pub async fn restore_at(
    handle: &Handle,
    cfg: &DaemonConfig,
    snapshot: &OriginSnapshot,
    snapshot_path: &Path,
) {
    for side in Side::BOTH {
        if let Err(e) = bridge::del_bridge(handle, cfg.bridge_name(side)).await {
            error!("deleting bridge {} failed: {e}", cfg.bridge_name(side));
        }
    }

    for side in Side::BOTH {
        let uplink_name = snapshot.uplink(side);
        match link::link_index(handle, uplink_name).await {
            Ok(index) => {
                for net in snapshot.addrs(side) {
                    if let Err(e) = addr::addr_add(handle, index, net.ip().into(), net.prefix()).await
                    {
                        error!("restoring {net} on {uplink_name} failed: {e}");
                    }
                }
                if let Err(e) = link::link_set_up(handle, index).await {
                    error!("bringing {uplink_name} up failed: {e}");
                }
            }
            Err(e) => error!("uplink {uplink_name} not restorable: {e}"),
        }
    }

    for name in &snapshot.synthesized_veths {
        if let Err(e) = link::del_link_by_name(handle, name).await {
            error!("deleting synthesized veth {name} failed: {e}");
        }
    }

    if let Some(gateway) = snapshot.default_gateway {
        let entry = route::RouteEntry {
            gateway: Some(gateway),
            ..Default::default()
        };
        if let Err(e) = route::route_add(handle, &entry).await {
            error!("restoring default gateway {gateway} failed: {e}");
        }
    }

    if snapshot_path.exists() {
        if let Err(e) = std::fs::remove_file(snapshot_path) {
            warn!("could not remove origin snapshot: {e}");
        }
    }

    info!("host topology restored");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> OriginSnapshot {
        OriginSnapshot {
            internal_uplink: "eth0".to_string(),
            external_uplink: "eth1".to_string(),
            internal_addrs: vec!["10.0.0.5/24".parse().unwrap()],
            external_addrs: vec!["192.168.9.5/24".parse().unwrap()],
            default_gateway: Some("192.168.9.1".parse().unwrap()),
            synthesized_veths: vec![
                "intif0".to_string(),
                "intif1".to_string(),
                "extif0".to_string(),
                "extif1".to_string(),
            ],
        }
    }

    #[test]
    fn test_snapshot_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("origin.json");

        let snapshot = sample_snapshot();
        snapshot.persist(&path).unwrap();

        let reloaded = OriginSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(reloaded, snapshot);
    }

    #[test]
    fn test_snapshot_load_missing_is_none() {
        assert_eq!(
            OriginSnapshot::load(Path::new("/nonexistent/origin.json")).unwrap(),
            None
        );
    }

    #[test]
    fn test_snapshot_side_accessors() {
        let snapshot = sample_snapshot();
        assert_eq!(snapshot.uplink(Side::Internal), "eth0");
        assert_eq!(snapshot.uplink(Side::External), "eth1");
        assert_eq!(snapshot.addrs(Side::External)[0].prefix(), 24);
    }
}

use std::net::Ipv4Addr;

use common::VirtualRouterSpec;

/// One kernel-facing step derived by comparing the desired spec against the
/// last applied one. Applied strictly in the order produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    SetVlan {
        new_vlan: u16,
        old_vlan: u16,
    },
    AssignInternalAddress {
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
    },
    AssignExternalAddress {
        ip: Ipv4Addr,
        netmask: Ipv4Addr,
    },
    SetDefaultGateway {
        gateway: Ipv4Addr,
    },
}

/// Computes the ordered actions that converge a workload from `last` to
/// `desired`. No prior state means every field changed. An untagged spec
/// (`vlan_number == 0`) that stays untagged produces no VLAN action at all.
pub fn diff(last: Option<&VirtualRouterSpec>, desired: &VirtualRouterSpec) -> Vec<SyncAction> {
    let mut actions = Vec::new();

    let old_vlan = last.map(|s| s.vlan_number).unwrap_or(0);
    if old_vlan != desired.vlan_number {
        actions.push(SyncAction::SetVlan {
            new_vlan: desired.vlan_number,
            old_vlan,
        });
    }

    let internal_changed = last.is_none_or(|s| {
        s.internal_ip != desired.internal_ip || s.internal_netmask != desired.internal_netmask
    });
    if internal_changed {
        actions.push(SyncAction::AssignInternalAddress {
            ip: desired.internal_ip,
            netmask: desired.internal_netmask,
        });
    }

    let external_changed = last.is_none_or(|s| {
        s.external_ip != desired.external_ip || s.external_netmask != desired.external_netmask
    });
    if external_changed {
        actions.push(SyncAction::AssignExternalAddress {
            ip: desired.external_ip,
            netmask: desired.external_netmask,
        });
    }

    if last.is_none_or(|s| s.gateway_ip != desired.gateway_ip) {
        actions.push(SyncAction::SetDefaultGateway {
            gateway: desired.gateway_ip,
        });
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VirtualRouterSpec {
        VirtualRouterSpec {
            vlan_number: 10,
            internal_ip: "10.0.0.10".parse().unwrap(),
            internal_netmask: "255.255.255.0".parse().unwrap(),
            external_ip: "192.168.9.10".parse().unwrap(),
            external_netmask: "255.255.255.0".parse().unwrap(),
            gateway_ip: "192.168.9.1".parse().unwrap(),
        }
    }

    #[test]
    fn test_no_prior_state_changes_everything() {
        let desired = spec();
        let actions = diff(None, &desired);
        assert_eq!(
            actions,
            vec![
                SyncAction::SetVlan {
                    new_vlan: 10,
                    old_vlan: 0
                },
                SyncAction::AssignInternalAddress {
                    ip: desired.internal_ip,
                    netmask: desired.internal_netmask,
                },
                SyncAction::AssignExternalAddress {
                    ip: desired.external_ip,
                    netmask: desired.external_netmask,
                },
                SyncAction::SetDefaultGateway {
                    gateway: desired.gateway_ip
                },
            ]
        );
    }

    #[test]
    fn test_untagged_spec_never_touches_vlan() {
        let mut desired = spec();
        desired.vlan_number = 0;
        let actions = diff(None, &desired);
        assert!(!actions.iter().any(|a| matches!(a, SyncAction::SetVlan { .. })));
    }

    #[test]
    fn test_identical_spec_is_empty_diff() {
        let desired = spec();
        assert!(diff(Some(&desired), &desired).is_empty());
    }

    #[test]
    fn test_gateway_only_change_produces_one_action() {
        let last = spec();
        let mut desired = spec();
        desired.gateway_ip = "192.168.9.254".parse().unwrap();

        let actions = diff(Some(&last), &desired);
        assert_eq!(
            actions,
            vec![SyncAction::SetDefaultGateway {
                gateway: desired.gateway_ip
            }]
        );
    }

    #[test]
    fn test_vlan_only_change_skips_addresses_and_gateway() {
        let last = spec();
        let mut desired = spec();
        desired.vlan_number = 20;

        let actions = diff(Some(&last), &desired);
        assert_eq!(
            actions,
            vec![SyncAction::SetVlan {
                new_vlan: 20,
                old_vlan: 10
            }]
        );
    }

    #[test]
    fn test_netmask_change_reassigns_address() {
        let last = spec();
        let mut desired = spec();
        desired.internal_netmask = "255.255.248.0".parse().unwrap();

        let actions = diff(Some(&last), &desired);
        assert_eq!(
            actions,
            vec![SyncAction::AssignInternalAddress {
                ip: desired.internal_ip,
                netmask: desired.internal_netmask,
            }]
        );
    }

    #[test]
    fn test_vlan_can_return_to_untagged() {
        let last = spec();
        let mut desired = spec();
        desired.vlan_number = 0;

        let actions = diff(Some(&last), &desired);
        assert_eq!(
            actions,
            vec![SyncAction::SetVlan {
                new_vlan: 0,
                old_vlan: 10
            }]
        );
    }
}

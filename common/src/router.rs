use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::ObjectMeta;

/// Declarative description of one virtual router's network personality.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualRouter {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: VirtualRouterSpec,
}

/// Addresses are host addresses, not CIDRs; the netmask travels separately
/// as a dotted quad. `vlan_number == 0` means untagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualRouterSpec {
    #[serde(default)]
    pub vlan_number: u16,
    #[serde(rename = "internalIP")]
    pub internal_ip: Ipv4Addr,
    pub internal_netmask: Ipv4Addr,
    #[serde(rename = "externalIP")]
    pub external_ip: Ipv4Addr,
    pub external_netmask: Ipv4Addr,
    #[serde(rename = "gatewayIP")]
    pub gateway_ip: Ipv4Addr,
}

impl Default for VirtualRouterSpec {
    fn default() -> Self {
        Self {
            vlan_number: 0,
            internal_ip: Ipv4Addr::UNSPECIFIED,
            internal_netmask: Ipv4Addr::UNSPECIFIED,
            external_ip: Ipv4Addr::UNSPECIFIED,
            external_netmask: Ipv4Addr::UNSPECIFIED,
            gateway_ip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Converts a dotted-quad netmask into a prefix length, rejecting
/// non-contiguous masks.
pub fn netmask_to_prefix(netmask: Ipv4Addr) -> Option<u8> {
    let bits = u32::from(netmask);
    let prefix = bits.count_ones();
    if prefix > 0 && bits != u32::MAX << (32 - prefix) {
        return None;
    }
    Some(prefix as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netmask_to_prefix() {
        assert_eq!(netmask_to_prefix("255.255.255.0".parse().unwrap()), Some(24));
        assert_eq!(netmask_to_prefix("255.255.255.255".parse().unwrap()), Some(32));
        assert_eq!(netmask_to_prefix("255.255.248.0".parse().unwrap()), Some(21));
        assert_eq!(netmask_to_prefix("0.0.0.0".parse().unwrap()), Some(0));
    }

    #[test]
    fn test_netmask_to_prefix_rejects_holes() {
        assert_eq!(netmask_to_prefix("255.0.255.0".parse().unwrap()), None);
        assert_eq!(netmask_to_prefix("0.255.255.255".parse().unwrap()), None);
    }

    #[test]
    fn test_spec_json_field_names() {
        let spec: VirtualRouterSpec = serde_json::from_str(
            r#"{
                "vlanNumber": 10,
                "internalIP": "10.0.0.10",
                "internalNetmask": "255.255.255.0",
                "externalIP": "192.168.9.10",
                "externalNetmask": "255.255.255.0",
                "gatewayIP": "192.168.9.1"
            }"#,
        )
        .unwrap();
        assert_eq!(spec.vlan_number, 10);
        assert_eq!(spec.gateway_ip, "192.168.9.1".parse::<Ipv4Addr>().unwrap());
    }
}

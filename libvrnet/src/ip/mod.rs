pub mod addr;
pub mod bridge;
pub mod link;
pub mod route;
pub mod rule;
pub mod veth;
pub mod vlan;

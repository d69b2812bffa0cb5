//! Domain models for the VPC topology engine.
//!
//! This module contains the core data structures used throughout the crate:
//! - [`Ipv4`] - IPv4 block with CIDR notation support
//! - [`SubnetType`] and [`SubnetInfo`] - subnet roles and per-subnet records
//! - [`Vpc`] and [`VpcState`] - the VPC and its topology snapshot
//! - [`Task`] and [`TaskConfig`] - units of work and their payloads

mod ipv4;
mod subnet;
mod task;
mod vpc;

// Re-export public types
pub use ipv4::{
    broadcast_addr, get_cidr_mask, ip_after_subnet, next_subnet_ipv4, prefix_for_addresses,
    usable_hosts, Ipv4, MAX_LENGTH,
};
pub use subnet::{CloudSubnet, SubnetInfo, SubnetType};
pub use task::{
    AddAvailabilityZoneTaskData, NetworkingConfig, Task, TaskConfig, TaskLogEntry, TaskStatus,
    UpdateNetworkingTaskData,
};
pub use vpc::{
    az_letter, AvailabilityZoneInfra, EdgeAssociationType, Firewall, InternetGatewayInfo,
    NatGatewayInfo, ResolverRuleAssociation, RouteInfo, RouteTableInfo, SecurityGroup,
    TransitGatewayAttachment, Vpc, VpcState, VpcType,
};

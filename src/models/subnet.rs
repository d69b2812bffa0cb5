//! Subnet roles and per-subnet records.

use super::Ipv4;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role class of a subnet. Every AZ of a VPC replicates the same groups.
///
/// The set is closed: an unknown type in a snapshot fails deserialization.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubnetType {
    Private,
    Public,
    App,
    Data,
    Web,
    Transport,
    Transitive,
    Security,
    Management,
    Shared,
    #[serde(rename = "Shared-OC")]
    SharedOc,
    Unroutable,
    Firewall,
}

impl SubnetType {
    pub const ALL: [SubnetType; 13] = [
        SubnetType::Private,
        SubnetType::Public,
        SubnetType::App,
        SubnetType::Data,
        SubnetType::Web,
        SubnetType::Transport,
        SubnetType::Transitive,
        SubnetType::Security,
        SubnetType::Management,
        SubnetType::Shared,
        SubnetType::SharedOc,
        SubnetType::Unroutable,
        SubnetType::Firewall,
    ];

    /// Private, Public and Firewall subnets route through the AZ-level tables;
    /// every other type gets its own custom route table.
    pub fn is_default_type(&self) -> bool {
        matches!(
            self,
            SubnetType::Private | SubnetType::Public | SubnetType::Firewall
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubnetType::Private => "Private",
            SubnetType::Public => "Public",
            SubnetType::App => "App",
            SubnetType::Data => "Data",
            SubnetType::Web => "Web",
            SubnetType::Transport => "Transport",
            SubnetType::Transitive => "Transitive",
            SubnetType::Security => "Security",
            SubnetType::Management => "Management",
            SubnetType::Shared => "Shared",
            SubnetType::SharedOc => "Shared-OC",
            SubnetType::Unroutable => "Unroutable",
            SubnetType::Firewall => "Firewall",
        }
    }
}

impl fmt::Display for SubnetType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One subnet as recorded in an AZ of the topology snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SubnetInfo {
    pub subnet_id: String,
    pub group_name: String,
    /// Empty until Update Networking associates a route table.
    #[serde(default)]
    pub route_table_association_id: String,
    /// Only set for non-default subnet types.
    #[serde(default)]
    pub custom_route_table_id: String,
}

impl SubnetInfo {
    pub fn new(subnet_id: &str, group_name: &str) -> Self {
        SubnetInfo {
            subnet_id: subnet_id.to_string(),
            group_name: group_name.to_string(),
            ..Default::default()
        }
    }
}

/// A subnet as reported by the cloud networking API.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CloudSubnet {
    pub subnet_id: String,
    pub availability_zone: String,
    pub cidr: Ipv4,
}

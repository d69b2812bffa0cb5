//! VPC record and its topology snapshot.
//!
//! The snapshot is read and written as a whole; maps are ordered so that the
//! serialized form of an unchanged snapshot is byte-identical between runs.

use super::{Ipv4, SubnetInfo, SubnetType};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// VPC generation, persisted as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VpcType {
    #[default]
    V1,
    Legacy,
    Exception,
    V1Firewall,
    MigratingV1ToV1Firewall,
    MigratingV1FirewallToV1,
}

impl VpcType {
    pub fn code(&self) -> u8 {
        match self {
            VpcType::V1 => 0,
            VpcType::Legacy => 1,
            VpcType::Exception => 2,
            VpcType::V1Firewall => 3,
            VpcType::MigratingV1ToV1Firewall => 4,
            VpcType::MigratingV1FirewallToV1 => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<VpcType> {
        match code {
            0 => Some(VpcType::V1),
            1 => Some(VpcType::Legacy),
            2 => Some(VpcType::Exception),
            3 => Some(VpcType::V1Firewall),
            4 => Some(VpcType::MigratingV1ToV1Firewall),
            5 => Some(VpcType::MigratingV1FirewallToV1),
            _ => None,
        }
    }

    /// Routing for this VPC goes through the managed firewall.
    pub fn has_firewall(&self) -> bool {
        matches!(self, VpcType::V1Firewall | VpcType::MigratingV1ToV1Firewall)
    }

    /// Only settled, managed VPCs may gain availability zones.
    pub fn can_add_zones(&self) -> bool {
        matches!(self, VpcType::V1 | VpcType::V1Firewall)
    }

    /// Exception VPCs are configured by hand and never touched.
    pub fn is_managed(&self) -> bool {
        !matches!(self, VpcType::Exception)
    }
}

impl Serialize for VpcType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for VpcType {
    fn deserialize<D>(deserializer: D) -> Result<VpcType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let code = u8::deserialize(deserializer)?;
        VpcType::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown VPC type code: {code}")))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInfo {
    pub destination: String,
    #[serde(default)]
    pub nat_gateway_id: String,
    #[serde(default)]
    pub internet_gateway_id: String,
    #[serde(default)]
    pub transit_gateway_id: String,
    #[serde(default)]
    pub peering_connection_id: String,
    #[serde(default)]
    pub vpc_endpoint_id: String,
}

impl RouteInfo {
    pub fn via_nat(destination: &str, nat_gateway_id: &str) -> Self {
        RouteInfo {
            destination: destination.to_string(),
            nat_gateway_id: nat_gateway_id.to_string(),
            ..Default::default()
        }
    }

    pub fn via_internet_gateway(destination: &str, internet_gateway_id: &str) -> Self {
        RouteInfo {
            destination: destination.to_string(),
            internet_gateway_id: internet_gateway_id.to_string(),
            ..Default::default()
        }
    }

    pub fn via_endpoint(destination: &str, vpc_endpoint_id: &str) -> Self {
        RouteInfo {
            destination: destination.to_string(),
            vpc_endpoint_id: vpc_endpoint_id.to_string(),
            ..Default::default()
        }
    }

    /// Routes with the same destination and the same target.
    pub fn same_target(&self, other: &RouteInfo) -> bool {
        self == other
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeAssociationType {
    #[serde(rename = "IGW")]
    InternetGateway,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTableInfo {
    pub route_table_id: String,
    #[serde(default)]
    pub routes: Vec<RouteInfo>,
    /// Set when the table serves a single subnet type.
    #[serde(default)]
    pub subnet_type: Option<SubnetType>,
    #[serde(default)]
    pub edge_association_type: Option<EdgeAssociationType>,
}

impl RouteTableInfo {
    pub fn new(route_table_id: &str, subnet_type: Option<SubnetType>) -> Self {
        RouteTableInfo {
            route_table_id: route_table_id.to_string(),
            subnet_type,
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct InternetGatewayInfo {
    pub internet_gateway_id: String,
    pub is_internet_gateway_attached: bool,
    /// Edge route table of firewall VPCs.
    pub route_table_id: String,
    pub route_table_association_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct NatGatewayInfo {
    pub nat_gateway_id: String,
    pub eip_id: String,
}

/// Per-AZ state. Routing fields stay empty until Update Networking runs.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailabilityZoneInfra {
    pub subnets: BTreeMap<SubnetType, Vec<SubnetInfo>>,
    #[serde(default)]
    pub private_route_table_id: String,
    /// Only used by firewall VPCs; standard VPCs share one public table.
    #[serde(default)]
    pub public_route_table_id: String,
    #[serde(default)]
    pub nat_gateway: NatGatewayInfo,
}

impl AvailabilityZoneInfra {
    /// Subnets of every type, in subnet type order.
    pub fn all_subnets(&self) -> impl Iterator<Item = (SubnetType, &SubnetInfo)> {
        self.subnets
            .iter()
            .flat_map(|(t, list)| list.iter().map(move |s| (*t, s)))
    }

    pub fn subnets_of(&self, subnet_type: SubnetType) -> &[SubnetInfo] {
        self.subnets
            .get(&subnet_type)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitGatewayAttachment {
    pub transit_gateway_id: String,
    pub transit_gateway_attachment_id: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverRuleAssociation {
    pub resolver_rule_id: String,
    pub resolver_rule_association_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityGroup {
    pub template_id: u64,
    pub security_group_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Firewall {
    #[serde(default)]
    pub associated_subnet_ids: Vec<String>,
}

/// The authoritative description of a VPC's network shape.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct VpcState {
    pub vpc_type: VpcType,
    #[serde(default)]
    pub public_route_table_id: String,
    #[serde(default)]
    pub route_tables: BTreeMap<String, RouteTableInfo>,
    #[serde(default)]
    pub internet_gateway: InternetGatewayInfo,
    #[serde(default)]
    pub availability_zones: BTreeMap<String, AvailabilityZoneInfra>,
    /// `None` until a networking update normalizes it.
    #[serde(default)]
    pub transit_gateway_attachments: Option<Vec<TransitGatewayAttachment>>,
    #[serde(default)]
    pub resolver_rule_associations: Vec<ResolverRuleAssociation>,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroup>,
    #[serde(default)]
    pub s3_flow_log_id: String,
    #[serde(default)]
    pub cloudwatch_logs_flow_log_id: String,
    #[serde(default)]
    pub resolver_query_log_configuration_id: String,
    #[serde(default)]
    pub resolver_query_log_association_id: String,
    #[serde(default)]
    pub firewall: Option<Firewall>,
    #[serde(default)]
    pub firewall_route_table_id: String,
}

impl VpcState {
    /// Record a freshly created route table.
    pub fn add_route_table(&mut self, info: RouteTableInfo) {
        self.route_tables.insert(info.route_table_id.clone(), info);
    }

    /// Current route for `destination` in `route_table_id`, if any.
    pub fn route(&self, route_table_id: &str, destination: &str) -> Option<&RouteInfo> {
        self.route_tables
            .get(route_table_id)?
            .routes
            .iter()
            .find(|r| r.destination == destination)
    }

    /// Insert or replace the route for `route.destination`.
    pub fn put_route(&mut self, route_table_id: &str, route: RouteInfo) {
        let table = self
            .route_tables
            .entry(route_table_id.to_string())
            .or_insert_with(|| RouteTableInfo::new(route_table_id, None));
        match table
            .routes
            .iter_mut()
            .find(|r| r.destination == route.destination)
        {
            Some(existing) => *existing = route,
            None => table.routes.push(route),
        }
    }

    pub fn associated_firewall_subnets(&self) -> &[String] {
        self.firewall
            .as_ref()
            .map(|f| f.associated_subnet_ids.as_slice())
            .unwrap_or(&[])
    }
}

/// A VPC as held by the models manager.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Vpc {
    pub id: String,
    pub account_id: String,
    pub region: String,
    pub name: String,
    pub stack: String,
    #[serde(default)]
    pub cidrs: Vec<Ipv4>,
    pub state: VpcState,
}

/// Letter suffix of an AZ name, `us-east-1c` -> `c`.
pub fn az_letter(az_name: &str) -> &str {
    match az_name.char_indices().last() {
        Some((i, _)) => &az_name[i..],
        None => az_name,
    }
}

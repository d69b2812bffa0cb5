//! Per-account access to the cloud networking and firewall services.
//!
//! Only the operations the handlers need are exposed. Every call that creates
//! something returns the new resource id, so a queued test implementation and
//! a real client satisfy the same contract.

use crate::error::Result;
use crate::models::{az_letter, CloudSubnet, Ipv4, RouteInfo};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn describe_subnets(&self, vpc_id: &str) -> Result<Vec<CloudSubnet>>;

    /// CIDR blocks of the VPCs on the other side of active peering connections.
    async fn describe_peering_cidrs(&self, vpc_id: &str) -> Result<Vec<Ipv4>>;

    async fn associate_vpc_cidr(&self, vpc_id: &str, cidr: &Ipv4) -> Result<()>;

    /// Returns the new subnet id.
    async fn create_subnet(
        &self,
        vpc_id: &str,
        az_name: &str,
        cidr: &Ipv4,
        name: &str,
        group_name: &str,
    ) -> Result<String>;

    async fn create_route_table(&self, vpc_id: &str, name: &str) -> Result<String>;

    async fn create_route(&self, route_table_id: &str, route: &RouteInfo) -> Result<()>;

    async fn replace_route(&self, route_table_id: &str, route: &RouteInfo) -> Result<()>;

    /// Returns the association id.
    async fn associate_route_table(&self, route_table_id: &str, subnet_id: &str)
        -> Result<String>;

    /// Associates a route table with a gateway (ingress routing).
    async fn associate_edge_route_table(
        &self,
        route_table_id: &str,
        gateway_id: &str,
    ) -> Result<String>;

    async fn allocate_eip(&self, name: &str) -> Result<String>;

    async fn create_nat_gateway(&self, name: &str, eip_id: &str, subnet_id: &str)
        -> Result<String>;

    async fn create_internet_gateway(&self, name: &str) -> Result<String>;

    async fn attach_internet_gateway(&self, internet_gateway_id: &str, vpc_id: &str)
        -> Result<()>;
}

#[async_trait]
pub trait FirewallApi: Send + Sync {
    async fn create_firewall(&self, vpc_id: &str, name: &str, subnet_ids: &[String])
        -> Result<()>;

    async fn associate_subnets(&self, vpc_id: &str, subnet_ids: &[String]) -> Result<()>;

    /// Firewall endpoint id per AZ name.
    async fn endpoint_ids_by_az(&self, vpc_id: &str) -> Result<BTreeMap<String, String>>;
}

/// Clients for one account in one region.
#[derive(Clone)]
pub struct CloudAccountAccess {
    pub account_id: String,
    pub region: String,
    pub network: Arc<dyn NetworkApi>,
    pub firewall: Arc<dyn FirewallApi>,
}

#[async_trait]
pub trait AccountAccessProvider: Send + Sync {
    async fn access_account(&self, account_id: &str, region: &str) -> Result<CloudAccountAccess>;
}

/// Resource names, derived from the VPC name and AZ letter.
pub mod names {
    use super::az_letter;
    use crate::models::SubnetType;

    /// `{vpc}-{group}-{az letter}`; the group defaults to the lower-case type.
    pub fn subnet(
        vpc_name: &str,
        az_name: &str,
        group_name: &str,
        subnet_type: SubnetType,
    ) -> String {
        let group = if group_name.is_empty() {
            subnet_type.as_str().to_lowercase()
        } else {
            group_name.to_string()
        };
        format!("{vpc_name}-{group}-{}", az_letter(az_name))
    }

    pub fn route_table(
        vpc_name: &str,
        az_name: &str,
        group_name: &str,
        subnet_type: SubnetType,
    ) -> String {
        subnet(vpc_name, az_name, group_name, subnet_type)
    }

    pub fn shared_public_route_table(vpc_name: &str) -> String {
        format!("{vpc_name}-public")
    }

    pub fn firewall_route_table(vpc_name: &str) -> String {
        format!("{vpc_name}-firewall")
    }

    pub fn internet_gateway_route_table(vpc_name: &str) -> String {
        format!("{vpc_name}-igw")
    }

    pub fn internet_gateway(vpc_name: &str) -> String {
        vpc_name.to_string()
    }

    pub fn nat_gateway(vpc_name: &str, az_name: &str) -> String {
        format!("{vpc_name}-{}", az_letter(az_name))
    }

    pub fn eip(vpc_name: &str, az_name: &str) -> String {
        format!("{vpc_name}-nat-gateway-{}", az_letter(az_name))
    }

    pub fn firewall(vpc_name: &str) -> String {
        format!("{vpc_name}-net-firewall")
    }
}

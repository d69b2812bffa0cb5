//! Wire routing, NAT and the firewall for a VPC's availability zones.
//!
//! Every step is gated on the field it fills being empty, and the snapshot is
//! saved after each mutation, so a rerun after a partial failure only does
//! the remaining work. A converged VPC produces no cloud calls and no writes.

use super::TaskContext;
use crate::cloud::names;
use crate::error::{Error, Result};
use crate::models::{
    EdgeAssociationType, Firewall, Ipv4, RouteInfo, RouteTableInfo, SubnetInfo, SubnetType,
    UpdateNetworkingTaskData, Vpc,
};
use std::collections::BTreeMap;

const DEFAULT_ROUTE: &str = "0.0.0.0/0";

struct NetworkingRun<'a, 'c> {
    ctx: &'a TaskContext<'c>,
    region: String,
    vpc: Vpc,
}

impl NetworkingRun<'_, '_> {
    async fn save(&self) -> Result<()> {
        self.ctx
            .models
            .update_state(&self.region, &self.vpc.id, &self.vpc.state)
            .await
    }

    fn log(&self, message: String) {
        self.ctx.task.log(message);
    }

    async fn create_route_table(
        &mut self,
        name: &str,
        subnet_type: Option<SubnetType>,
        edge_association_type: Option<EdgeAssociationType>,
    ) -> Result<String> {
        let id = self
            .ctx
            .access
            .network
            .create_route_table(&self.vpc.id, name)
            .await?;
        self.vpc.state.add_route_table(RouteTableInfo {
            route_table_id: id.clone(),
            routes: Vec::new(),
            subnet_type,
            edge_association_type,
        });
        self.log(format!("Created route table {name} ({id})"));
        Ok(id)
    }

    /// Create, replace or keep the route for `desired.destination`.
    async fn set_route(&mut self, route_table_id: &str, desired: RouteInfo) -> Result<()> {
        if !self.vpc.state.route_tables.contains_key(route_table_id) {
            return Err(Error::InconsistentInventory(format!(
                "no route table info for {route_table_id}"
            )));
        }
        let network = &self.ctx.access.network;
        match self.vpc.state.route(route_table_id, &desired.destination) {
            Some(current) if current.same_target(&desired) => return Ok(()),
            Some(_) => {
                network.replace_route(route_table_id, &desired).await?;
                self.log(format!(
                    "Updated route {} on {route_table_id}",
                    desired.destination
                ));
            }
            None => {
                network.create_route(route_table_id, &desired).await?;
                self.log(format!(
                    "Added route {} on {route_table_id}",
                    desired.destination
                ));
            }
        }
        self.vpc.state.put_route(route_table_id, desired);
        self.save().await
    }

    /// Route `destination` through `desired` on the AZ's private table and
    /// every custom table of the AZ.
    async fn set_route_all_non_public(&mut self, az_name: &str, desired: RouteInfo) -> Result<()> {
        let az = &self.vpc.state.availability_zones[az_name];
        let mut tables = vec![az.private_route_table_id.clone()];
        for (_, subnet) in az.all_subnets() {
            if !subnet.custom_route_table_id.is_empty()
                && !tables.contains(&subnet.custom_route_table_id)
            {
                tables.push(subnet.custom_route_table_id.clone());
            }
        }
        for table in tables {
            self.set_route(&table, desired.clone()).await?;
        }
        Ok(())
    }

    fn az_names(&self) -> Vec<String> {
        self.vpc.state.availability_zones.keys().cloned().collect()
    }

    fn subnet_ids(&self, az_name: &str, subnet_type: SubnetType) -> Vec<String> {
        self.vpc.state.availability_zones[az_name]
            .subnets_of(subnet_type)
            .iter()
            .map(|s| s.subnet_id.clone())
            .collect()
    }

    /// Associate every subnet of `subnet_type` in the AZ that has no association.
    ///
    /// `route_table_for` picks the table for a subnet from its record.
    async fn associate_subnets(
        &mut self,
        az_name: &str,
        subnet_type: SubnetType,
        route_table_for: impl Fn(&SubnetInfo) -> String,
    ) -> Result<()> {
        let pending: Vec<(usize, String, String)> = self.vpc.state.availability_zones[az_name]
            .subnets_of(subnet_type)
            .iter()
            .enumerate()
            .filter(|(_, s)| s.route_table_association_id.is_empty())
            .map(|(i, s)| (i, s.subnet_id.clone(), route_table_for(s)))
            .collect();
        for (i, subnet_id, route_table_id) in pending {
            if route_table_id.is_empty() {
                return Err(Error::InconsistentInventory(format!(
                    "no route table for subnet {subnet_id}"
                )));
            }
            let association_id = self
                .ctx
                .access
                .network
                .associate_route_table(&route_table_id, &subnet_id)
                .await?;
            if let Some(subnet) = self
                .vpc
                .state
                .availability_zones
                .get_mut(az_name)
                .and_then(|az| az.subnets.get_mut(&subnet_type))
                .and_then(|list| list.get_mut(i))
            {
                subnet.route_table_association_id = association_id;
            }
            self.log(format!("Associated {subnet_id} with {route_table_id}"));
            self.save().await?;
        }
        Ok(())
    }

    async fn ensure_firewall(&mut self) -> Result<()> {
        let firewall_subnets: Vec<String> = self
            .az_names()
            .iter()
            .flat_map(|az| self.subnet_ids(az, SubnetType::Firewall))
            .collect();
        let firewall_api = &self.ctx.access.firewall;
        match &self.vpc.state.firewall {
            None => {
                let name = names::firewall(&self.vpc.name);
                firewall_api
                    .create_firewall(&self.vpc.id, &name, &firewall_subnets)
                    .await?;
                self.log(format!(
                    "Created firewall with {} subnet(s)",
                    firewall_subnets.len()
                ));
                self.vpc.state.firewall = Some(Firewall {
                    associated_subnet_ids: firewall_subnets,
                });
                self.save().await?;
            }
            Some(firewall) => {
                let missing: Vec<String> = firewall_subnets
                    .into_iter()
                    .filter(|id| !firewall.associated_subnet_ids.contains(id))
                    .collect();
                if missing.is_empty() {
                    return Ok(());
                }
                firewall_api.associate_subnets(&self.vpc.id, &missing).await?;
                self.log(format!(
                    "Associated subnet(s) [{}] with the firewall",
                    missing.join(", ")
                ));
                if let Some(firewall) = self.vpc.state.firewall.as_mut() {
                    firewall.associated_subnet_ids.extend(missing);
                }
                self.save().await?;
            }
        }
        Ok(())
    }

    async fn ensure_public_route_tables(&mut self) -> Result<()> {
        if self.vpc.state.vpc_type.has_firewall() {
            for az_name in self.az_names() {
                if self.vpc.state.availability_zones[&az_name]
                    .public_route_table_id
                    .is_empty()
                {
                    let name = names::route_table(&self.vpc.name, &az_name, "", SubnetType::Public);
                    let id = self
                        .create_route_table(&name, Some(SubnetType::Public), None)
                        .await?;
                    if let Some(az) = self.vpc.state.availability_zones.get_mut(&az_name) {
                        az.public_route_table_id = id;
                    }
                    self.save().await?;
                }
            }
        } else if self.vpc.state.public_route_table_id.is_empty() {
            let name = names::shared_public_route_table(&self.vpc.name);
            let id = self
                .create_route_table(&name, Some(SubnetType::Public), None)
                .await?;
            self.vpc.state.public_route_table_id = id;
            self.save().await?;
        }
        Ok(())
    }

    async fn ensure_firewall_route_table(&mut self) -> Result<()> {
        if self.vpc.state.firewall_route_table_id.is_empty() {
            let name = names::firewall_route_table(&self.vpc.name);
            let id = self
                .create_route_table(&name, Some(SubnetType::Firewall), None)
                .await?;
            self.vpc.state.firewall_route_table_id = id;
            self.save().await?;
        }
        Ok(())
    }

    async fn ensure_internet_gateway(&mut self) -> Result<()> {
        let network = &self.ctx.access.network;
        if self.vpc.state.internet_gateway.internet_gateway_id.is_empty() {
            let id = network
                .create_internet_gateway(&names::internet_gateway(&self.vpc.name))
                .await?;
            self.log(format!("Created internet gateway {id}"));
            self.vpc.state.internet_gateway.internet_gateway_id = id;
            self.save().await?;
        }
        if !self.vpc.state.internet_gateway.is_internet_gateway_attached {
            let id = self.vpc.state.internet_gateway.internet_gateway_id.clone();
            network.attach_internet_gateway(&id, &self.vpc.id).await?;
            self.log(format!("Attached internet gateway {id}"));
            self.vpc.state.internet_gateway.is_internet_gateway_attached = true;
            self.save().await?;
        }
        Ok(())
    }

    /// Firewall VPCs: traffic from the internet gateway goes through the
    /// firewall endpoint of the destination subnet's AZ, and public subnets
    /// leave through their AZ's endpoint.
    async fn route_public_through_firewall(&mut self) -> Result<()> {
        if self.vpc.state.internet_gateway.route_table_id.is_empty() {
            let name = names::internet_gateway_route_table(&self.vpc.name);
            let id = self
                .create_route_table(&name, None, Some(EdgeAssociationType::InternetGateway))
                .await?;
            self.vpc.state.internet_gateway.route_table_id = id;
            self.save().await?;
        }

        let igw_id = self.vpc.state.internet_gateway.internet_gateway_id.clone();
        let firewall_rt = self.vpc.state.firewall_route_table_id.clone();
        self.set_route(&firewall_rt, RouteInfo::via_internet_gateway(DEFAULT_ROUTE, &igw_id))
            .await?;

        let endpoints = self
            .ctx
            .access
            .firewall
            .endpoint_ids_by_az(&self.vpc.id)
            .await?;
        let cidrs: BTreeMap<String, Ipv4> = self
            .ctx
            .access
            .network
            .describe_subnets(&self.vpc.id)
            .await?
            .into_iter()
            .map(|s| (s.subnet_id, s.cidr))
            .collect();
        let edge_rt = self.vpc.state.internet_gateway.route_table_id.clone();
        for az_name in self.az_names() {
            let endpoint = endpoints.get(&az_name).ok_or_else(|| {
                Error::InconsistentInventory(format!("no firewall endpoint in {az_name}"))
            })?;
            let public_rt = self.vpc.state.availability_zones[&az_name]
                .public_route_table_id
                .clone();
            self.set_route(&public_rt, RouteInfo::via_endpoint(DEFAULT_ROUTE, endpoint))
                .await?;
            for subnet_id in self.subnet_ids(&az_name, SubnetType::Public) {
                let cidr = cidrs.get(&subnet_id).ok_or_else(|| {
                    Error::InconsistentInventory(format!("subnet {subnet_id} is not in the cloud"))
                })?;
                self.set_route(&edge_rt, RouteInfo::via_endpoint(&cidr.to_string(), endpoint))
                    .await?;
            }
        }

        if self.vpc.state.internet_gateway.route_table_association_id.is_empty() {
            let association_id = self
                .ctx
                .access
                .network
                .associate_edge_route_table(&edge_rt, &igw_id)
                .await?;
            self.log(format!("Associated {edge_rt} with internet gateway {igw_id}"));
            self.vpc.state.internet_gateway.route_table_association_id = association_id;
            self.save().await?;
        }
        Ok(())
    }

    async fn connect_public(&mut self) -> Result<()> {
        self.ensure_internet_gateway().await?;
        if self.vpc.state.vpc_type.has_firewall() {
            self.route_public_through_firewall().await?;
        } else {
            let public_rt = self.vpc.state.public_route_table_id.clone();
            let igw_id = self.vpc.state.internet_gateway.internet_gateway_id.clone();
            self.set_route(&public_rt, RouteInfo::via_internet_gateway(DEFAULT_ROUTE, &igw_id))
                .await?;
        }

        let shared_rt = self.vpc.state.public_route_table_id.clone();
        let per_az = self.vpc.state.vpc_type.has_firewall();
        for az_name in self.az_names() {
            let rt = if per_az {
                self.vpc.state.availability_zones[&az_name]
                    .public_route_table_id
                    .clone()
            } else {
                shared_rt.clone()
            };
            self.associate_subnets(&az_name, SubnetType::Public, |_| rt.clone())
                .await?;
        }
        Ok(())
    }

    async fn connect_private(&mut self, az_name: &str) -> Result<()> {
        if self.vpc.state.availability_zones[az_name]
            .private_route_table_id
            .is_empty()
        {
            let name = names::route_table(&self.vpc.name, az_name, "", SubnetType::Private);
            let id = self
                .create_route_table(&name, Some(SubnetType::Private), None)
                .await?;
            if let Some(az) = self.vpc.state.availability_zones.get_mut(az_name) {
                az.private_route_table_id = id;
            }
            self.save().await?;
        }

        let custom: Vec<(SubnetType, usize, String)> = self.vpc.state.availability_zones[az_name]
            .subnets
            .iter()
            .filter(|(t, _)| !t.is_default_type())
            .flat_map(|(t, list)| {
                list.iter()
                    .enumerate()
                    .filter(|(_, s)| s.custom_route_table_id.is_empty())
                    .map(move |(i, s)| (*t, i, s.group_name.clone()))
            })
            .collect();
        for (subnet_type, i, group_name) in custom {
            let name = names::route_table(&self.vpc.name, az_name, &group_name, subnet_type);
            let id = self
                .create_route_table(&name, Some(subnet_type), None)
                .await?;
            if let Some(subnet) = self
                .vpc
                .state
                .availability_zones
                .get_mut(az_name)
                .and_then(|az| az.subnets.get_mut(&subnet_type))
                .and_then(|list| list.get_mut(i))
            {
                subnet.custom_route_table_id = id;
            }
            self.save().await?;
        }

        let network = &self.ctx.access.network;
        if self.vpc.state.availability_zones[az_name].nat_gateway.eip_id.is_empty() {
            let eip_id = network
                .allocate_eip(&names::eip(&self.vpc.name, az_name))
                .await?;
            self.log(format!("Allocated EIP {eip_id} in {az_name}"));
            if let Some(az) = self.vpc.state.availability_zones.get_mut(az_name) {
                az.nat_gateway.eip_id = eip_id;
            }
            self.save().await?;
        }
        if self.vpc.state.availability_zones[az_name]
            .nat_gateway
            .nat_gateway_id
            .is_empty()
        {
            let az = &self.vpc.state.availability_zones[az_name];
            let public_subnet = az
                .subnets_of(SubnetType::Public)
                .first()
                .map(|s| s.subnet_id.clone())
                .ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "{az_name} has no public subnet for a NAT gateway"
                    ))
                })?;
            let eip_id = az.nat_gateway.eip_id.clone();
            let name = names::nat_gateway(&self.vpc.name, az_name);
            let nat_id = network
                .create_nat_gateway(&name, &eip_id, &public_subnet)
                .await?;
            self.log(format!("Created NAT gateway {nat_id} in {az_name}"));
            if let Some(az) = self.vpc.state.availability_zones.get_mut(az_name) {
                az.nat_gateway.nat_gateway_id = nat_id;
            }
            self.save().await?;
        }

        let nat_id = self.vpc.state.availability_zones[az_name]
            .nat_gateway
            .nat_gateway_id
            .clone();
        self.set_route_all_non_public(az_name, RouteInfo::via_nat(DEFAULT_ROUTE, &nat_id))
            .await?;

        let private_rt = self.vpc.state.availability_zones[az_name]
            .private_route_table_id
            .clone();
        self.associate_subnets(az_name, SubnetType::Private, |_| private_rt.clone())
            .await?;
        let custom_types: Vec<SubnetType> = self.vpc.state.availability_zones[az_name]
            .subnets
            .keys()
            .filter(|t| !t.is_default_type())
            .copied()
            .collect();
        for subnet_type in custom_types {
            self.associate_subnets(az_name, subnet_type, |s| s.custom_route_table_id.clone())
                .await?;
        }
        Ok(())
    }
}

/// Bring the VPC's routing in line with `data.networking_config`.
pub async fn update_networking(
    ctx: &TaskContext<'_>,
    vpc: Vpc,
    data: &UpdateNetworkingTaskData,
) -> Result<()> {
    if !vpc.state.vpc_type.is_managed() {
        return Err(Error::Unsupported(format!(
            "networking updates for {:?} VPCs",
            vpc.state.vpc_type
        )));
    }
    let config = data.networking_config;
    let has_firewall = vpc.state.vpc_type.has_firewall();
    let mut run = NetworkingRun {
        ctx,
        region: data.region.clone(),
        vpc,
    };

    if run.vpc.state.transit_gateway_attachments.is_none() {
        run.vpc.state.transit_gateway_attachments = Some(Vec::new());
        run.save().await?;
    }

    if has_firewall {
        run.ensure_firewall().await?;
        run.ensure_firewall_route_table().await?;
    }

    if config.connect_public {
        ctx.stop.check("public routing")?;
        run.ensure_public_route_tables().await?;
        run.connect_public().await?;
    }

    if has_firewall {
        let firewall_rt = run.vpc.state.firewall_route_table_id.clone();
        for az_name in run.az_names() {
            run.associate_subnets(&az_name, SubnetType::Firewall, |_| firewall_rt.clone())
                .await?;
        }
    }

    if config.connect_private {
        for az_name in run.az_names() {
            ctx.stop.check(&format!("private routing in {az_name}"))?;
            run.connect_private(&az_name).await?;
        }
    }

    run.log("Networking is up to date".to_string());
    Ok(())
}

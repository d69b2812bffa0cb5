//! Add an availability zone to a VPC.
//!
//! The new AZ receives one subnet per existing subnet group, with the same
//! prefix length the group has everywhere else. Routing is left empty for a
//! later networking update. Nothing is rolled back on failure. The tree is
//! saved to IPAM after every cloud mutation, so a retry picks up the VPC
//! CIDRs and subnets an earlier attempt already made instead of repeating them.
//!
//! Unroutable groups are not tracked in IPAM. They are carved from the VPC's
//! own CIDRs inside `100.64.0.0/10`, and a new `/16` from that range is
//! associated when those are full.

use super::TaskContext;
use crate::cloud::names;
use crate::error::{Error, Result};
use crate::ipam::naming::{environment_root, subnet_container_name, vpc_container};
use crate::ipam::tree::{is_within, join_path, parent_path};
use crate::ipam::{BlockStatus, BlockType, ContainerTree};
use crate::lock::LockTarget;
use crate::models::{
    prefix_for_addresses, AddAvailabilityZoneTaskData, AvailabilityZoneInfra, CloudSubnet, Ipv4,
    SubnetInfo, SubnetType, Vpc, VpcState, MAX_LENGTH,
};
use itertools::Itertools;
use regex::Regex;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::OnceLock;

/// Smallest and largest VPC aggregate that may be added for new space.
const AGGREGATE_PREFIX_RANGE: (u8, u8) = (16, 28);

/// Shared address space that unroutable subnets come from.
const UNROUTABLE_NETWORK: Ipv4 = Ipv4 {
    addr: Ipv4Addr::new(100, 64, 0, 0),
    mask: 10,
};

/// Second octets of the `/16`s a VPC may add for unroutable subnets.
const UNROUTABLE_OCTETS: RangeInclusive<u8> = 64..=127;

/// Regex for availability zone names such as `us-gov-west-1a`.
static AZ_NAME_REGEX: OnceLock<Regex> = OnceLock::new();

fn get_az_name_regex() -> &'static Regex {
    AZ_NAME_REGEX
        .get_or_init(|| Regex::new(r"^[a-z]{2}(-gov)?-[a-z]+-\d[a-z]$").expect("Invalid Regex"))
}

/// A subnet group and the prefix length it has in every existing AZ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupShape {
    pub prefix_length: u8,
    /// A subnet of this group in an existing AZ.
    pub source_subnet_id: String,
}

pub type Shape = BTreeMap<(SubnetType, String), GroupShape>;

/// Record each group's prefix length across existing AZs.
///
/// Fails with `ShapeMismatch` when two AZs disagree, and with
/// `InconsistentInventory` when a recorded subnet is unknown to the cloud.
pub fn derive_shape(state: &VpcState, cloud_subnets: &[CloudSubnet]) -> Result<Shape> {
    let mut shape = Shape::new();
    for (az_name, az) in &state.availability_zones {
        for (subnet_type, subnet) in az.all_subnets() {
            let cloud = cloud_subnets
                .iter()
                .find(|c| c.subnet_id == subnet.subnet_id)
                .ok_or_else(|| {
                    Error::InconsistentInventory(format!(
                        "subnet {} in {az_name} is not in the cloud",
                        subnet.subnet_id
                    ))
                })?;
            let key = (subnet_type, subnet.group_name.clone());
            match shape.get(&key) {
                Some(existing) if existing.prefix_length != cloud.cidr.mask => {
                    return Err(Error::ShapeMismatch {
                        group: subnet.group_name.clone(),
                        first: existing.prefix_length,
                        second: cloud.cidr.mask,
                    });
                }
                Some(_) => {}
                None => {
                    shape.insert(
                        key,
                        GroupShape {
                            prefix_length: cloud.cidr.mask,
                            source_subnet_id: subnet.subnet_id.clone(),
                        },
                    );
                }
            }
        }
    }
    Ok(shape)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubnet {
    pub subnet_type: SubnetType,
    pub group_name: String,
    pub prefix_length: u8,
}

/// Subnets to carve from one container, in allocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPlan {
    pub container: String,
    pub subnets: Vec<PlannedSubnet>,
}

/// Route every group to its container and order the work.
///
/// A group lands where its existing subnets live when that is inside the
/// VPC's container for the group's environment root; otherwise directly in
/// that VPC container. Containers are processed by path, and within one
/// container the smallest subnets go first.
pub fn plan_allocations(
    tree: &ContainerTree,
    vpc: &Vpc,
    shape: &Shape,
) -> Result<Vec<ContainerPlan>> {
    let mut by_container: BTreeMap<String, Vec<PlannedSubnet>> = BTreeMap::new();
    for ((subnet_type, group_name), group) in shape {
        let root = environment_root(&vpc.region, &vpc.stack, *subnet_type)?;
        let vpc_path = vpc_container(&root, &vpc.account_id, &vpc.name);
        let container = tree
            .container_for_resource(&group.source_subnet_id)
            .and_then(|c| parent_path(&c.name))
            .filter(|p| is_within(p, &vpc_path))
            .map(str::to_string)
            .unwrap_or(vpc_path);
        by_container
            .entry(container)
            .or_default()
            .push(PlannedSubnet {
                subnet_type: *subnet_type,
                group_name: group_name.clone(),
                prefix_length: group.prefix_length,
            });
    }
    Ok(by_container
        .into_iter()
        .map(|(container, subnets)| ContainerPlan {
            container,
            subnets: subnets
                .into_iter()
                .sorted_by(|a, b| {
                    b.prefix_length
                        .cmp(&a.prefix_length)
                        .then(a.subnet_type.cmp(&b.subnet_type))
                        .then(a.group_name.cmp(&b.group_name))
                })
                .collect(),
        })
        .collect())
}

fn validate(vpc: &Vpc, data: &AddAvailabilityZoneTaskData) -> Result<()> {
    let az = &data.az_name;
    if !get_az_name_regex().is_match(az)
        || az.len() != vpc.region.len() + 1
        || !az.starts_with(&vpc.region)
    {
        return Err(Error::InvalidRequest(format!(
            "{az} is not an availability zone of {}",
            vpc.region
        )));
    }
    if !vpc.state.vpc_type.can_add_zones() {
        return Err(Error::InvalidRequest(format!(
            "VPC type {:?} does not allow adding availability zones",
            vpc.state.vpc_type
        )));
    }
    if vpc.name.is_empty() || vpc.stack.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "VPC {} needs a name and a stack",
            vpc.id
        )));
    }
    if vpc.state.availability_zones.contains_key(az) {
        return Err(Error::InvalidRequest(format!("{az} already exists in {}", vpc.id)));
    }
    if vpc.state.availability_zones.is_empty() {
        return Err(Error::InvalidRequest(format!(
            "VPC {} has no availability zone to copy",
            vpc.id
        )));
    }
    Ok(())
}

/// Lowest aligned `/prefix` inside `within` that overlaps none of `used`.
pub fn first_free_block(within: &Ipv4, prefix: u8, used: &[Ipv4]) -> Option<Ipv4> {
    if prefix < within.mask || prefix > MAX_LENGTH {
        return None;
    }
    let start = u32::from(within.lo()) as u64;
    let step = 1u64 << (MAX_LENGTH - prefix);
    (0..within.size() / step)
        .map(|k| Ipv4 {
            addr: Ipv4Addr::from((start + k * step) as u32),
            mask: prefix,
        })
        .find(|candidate| !used.iter().any(|u| u.overlaps(candidate)))
}

/// Lowest unroutable `/16` that overlaps none of `in_use`.
pub fn next_unroutable_cidr(in_use: &[Ipv4]) -> Option<Ipv4> {
    UNROUTABLE_OCTETS
        .map(|octet| Ipv4 {
            addr: Ipv4Addr::new(100, octet, 0, 0),
            mask: 16,
        })
        .find(|candidate| !in_use.iter().any(|c| c.overlaps(candidate)))
}

fn vpc_subnet_ids(state: &VpcState) -> impl Iterator<Item = &str> {
    state
        .availability_zones
        .values()
        .flat_map(|az| az.all_subnets().map(|(_, s)| s.subnet_id.as_str()))
}

/// A subnet container made by an earlier attempt at this AZ.
///
/// Returns the subnet id when the container points at a subnet the cloud has
/// in `az_name`, `None` when there is no such container yet.
fn earlier_subnet(
    tree: &ContainerTree,
    path: &str,
    az_name: &str,
    cloud_subnets: &[CloudSubnet],
) -> Result<Option<String>> {
    let Some(container) = tree.get(path) else {
        return Ok(None);
    };
    match &container.resource_id {
        Some(id)
            if cloud_subnets
                .iter()
                .any(|c| &c.subnet_id == id && c.availability_zone == az_name) =>
        {
            Ok(Some(id.clone()))
        }
        _ => Err(Error::InconsistentInventory(format!(
            "container {path} already exists"
        ))),
    }
}

/// Running state of one expansion.
struct Expansion<'a, 'c> {
    ctx: &'a TaskContext<'c>,
    region: String,
    az_name: String,
    vpc: Vpc,
    cloud_subnets: Vec<CloudSubnet>,
    new_az: AvailabilityZoneInfra,
}

impl Expansion<'_, '_> {
    fn record(&mut self, subnet_type: SubnetType, subnet_id: &str, group_name: &str) {
        self.new_az
            .subnets
            .entry(subnet_type)
            .or_default()
            .push(SubnetInfo::new(subnet_id, group_name));
    }

    fn claimed(&self, subnet_id: &str) -> bool {
        vpc_subnet_ids(&self.vpc.state).any(|id| id == subnet_id)
            || self
                .new_az
                .all_subnets()
                .any(|(_, s)| s.subnet_id == subnet_id)
    }

    async fn save_tree(&self, tree: &ContainerTree) -> Result<()> {
        tree.verify_tiling()?;
        self.ctx.ipam.save_tree(tree).await
    }

    /// Associate `cidr` with the VPC unless an earlier attempt already did.
    async fn add_vpc_cidr(&mut self, cidr: Ipv4) -> Result<()> {
        if self.vpc.cidrs.contains(&cidr) {
            self.ctx
                .task
                .log(format!("VPC CIDR {cidr} is already associated"));
            return Ok(());
        }
        self.ctx
            .access
            .network
            .associate_vpc_cidr(&self.vpc.id, &cidr)
            .await?;
        self.ctx
            .models
            .insert_vpc_cidr(&self.region, &self.vpc.id, &cidr)
            .await?;
        self.vpc.cidrs.push(cidr);
        self.ctx.task.log(format!("Associated new VPC CIDR {cidr}"));
        Ok(())
    }

    /// Create a subnet, or adopt the one an earlier attempt made at `cidr`.
    async fn create_subnet(&mut self, subnet: &PlannedSubnet, cidr: &Ipv4) -> Result<String> {
        let az_name = self.az_name.as_str();
        let adopted = self
            .cloud_subnets
            .iter()
            .find(|c| c.availability_zone == az_name && c.cidr == *cidr)
            .map(|c| c.subnet_id.clone())
            .filter(|id| !self.claimed(id));
        if let Some(subnet_id) = adopted {
            self.ctx
                .task
                .log(format!("Reusing subnet {subnet_id} with {cidr}"));
            return Ok(subnet_id);
        }

        let name = names::subnet(&self.vpc.name, az_name, &subnet.group_name, subnet.subnet_type);
        let subnet_id = self
            .ctx
            .access
            .network
            .create_subnet(&self.vpc.id, az_name, cidr, &name, &subnet.group_name)
            .await?;
        self.ctx
            .task
            .log(format!("Created subnet {name} ({subnet_id}) with {cidr}"));
        self.cloud_subnets.push(CloudSubnet {
            subnet_id: subnet_id.clone(),
            availability_zone: self.az_name.clone(),
            cidr: *cidr,
        });
        Ok(subnet_id)
    }

    async fn allocate_in(&mut self, tree: &mut ContainerTree, plan: &ContainerPlan) -> Result<()> {
        let task = self.ctx.task;
        tree.ensure_container(&plan.container)?;

        let mut pending = Vec::new();
        for subnet in &plan.subnets {
            let name = subnet_container_name(&subnet.group_name, &self.az_name);
            let path = join_path(&plan.container, &name);
            match earlier_subnet(tree, &path, &self.az_name, &self.cloud_subnets)? {
                Some(subnet_id) => {
                    task.log(format!("Subnet {subnet_id} for {path} is already in place"));
                    self.record(subnet.subnet_type, &subnet_id, &subnet.group_name);
                }
                None => pending.push(subnet),
            }
        }

        for (i, subnet) in pending.iter().enumerate() {
            self.ctx.stop.check(&format!("group {}", subnet.group_name))?;
            if !tree.has_free_space(&plan.container, subnet.prefix_length) {
                task.log(format!(
                    "No free /{} in {}, adding a VPC CIDR",
                    subnet.prefix_length, plan.container
                ));
                let needed: u64 = pending[i..]
                    .iter()
                    .map(|s| 1u64 << (MAX_LENGTH - s.prefix_length))
                    .sum();
                let (min, max) = AGGREGATE_PREFIX_RANGE;
                let size = prefix_for_addresses(needed, min, max).ok_or_else(|| {
                    Error::NoSpaceAvailable {
                        prefix: min,
                        searched: format!("{needed} addresses exceed a /{min}"),
                    }
                })?;
                let parent = parent_path(&plan.container).ok_or_else(|| {
                    Error::InconsistentInventory(format!("{} has no parent", plan.container))
                })?;
                let cidr = tree.allocate_block(
                    parent,
                    &plan.container,
                    size,
                    BlockType::Vpc,
                    BlockStatus::Aggregate,
                )?;
                self.add_vpc_cidr(cidr).await?;
                self.save_tree(tree).await?;
            }

            let container_name = subnet_container_name(&subnet.group_name, &self.az_name);
            let path = tree.add_container(&plan.container, &container_name)?;
            let cidr = tree.allocate_block(
                &plan.container,
                &path,
                subnet.prefix_length,
                BlockType::Subnet,
                BlockStatus::Deployed,
            )?;
            let subnet_id = self.create_subnet(subnet, &cidr).await?;
            tree.set_resource_id(&path, &subnet_id)?;
            self.save_tree(tree).await?;
            self.record(subnet.subnet_type, &subnet_id, &subnet.group_name);
        }
        Ok(())
    }

    /// Place an unroutable group in the VPC's `100.64.0.0/10` space.
    async fn add_unroutable(&mut self, subnet: &PlannedSubnet) -> Result<()> {
        self.ctx.stop.check(&format!("group {}", subnet.group_name))?;
        let prefix = subnet.prefix_length;
        let earlier = self
            .cloud_subnets
            .iter()
            .filter(|c| c.availability_zone == self.az_name && c.cidr.mask == prefix)
            .filter(|c| {
                self.vpc
                    .cidrs
                    .iter()
                    .any(|v| UNROUTABLE_NETWORK.contains(v) && v.contains(&c.cidr))
            })
            .map(|c| c.subnet_id.clone())
            .find(|id| !self.claimed(id));
        if let Some(subnet_id) = earlier {
            self.ctx
                .task
                .log(format!("Subnet {subnet_id} for {} is already in place", subnet.group_name));
            self.record(subnet.subnet_type, &subnet_id, &subnet.group_name);
            return Ok(());
        }

        let used: Vec<Ipv4> = self.cloud_subnets.iter().map(|c| c.cidr).collect();
        let mut cidr = self
            .vpc
            .cidrs
            .iter()
            .filter(|v| UNROUTABLE_NETWORK.contains(v))
            .find_map(|v| first_free_block(v, prefix, &used));
        if cidr.is_none() {
            let peers = self
                .ctx
                .access
                .network
                .describe_peering_cidrs(&self.vpc.id)
                .await?;
            let in_use: Vec<Ipv4> = self.vpc.cidrs.iter().chain(&peers).copied().collect();
            let block = next_unroutable_cidr(&in_use).ok_or_else(|| Error::NoSpaceAvailable {
                prefix: 16,
                searched: UNROUTABLE_NETWORK.to_string(),
            })?;
            self.add_vpc_cidr(block).await?;
            cidr = first_free_block(&block, prefix, &used);
        }
        let cidr = cidr.ok_or_else(|| Error::NoSpaceAvailable {
            prefix,
            searched: format!("unroutable CIDRs of {}", self.vpc.id),
        })?;
        let subnet_id = self.create_subnet(subnet, &cidr).await?;
        self.record(subnet.subnet_type, &subnet_id, &subnet.group_name);
        Ok(())
    }
}

/// Add `data.az_name` to the VPC.
pub async fn add_availability_zone(
    ctx: &TaskContext<'_>,
    vpc: Vpc,
    data: &AddAvailabilityZoneTaskData,
) -> Result<()> {
    let task = ctx.task;
    let az_name = data.az_name.as_str();
    validate(&vpc, data)?;
    if !ctx.lock_set.has_lock(&LockTarget::IpamWrite) {
        return Err(Error::InvalidRequest(
            "IPAM writer lock is not held".to_string(),
        ));
    }

    let cloud_subnets = ctx.access.network.describe_subnets(&vpc.id).await?;
    let mut shape = derive_shape(&vpc.state, &cloud_subnets)?;
    for ((_, group), g) in &shape {
        if g.prefix_length < ctx.config.min_subnet_prefix
            || g.prefix_length > ctx.config.max_subnet_prefix
        {
            return Err(Error::InvalidRequest(format!(
                "invalid subnet size /{} for {group}",
                g.prefix_length
            )));
        }
    }
    task.log(format!(
        "Replicating {} subnet group(s) into {az_name}",
        shape.len()
    ));

    let unroutable: Vec<PlannedSubnet> = shape
        .iter()
        .filter(|((t, _), _)| *t == SubnetType::Unroutable)
        .map(|((t, group_name), g)| PlannedSubnet {
            subnet_type: *t,
            group_name: group_name.clone(),
            prefix_length: g.prefix_length,
        })
        .collect();
    shape.retain(|(t, _), _| *t != SubnetType::Unroutable);

    let mut run = Expansion {
        ctx,
        region: data.region.clone(),
        az_name: az_name.to_string(),
        vpc,
        cloud_subnets,
        new_az: AvailabilityZoneInfra::default(),
    };
    let mut tree = ctx.ipam.load_tree().await?;
    let plans = plan_allocations(&tree, &run.vpc, &shape)?;
    for plan in &plans {
        for subnet in &plan.subnets {
            let path = join_path(
                &plan.container,
                &subnet_container_name(&subnet.group_name, az_name),
            );
            earlier_subnet(&tree, &path, az_name, &run.cloud_subnets)?;
        }
    }
    for plan in &plans {
        run.allocate_in(&mut tree, plan).await?;
    }
    for subnet in &unroutable {
        run.add_unroutable(subnet).await?;
    }

    let Expansion { mut vpc, new_az, .. } = run;
    vpc.state
        .availability_zones
        .insert(az_name.to_string(), new_az);
    ctx.models
        .update_state(&data.region, &vpc.id, &vpc.state)
        .await?;
    task.log(format!("Added availability zone {az_name}"));
    Ok(())
}

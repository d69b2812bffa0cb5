//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use vpc_topology::config::Config;
use vpc_topology::ipam::naming::{environment_root, vpc_container};
use vpc_topology::ipam::{BlockStatus, BlockType, ContainerTree};
use vpc_topology::lock::InMemoryLockManager;
use vpc_topology::models::{
    AvailabilityZoneInfra, Firewall, Ipv4, SubnetInfo, SubnetType, Vpc, VpcState, VpcType,
};
use vpc_topology::tasks::TaskEnvironment;
use vpc_topology::testmocks::{
    MockAccountAccessProvider, MockFirewall, MockModelsManager, MockNetwork, RecordingIpamClient,
};

pub const REGION: &str = "us-east-1";
pub const ACCOUNT: &str = "123456789012";
pub const VPC_ID: &str = "vpc-0abc";
pub const VPC_NAME: &str = "alpha";

/// A subnet that already exists in AZ `az` (letter only).
pub struct Existing {
    pub az: &'static str,
    pub subnet_type: SubnetType,
    pub group: &'static str,
    pub id: &'static str,
    pub prefix: u8,
}

pub fn existing(
    az: &'static str,
    subnet_type: SubnetType,
    group: &'static str,
    id: &'static str,
    prefix: u8,
) -> Existing {
    Existing {
        az,
        subnet_type,
        group,
        id,
        prefix,
    }
}

pub fn az_name(letter: &str) -> String {
    format!("{REGION}{letter}")
}

pub fn std_vpc_container() -> String {
    let root = environment_root(REGION, "dev", SubnetType::Private).unwrap();
    vpc_container(&root, ACCOUNT, VPC_NAME)
}

pub struct World {
    pub network: Arc<MockNetwork>,
    pub firewall: Arc<MockFirewall>,
    pub models: Arc<MockModelsManager>,
    pub ipam: Arc<RecordingIpamClient>,
    pub locks: Arc<InMemoryLockManager>,
    pub config: Config,
}

impl World {
    pub fn env(&self) -> TaskEnvironment {
        TaskEnvironment {
            config: self.config.clone(),
            models: self.models.clone(),
            ipam: self.ipam.clone(),
            accounts: Arc::new(MockAccountAccessProvider::new(
                self.network.clone(),
                self.firewall.clone(),
            )),
            locks: self.locks.clone(),
        }
    }

    pub fn vpc(&self) -> Vpc {
        self.models.vpc(REGION, VPC_ID).unwrap()
    }
}

/// Build a VPC whose subnets are laid out in the tree, the cloud and the
/// snapshot alike.
///
/// The standard environment root owns `10.0.0.0/16`; the VPC aggregate is a
/// `/vpc_prefix` carved from it, and subnets are allocated in the given order.
pub fn world(vpc_type: VpcType, vpc_prefix: u8, subnets: &[Existing]) -> World {
    let root = environment_root(REGION, "dev", SubnetType::Private).unwrap();
    let vpc_path = std_vpc_container();
    let mut tree = ContainerTree::new();
    tree.add_environment_root(&root, &["10.0.0.0/16".parse().unwrap()])
        .unwrap();
    tree.ensure_container(&vpc_path).unwrap();
    let vpc_cidr = tree
        .allocate_block(&root, &vpc_path, vpc_prefix, BlockType::Vpc, BlockStatus::Aggregate)
        .unwrap();

    let network = Arc::new(MockNetwork::new());
    let mut state = VpcState {
        vpc_type,
        ..Default::default()
    };
    for s in subnets {
        let container = tree
            .add_container(&vpc_path, &format!("{}-{}", s.group, s.az))
            .unwrap();
        let cidr: Ipv4 = tree
            .allocate_block(
                &vpc_path,
                &container,
                s.prefix,
                BlockType::Subnet,
                BlockStatus::Deployed,
            )
            .unwrap();
        tree.set_resource_id(&container, s.id).unwrap();
        network.add_subnet(s.id, &az_name(s.az), cidr);
        state
            .availability_zones
            .entry(az_name(s.az))
            .or_insert_with(AvailabilityZoneInfra::default)
            .subnets
            .entry(s.subnet_type)
            .or_default()
            .push(SubnetInfo::new(s.id, s.group));
    }

    let associated: Vec<&str> = subnets
        .iter()
        .filter(|s| s.subnet_type == SubnetType::Firewall)
        .map(|s| s.id)
        .collect();
    let firewall = if vpc_type.has_firewall() && !associated.is_empty() {
        state.firewall = Some(Firewall {
            associated_subnet_ids: associated.iter().map(|s| s.to_string()).collect(),
        });
        Arc::new(MockFirewall::with_associated(network.clone(), &associated))
    } else {
        Arc::new(MockFirewall::new(network.clone()))
    };
    state.transit_gateway_attachments = Some(Vec::new());

    let models = Arc::new(MockModelsManager::new());
    models.put_vpc(Vpc {
        id: VPC_ID.to_string(),
        account_id: ACCOUNT.to_string(),
        region: REGION.to_string(),
        name: VPC_NAME.to_string(),
        stack: "dev".to_string(),
        cidrs: vec![vpc_cidr],
        state,
    });

    World {
        network,
        firewall,
        models,
        ipam: Arc::new(RecordingIpamClient::new(tree)),
        locks: Arc::new(InMemoryLockManager::new()),
        config: Config::default(),
    }
}

/// Two AZs with a /27 public and a /27 private subnet each, filling a /25.
pub fn scenario_a() -> World {
    world(
        VpcType::V1,
        25,
        &[
            existing("a", SubnetType::Public, "public", "subnet-pub-a", 27),
            existing("a", SubnetType::Private, "private", "subnet-priv-a", 27),
            existing("b", SubnetType::Public, "public", "subnet-pub-b", 27),
            existing("b", SubnetType::Private, "private", "subnet-priv-b", 27),
        ],
    )
}

/// Firewall VPC: /28 firewall and /27 private and public subnets in two AZs.
pub fn scenario_b() -> World {
    world(
        VpcType::V1Firewall,
        24,
        &[
            existing("a", SubnetType::Firewall, "firewall", "subnet-fw-a", 28),
            existing("b", SubnetType::Firewall, "firewall", "subnet-fw-b", 28),
            existing("a", SubnetType::Private, "private", "subnet-priv-a", 27),
            existing("a", SubnetType::Public, "public", "subnet-pub-a", 27),
            existing("b", SubnetType::Private, "private", "subnet-priv-b", 27),
            existing("b", SubnetType::Public, "public", "subnet-pub-b", 27),
        ],
    )
}

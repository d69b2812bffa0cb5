//! Update Networking end to end, through the task glue.

mod common;

use common::*;
use std::sync::Arc;
use vpc_topology::models::{
    AddAvailabilityZoneTaskData, EdgeAssociationType, NatGatewayInfo, NetworkingConfig,
    RouteInfo, RouteTableInfo, SubnetType, Task, TaskConfig, TaskStatus,
    UpdateNetworkingTaskData, VpcType,
};
use vpc_topology::tasks::{perform_task, StopSignal, TaskOutcome};
use vpc_topology::testmocks::MockFirewall;

fn networking_task(id: u64, connect_public: bool, connect_private: bool) -> Task {
    Task::new(
        id,
        TaskConfig::UpdateNetworking(UpdateNetworkingTaskData {
            vpc_id: VPC_ID.to_string(),
            region: REGION.to_string(),
            networking_config: NetworkingConfig {
                connect_public,
                connect_private,
            },
        }),
    )
}

async fn run(w: &World, connect_public: bool, connect_private: bool) -> (TaskOutcome, Task) {
    let task = networking_task(1, connect_public, connect_private);
    let outcome = perform_task(&w.env(), &task, &StopSignal::never()).await;
    (outcome, task)
}

fn two_az_world() -> World {
    world(
        VpcType::V1,
        24,
        &[
            existing("a", SubnetType::Public, "public", "subnet-pub-a", 27),
            existing("a", SubnetType::Private, "private", "subnet-priv-a", 27),
            existing("b", SubnetType::Public, "public", "subnet-pub-b", 27),
            existing("b", SubnetType::Private, "private", "subnet-priv-b", 27),
        ],
    )
}

/// Public routing and AZ `b` fully wired; AZ `a` untouched.
fn scenario_c() -> World {
    let w = two_az_world();
    let mut vpc = w.vpc();
    let state = &mut vpc.state;
    state.public_route_table_id = "rtb-public".to_string();
    state.add_route_table(RouteTableInfo {
        route_table_id: "rtb-public".to_string(),
        routes: vec![RouteInfo::via_internet_gateway("0.0.0.0/0", "igw-1")],
        subnet_type: Some(SubnetType::Public),
        edge_association_type: None,
    });
    state.internet_gateway.internet_gateway_id = "igw-1".to_string();
    state.internet_gateway.is_internet_gateway_attached = true;
    state.add_route_table(RouteTableInfo {
        route_table_id: "rtb-private-b".to_string(),
        routes: vec![RouteInfo::via_nat("0.0.0.0/0", "nat-b")],
        subnet_type: Some(SubnetType::Private),
        edge_association_type: None,
    });
    let az_b = state.availability_zones.get_mut("us-east-1b").unwrap();
    az_b.private_route_table_id = "rtb-private-b".to_string();
    az_b.nat_gateway = NatGatewayInfo {
        nat_gateway_id: "nat-b".to_string(),
        eip_id: "eipalloc-b".to_string(),
    };
    for list in az_b.subnets.values_mut() {
        for s in list.iter_mut() {
            s.route_table_association_id = format!("rtbassoc-{}", s.subnet_id);
        }
    }
    w.models.put_vpc(vpc);
    w
}

fn az_json(w: &World, az: &str) -> String {
    serde_json::to_string(&w.vpc().state.availability_zones[az]).unwrap()
}

#[tokio::test]
async fn test_connects_single_unwired_az() {
    let w = scenario_c();
    let az_b_before = az_json(&w, "us-east-1b");

    let (outcome, _) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));

    assert_eq!(w.network.calls_to("create_nat_gateway"), 1);
    assert_eq!(w.network.calls_to("allocate_eip"), 1);
    assert_eq!(w.network.calls_to("create_route_table"), 1);
    assert_eq!(w.network.calls_to("associate_route_table"), 2);
    assert_eq!(w.network.calls_to("create_route"), 1);
    assert_eq!(w.network.calls_to("replace_route"), 0);
    assert_eq!(w.network.calls_to("create_internet_gateway"), 0);
    assert_eq!(w.network.mutation_count(), 6);

    let vpc = w.vpc();
    let az_a = &vpc.state.availability_zones["us-east-1a"];
    assert!(!az_a.private_route_table_id.is_empty());
    assert!(!az_a.nat_gateway.nat_gateway_id.is_empty());
    assert!(az_a
        .all_subnets()
        .all(|(_, s)| !s.route_table_association_id.is_empty()));
    assert_eq!(
        vpc.state.route(&az_a.private_route_table_id, "0.0.0.0/0"),
        Some(&RouteInfo::via_nat("0.0.0.0/0", &az_a.nat_gateway.nat_gateway_id))
    );
    let nat_call = w
        .network
        .calls()
        .into_iter()
        .find(|(op, _)| op == "create_nat_gateway")
        .unwrap();
    assert!(nat_call.1.ends_with("subnet-pub-a"), "NAT goes in the public subnet");

    assert_eq!(az_json(&w, "us-east-1b"), az_b_before);
}

#[tokio::test]
async fn test_rerun_is_a_no_op() {
    let w = scenario_c();
    let (outcome, _) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));

    w.network.clear_calls();
    let updates = w.models.state_updates();
    let snapshot = w.models.state_json(REGION, VPC_ID).unwrap();

    let (outcome, task) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));
    assert_eq!(w.network.mutation_count(), 0);
    assert_eq!(w.models.state_updates(), updates);
    assert_eq!(w.models.state_json(REGION, VPC_ID).unwrap(), snapshot);
    assert_eq!(task.messages().last().map(String::as_str), Some("Done"));
}

#[tokio::test]
async fn test_missing_transit_gateway_list_is_normalized() {
    let w = two_az_world();
    let mut vpc = w.vpc();
    vpc.state.transit_gateway_attachments = None;
    w.models.put_vpc(vpc);

    let (outcome, _) = run(&w, false, false).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));
    assert_eq!(w.vpc().state.transit_gateway_attachments, Some(vec![]));
    assert_eq!(w.models.state_updates(), 1);
    assert_eq!(w.network.mutation_count(), 0);

    run(&w, false, false).await;
    assert_eq!(w.models.state_updates(), 1);
}

#[tokio::test]
async fn test_public_only_leaves_private_alone() {
    let w = two_az_world();
    let (outcome, _) = run(&w, true, false).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));

    let vpc = w.vpc();
    assert!(!vpc.state.public_route_table_id.is_empty());
    assert!(vpc.state.internet_gateway.is_internet_gateway_attached);
    assert_eq!(w.network.calls_to("create_nat_gateway"), 0);
    for az in vpc.state.availability_zones.values() {
        assert!(az.private_route_table_id.is_empty());
        assert!(az.subnets_of(SubnetType::Public)[0]
            .route_table_association_id
            .starts_with("rtbassoc-"));
        assert!(az.subnets_of(SubnetType::Private)[0]
            .route_table_association_id
            .is_empty());
    }
}

#[tokio::test]
async fn test_custom_types_get_their_own_route_table() {
    let w = world(
        VpcType::V1,
        24,
        &[
            existing("a", SubnetType::Public, "public", "subnet-pub-a", 27),
            existing("a", SubnetType::Private, "private", "subnet-priv-a", 27),
            existing("a", SubnetType::Data, "data", "subnet-data-a", 27),
        ],
    );
    w.network.queue_id("rtb", "rtb-public");
    w.network.queue_id("rtb", "rtb-private-a");
    w.network.queue_id("rtb", "rtb-data-a");

    let (outcome, _) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));

    let vpc = w.vpc();
    let az = &vpc.state.availability_zones["us-east-1a"];
    let data = &az.subnets_of(SubnetType::Data)[0];
    assert_eq!(data.custom_route_table_id, "rtb-data-a");
    assert_eq!(
        vpc.state.route_tables["rtb-data-a"].subnet_type,
        Some(SubnetType::Data)
    );
    let nat = &az.nat_gateway.nat_gateway_id;
    assert_eq!(
        vpc.state.route("rtb-data-a", "0.0.0.0/0"),
        Some(&RouteInfo::via_nat("0.0.0.0/0", nat))
    );
    assert!(w
        .network
        .calls()
        .contains(&("associate_route_table".to_string(), "rtb-data-a subnet-data-a".to_string())));
    assert!(w
        .network
        .calls()
        .contains(&("create_route_table".to_string(), format!("{VPC_ID} alpha-data-a"))));
}

#[tokio::test]
async fn test_changed_route_target_is_replaced() {
    let w = scenario_c();
    let mut vpc = w.vpc();
    vpc.state.put_route(
        "rtb-public",
        RouteInfo::via_internet_gateway("0.0.0.0/0", "igw-old"),
    );
    w.models.put_vpc(vpc);

    run(&w, true, false).await;
    assert_eq!(w.network.calls_to("replace_route"), 1);
    assert_eq!(w.network.calls_to("create_route"), 0);
    assert_eq!(
        w.vpc().state.route("rtb-public", "0.0.0.0/0"),
        Some(&RouteInfo::via_internet_gateway("0.0.0.0/0", "igw-1"))
    );
}

#[tokio::test]
async fn test_retry_after_partial_failure_converges() {
    let clean = two_az_world();
    run(&clean, true, true).await;

    let w = two_az_world();
    w.network.fail_once("create_nat_gateway");
    let (outcome, task) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Failed));
    assert!(task
        .messages()
        .iter()
        .any(|m| m.starts_with("Error: ") && m.contains("create_nat_gateway")));
    let partial = w.vpc();
    let az_a = &partial.state.availability_zones["us-east-1a"];
    assert!(!az_a.nat_gateway.eip_id.is_empty(), "EIP was saved before the failure");
    assert!(az_a.nat_gateway.nat_gateway_id.is_empty());

    let (outcome, _) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));
    assert_eq!(w.network.calls_to("allocate_eip"), 2, "one per AZ, none repeated");
    assert_eq!(w.network.calls_to("create_internet_gateway"), 1);
    assert_eq!(
        w.models.state_json(REGION, VPC_ID),
        clean.models.state_json(REGION, VPC_ID)
    );
}

#[tokio::test]
async fn test_firewall_vpc_routes_through_endpoints() {
    let w = scenario_b();
    let mut vpc = w.vpc();
    vpc.state.firewall = None;
    w.models.put_vpc(vpc);
    let w = World {
        firewall: Arc::new(MockFirewall::new(w.network.clone())),
        ..w
    };

    let (outcome, _) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));

    assert_eq!(w.network.calls_to("create_firewall"), 1);
    assert_eq!(w.network.calls_to("create_route_table"), 6);
    assert_eq!(w.network.calls_to("create_route"), 7);
    assert_eq!(w.network.calls_to("associate_route_table"), 6);
    assert_eq!(w.network.calls_to("associate_edge_route_table"), 1);
    assert_eq!(w.network.calls_to("allocate_eip"), 2);
    assert_eq!(w.network.calls_to("create_nat_gateway"), 2);
    assert_eq!(w.network.mutation_count(), 27);

    let vpc = w.vpc();
    let state = &vpc.state;
    assert_eq!(
        w.firewall.associated_subnet_ids(),
        vec!["subnet-fw-a".to_string(), "subnet-fw-b".to_string()]
    );
    assert_eq!(state.associated_firewall_subnets().len(), 2);
    assert!(state.public_route_table_id.is_empty(), "public tables are per AZ");

    let igw = &state.internet_gateway;
    assert_eq!(
        state.route_tables[&igw.route_table_id].edge_association_type,
        Some(EdgeAssociationType::InternetGateway)
    );
    assert!(!igw.route_table_association_id.is_empty());
    assert_eq!(
        state.route(&state.firewall_route_table_id, "0.0.0.0/0"),
        Some(&RouteInfo::via_internet_gateway("0.0.0.0/0", &igw.internet_gateway_id))
    );

    for letter in ["a", "b"] {
        let az_name = az_name(letter);
        let endpoint = format!("vpce-fw-{az_name}");
        let az = &state.availability_zones[&az_name];
        assert_eq!(
            state.route(&az.public_route_table_id, "0.0.0.0/0"),
            Some(&RouteInfo::via_endpoint("0.0.0.0/0", &endpoint))
        );
        let public_cidr = w
            .network
            .subnet(&format!("subnet-pub-{letter}"))
            .unwrap()
            .cidr
            .to_string();
        assert_eq!(
            state.route(&igw.route_table_id, &public_cidr),
            Some(&RouteInfo::via_endpoint(&public_cidr, &endpoint))
        );
        assert!(az
            .subnets_of(SubnetType::Firewall)
            .iter()
            .all(|s| !s.route_table_association_id.is_empty()));
    }

    w.network.clear_calls();
    let (outcome, _) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));
    assert_eq!(w.network.mutation_count(), 0);
}

#[tokio::test]
async fn test_new_az_firewall_subnet_is_associated() {
    let w = scenario_b();
    w.network.queue_id("subnet", "subnet-fw-c");
    let add = Task::new(
        1,
        TaskConfig::AddAvailabilityZone(AddAvailabilityZoneTaskData {
            vpc_id: VPC_ID.to_string(),
            region: REGION.to_string(),
            az_name: az_name("c"),
        }),
    );
    perform_task(&w.env(), &add, &StopSignal::never()).await;
    assert_eq!(add.status(), TaskStatus::Successful);
    w.network.clear_calls();

    let (outcome, _) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));
    assert_eq!(w.network.calls_to("create_firewall"), 0);
    let associations: Vec<_> = w
        .network
        .calls()
        .into_iter()
        .filter(|(op, _)| op == "associate_firewall_subnets")
        .collect();
    assert_eq!(associations.len(), 1);
    assert_eq!(associations[0].1, format!("{VPC_ID} subnet-fw-c"));
    assert!(w
        .vpc()
        .state
        .associated_firewall_subnets()
        .contains(&"subnet-fw-c".to_string()));
}

#[tokio::test]
async fn test_legacy_vpc_is_wired_like_any_other() {
    let w = two_az_world();
    let mut vpc = w.vpc();
    vpc.state.vpc_type = VpcType::Legacy;
    w.models.put_vpc(vpc);

    let (outcome, _) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Successful));
    let state = w.vpc().state;
    assert!(!state.public_route_table_id.is_empty());
    assert!(state.internet_gateway.is_internet_gateway_attached);
    for az in state.availability_zones.values() {
        assert!(!az.private_route_table_id.is_empty());
        assert!(!az.nat_gateway.nat_gateway_id.is_empty());
        assert!(az
            .all_subnets()
            .all(|(_, s)| !s.route_table_association_id.is_empty()));
    }
}

#[tokio::test]
async fn test_exception_vpc_is_unsupported() {
    let w = two_az_world();
    let mut vpc = w.vpc();
    vpc.state.vpc_type = VpcType::Exception;
    w.models.put_vpc(vpc);
    let (outcome, task) = run(&w, true, true).await;
    assert_eq!(outcome, TaskOutcome::Finished(TaskStatus::Failed));
    assert!(task.messages().iter().any(|m| m.contains("unsupported")));
    assert_eq!(w.models.state_updates(), 0);
    assert_eq!(w.network.mutation_count(), 0);
}

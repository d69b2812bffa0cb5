//! In-memory stand-ins for the cloud, the models store and IPAM.
//!
//! Used by the unit and integration tests. The cloud doubles hand out
//! predictable ids and keep a call log so tests can count mutations.

use crate::cloud::{AccountAccessProvider, CloudAccountAccess, FirewallApi, NetworkApi};
use crate::error::{Error, Result};
use crate::ipam::{ContainerTree, IpamClient};
use crate::models::{CloudSubnet, Ipv4, RouteInfo, Vpc, VpcState};
use crate::store::ModelsManager;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct NetworkState {
    subnets: Vec<CloudSubnet>,
    peering_cidrs: Vec<Ipv4>,
    calls: Vec<(String, String)>,
    queued_ids: HashMap<String, VecDeque<String>>,
    counter: u64,
    /// Successful calls left before the operation fails once.
    failures: HashMap<String, usize>,
    stop_after: Option<(String, watch::Sender<bool>)>,
}

/// Cloud networking double.
///
/// Ids come from [`MockNetwork::queue_id`] when queued, otherwise from a
/// counter (`subnet-0001`, `rtb-0002`, ...). Subnets it creates show up in
/// later `describe_subnets` calls.
#[derive(Default)]
pub struct MockNetwork {
    state: Mutex<NetworkState>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing subnet.
    pub fn add_subnet(&self, subnet_id: &str, availability_zone: &str, cidr: Ipv4) {
        locked(&self.state).subnets.push(CloudSubnet {
            subnet_id: subnet_id.to_string(),
            availability_zone: availability_zone.to_string(),
            cidr,
        });
    }

    /// Seed a CIDR of a peered VPC.
    pub fn add_peering_cidr(&self, cidr: Ipv4) {
        locked(&self.state).peering_cidrs.push(cidr);
    }

    /// Next id returned for resources of `kind` (`subnet`, `rtb`, `rtbassoc`,
    /// `eipalloc`, `nat`, `igw`).
    pub fn queue_id(&self, kind: &str, id: &str) {
        locked(&self.state)
            .queued_ids
            .entry(kind.to_string())
            .or_default()
            .push_back(id.to_string());
    }

    /// Make the next call to `operation` fail with a cloud error.
    pub fn fail_once(&self, operation: &str) {
        self.fail_once_after(operation, 0);
    }

    /// Let `successes` calls to `operation` through, then fail the next one.
    pub fn fail_once_after(&self, operation: &str, successes: usize) {
        locked(&self.state)
            .failures
            .insert(operation.to_string(), successes);
    }

    /// Raise `stop` once a call to `operation` has succeeded.
    pub fn stop_after(&self, operation: &str, stop: watch::Sender<bool>) {
        locked(&self.state).stop_after = Some((operation.to_string(), stop));
    }

    /// Every call as `(operation, detail)`, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        locked(&self.state).calls.clone()
    }

    pub fn calls_to(&self, operation: &str) -> usize {
        locked(&self.state)
            .calls
            .iter()
            .filter(|(op, _)| op == operation)
            .count()
    }

    /// Number of calls that changed something in the cloud.
    pub fn mutation_count(&self) -> usize {
        locked(&self.state)
            .calls
            .iter()
            .filter(|(op, _)| !op.starts_with("describe") && !op.starts_with("endpoint"))
            .count()
    }

    pub fn clear_calls(&self) {
        locked(&self.state).calls.clear();
    }

    pub fn subnet(&self, subnet_id: &str) -> Option<CloudSubnet> {
        locked(&self.state)
            .subnets
            .iter()
            .find(|s| s.subnet_id == subnet_id)
            .cloned()
    }

    fn record(&self, operation: &str, detail: String) -> Result<()> {
        let mut state = locked(&self.state);
        match state.failures.get_mut(operation) {
            Some(0) => {
                state.failures.remove(operation);
                return Err(Error::cloud(operation, "injected failure"));
            }
            Some(left) => *left -= 1,
            None => {}
        }
        state.calls.push((operation.to_string(), detail));
        if let Some((op, stop)) = &state.stop_after {
            if op == operation {
                let _ = stop.send(true);
            }
        }
        Ok(())
    }

    fn next_id(&self, kind: &str) -> String {
        let mut state = locked(&self.state);
        if let Some(id) = state.queued_ids.get_mut(kind).and_then(|q| q.pop_front()) {
            return id;
        }
        state.counter += 1;
        format!("{kind}-{:04}", state.counter)
    }
}

#[async_trait]
impl NetworkApi for MockNetwork {
    async fn describe_subnets(&self, vpc_id: &str) -> Result<Vec<CloudSubnet>> {
        self.record("describe_subnets", vpc_id.to_string())?;
        Ok(locked(&self.state).subnets.clone())
    }

    async fn describe_peering_cidrs(&self, vpc_id: &str) -> Result<Vec<Ipv4>> {
        self.record("describe_peering_cidrs", vpc_id.to_string())?;
        Ok(locked(&self.state).peering_cidrs.clone())
    }

    async fn associate_vpc_cidr(&self, vpc_id: &str, cidr: &Ipv4) -> Result<()> {
        self.record("associate_vpc_cidr", format!("{vpc_id} {cidr}"))
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        az_name: &str,
        cidr: &Ipv4,
        name: &str,
        _group_name: &str,
    ) -> Result<String> {
        self.record("create_subnet", format!("{vpc_id} {az_name} {cidr} {name}"))?;
        let id = self.next_id("subnet");
        self.add_subnet(&id, az_name, *cidr);
        Ok(id)
    }

    async fn create_route_table(&self, vpc_id: &str, name: &str) -> Result<String> {
        self.record("create_route_table", format!("{vpc_id} {name}"))?;
        Ok(self.next_id("rtb"))
    }

    async fn create_route(&self, route_table_id: &str, route: &RouteInfo) -> Result<()> {
        self.record("create_route", format!("{route_table_id} {}", route.destination))
    }

    async fn replace_route(&self, route_table_id: &str, route: &RouteInfo) -> Result<()> {
        self.record("replace_route", format!("{route_table_id} {}", route.destination))
    }

    async fn associate_route_table(&self, route_table_id: &str, subnet_id: &str) -> Result<String> {
        self.record("associate_route_table", format!("{route_table_id} {subnet_id}"))?;
        Ok(self.next_id("rtbassoc"))
    }

    async fn associate_edge_route_table(
        &self,
        route_table_id: &str,
        gateway_id: &str,
    ) -> Result<String> {
        self.record(
            "associate_edge_route_table",
            format!("{route_table_id} {gateway_id}"),
        )?;
        Ok(self.next_id("rtbassoc"))
    }

    async fn allocate_eip(&self, name: &str) -> Result<String> {
        self.record("allocate_eip", name.to_string())?;
        Ok(self.next_id("eipalloc"))
    }

    async fn create_nat_gateway(
        &self,
        name: &str,
        eip_id: &str,
        subnet_id: &str,
    ) -> Result<String> {
        self.record("create_nat_gateway", format!("{name} {eip_id} {subnet_id}"))?;
        Ok(self.next_id("nat"))
    }

    async fn create_internet_gateway(&self, name: &str) -> Result<String> {
        self.record("create_internet_gateway", name.to_string())?;
        Ok(self.next_id("igw"))
    }

    async fn attach_internet_gateway(&self, internet_gateway_id: &str, vpc_id: &str) -> Result<()> {
        self.record(
            "attach_internet_gateway",
            format!("{internet_gateway_id} {vpc_id}"),
        )
    }
}

/// Firewall double sharing the call log of its [`MockNetwork`].
///
/// One endpoint per AZ that has an associated subnet, named `vpce-fw-{az}`.
pub struct MockFirewall {
    network: Arc<MockNetwork>,
    associated: Mutex<Vec<String>>,
}

impl MockFirewall {
    pub fn new(network: Arc<MockNetwork>) -> Self {
        MockFirewall {
            network,
            associated: Mutex::new(Vec::new()),
        }
    }

    /// Seed subnets already associated with an existing firewall.
    pub fn with_associated(network: Arc<MockNetwork>, subnet_ids: &[&str]) -> Self {
        MockFirewall {
            network,
            associated: Mutex::new(subnet_ids.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn associated_subnet_ids(&self) -> Vec<String> {
        locked(&self.associated).clone()
    }
}

#[async_trait]
impl FirewallApi for MockFirewall {
    async fn create_firewall(&self, vpc_id: &str, name: &str, subnet_ids: &[String]) -> Result<()> {
        self.network.record(
            "create_firewall",
            format!("{vpc_id} {name} {}", subnet_ids.join(",")),
        )?;
        locked(&self.associated).extend(subnet_ids.iter().cloned());
        Ok(())
    }

    async fn associate_subnets(&self, vpc_id: &str, subnet_ids: &[String]) -> Result<()> {
        self.network.record(
            "associate_firewall_subnets",
            format!("{vpc_id} {}", subnet_ids.join(",")),
        )?;
        locked(&self.associated).extend(subnet_ids.iter().cloned());
        Ok(())
    }

    async fn endpoint_ids_by_az(&self, vpc_id: &str) -> Result<BTreeMap<String, String>> {
        self.network
            .record("endpoint_ids_by_az", vpc_id.to_string())?;
        Ok(self
            .associated_subnet_ids()
            .iter()
            .filter_map(|id| self.network.subnet(id))
            .map(|s| {
                let endpoint = format!("vpce-fw-{}", s.availability_zone);
                (s.availability_zone, endpoint)
            })
            .collect())
    }
}

/// Hands out the same pair of doubles for every account.
pub struct MockAccountAccessProvider {
    pub network: Arc<MockNetwork>,
    pub firewall: Arc<MockFirewall>,
}

impl MockAccountAccessProvider {
    pub fn new(network: Arc<MockNetwork>, firewall: Arc<MockFirewall>) -> Self {
        MockAccountAccessProvider { network, firewall }
    }
}

#[async_trait]
impl AccountAccessProvider for MockAccountAccessProvider {
    async fn access_account(&self, account_id: &str, region: &str) -> Result<CloudAccountAccess> {
        Ok(CloudAccountAccess {
            account_id: account_id.to_string(),
            region: region.to_string(),
            network: self.network.clone(),
            firewall: self.firewall.clone(),
        })
    }
}

/// Models store kept in memory.
#[derive(Default)]
pub struct MockModelsManager {
    vpcs: Mutex<BTreeMap<(String, String), Vpc>>,
    state_updates: Mutex<usize>,
}

impl MockModelsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_vpc(&self, vpc: Vpc) {
        locked(&self.vpcs).insert((vpc.region.clone(), vpc.id.clone()), vpc);
    }

    pub fn vpc(&self, region: &str, vpc_id: &str) -> Option<Vpc> {
        locked(&self.vpcs)
            .get(&(region.to_string(), vpc_id.to_string()))
            .cloned()
    }

    /// Serialized snapshot, for byte-for-byte comparisons.
    pub fn state_json(&self, region: &str, vpc_id: &str) -> Option<String> {
        self.vpc(region, vpc_id)
            .and_then(|v| serde_json::to_string(&v.state).ok())
    }

    pub fn state_updates(&self) -> usize {
        *locked(&self.state_updates)
    }
}

#[async_trait]
impl ModelsManager for MockModelsManager {
    async fn get_vpc(&self, region: &str, vpc_id: &str) -> Result<Vpc> {
        self.vpc(region, vpc_id).ok_or_else(|| {
            Error::InvalidRequest(format!("VPC {vpc_id} in {region} is not managed"))
        })
    }

    async fn update_state(&self, region: &str, vpc_id: &str, state: &VpcState) -> Result<()> {
        let mut vpcs = locked(&self.vpcs);
        let vpc = vpcs
            .get_mut(&(region.to_string(), vpc_id.to_string()))
            .ok_or_else(|| Error::InvalidRequest(format!("VPC {vpc_id} is not managed")))?;
        vpc.state = state.clone();
        *locked(&self.state_updates) += 1;
        Ok(())
    }

    async fn insert_vpc_cidr(&self, region: &str, vpc_id: &str, cidr: &Ipv4) -> Result<()> {
        let mut vpcs = locked(&self.vpcs);
        let vpc = vpcs
            .get_mut(&(region.to_string(), vpc_id.to_string()))
            .ok_or_else(|| Error::InvalidRequest(format!("VPC {vpc_id} is not managed")))?;
        if !vpc.cidrs.contains(cidr) {
            vpc.cidrs.push(*cidr);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpamCall {
    Load,
    Save,
}

/// IPAM double that logs loads and saves.
///
/// With a delay set, every load sleeps before returning, which widens the
/// window in which an unlocked writer would interleave with another.
pub struct RecordingIpamClient {
    tree: Mutex<ContainerTree>,
    calls: Mutex<Vec<IpamCall>>,
    delay: Option<Duration>,
    fail_next_save: Mutex<bool>,
}

impl RecordingIpamClient {
    pub fn new(tree: ContainerTree) -> Self {
        RecordingIpamClient {
            tree: Mutex::new(tree),
            calls: Mutex::new(Vec::new()),
            delay: None,
            fail_next_save: Mutex::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next save fail without storing anything.
    pub fn fail_next_save(&self) {
        *locked(&self.fail_next_save) = true;
    }

    pub fn tree(&self) -> ContainerTree {
        locked(&self.tree).clone()
    }

    pub fn calls(&self) -> Vec<IpamCall> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl IpamClient for RecordingIpamClient {
    async fn load_tree(&self) -> Result<ContainerTree> {
        locked(&self.calls).push(IpamCall::Load);
        let tree = self.tree();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(tree)
    }

    async fn save_tree(&self, tree: &ContainerTree) -> Result<()> {
        tree.verify_tiling()?;
        if std::mem::take(&mut *locked(&self.fail_next_save)) {
            return Err(Error::cloud("save_tree", "injected failure"));
        }
        locked(&self.calls).push(IpamCall::Save);
        *locked(&self.tree) = tree.clone();
        Ok(())
    }
}

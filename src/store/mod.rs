//! Persistence of VPC records and their topology snapshots.

use crate::error::{Error, Result};
use crate::models::{Ipv4, Vpc, VpcState};
use crate::persist::{read_json_file, write_json_file};
use async_trait::async_trait;
use std::path::PathBuf;

#[async_trait]
pub trait ModelsManager: Send + Sync {
    async fn get_vpc(&self, region: &str, vpc_id: &str) -> Result<Vpc>;

    /// Replace the whole snapshot of the VPC.
    async fn update_state(&self, region: &str, vpc_id: &str, state: &VpcState) -> Result<()>;

    /// Record an additional CIDR associated with the VPC.
    async fn insert_vpc_cidr(&self, region: &str, vpc_id: &str, cidr: &Ipv4) -> Result<()>;
}

/// One JSON file per VPC at `{state_dir}/{region}/{vpc_id}.json`.
pub struct FileModelsManager {
    state_dir: PathBuf,
}

impl FileModelsManager {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        FileModelsManager {
            state_dir: state_dir.into(),
        }
    }

    fn vpc_path(&self, region: &str, vpc_id: &str) -> Result<PathBuf> {
        let safe = |s: &str| !s.is_empty() && !s.contains(['/', '\\']) && s != "..";
        if !safe(region) || !safe(vpc_id) {
            return Err(Error::InvalidRequest(format!(
                "invalid VPC key {region}/{vpc_id}"
            )));
        }
        Ok(self.state_dir.join(region).join(format!("{vpc_id}.json")))
    }

    /// Store a whole VPC record, replacing any existing one.
    pub fn put_vpc(&self, vpc: &Vpc) -> Result<()> {
        write_json_file(&self.vpc_path(&vpc.region, &vpc.id)?, vpc)
    }
}

#[async_trait]
impl ModelsManager for FileModelsManager {
    async fn get_vpc(&self, region: &str, vpc_id: &str) -> Result<Vpc> {
        let path = self.vpc_path(region, vpc_id)?;
        if !path.exists() {
            return Err(Error::InvalidRequest(format!(
                "VPC {vpc_id} in {region} is not managed"
            )));
        }
        read_json_file(&path)
    }

    async fn update_state(&self, region: &str, vpc_id: &str, state: &VpcState) -> Result<()> {
        let mut vpc = self.get_vpc(region, vpc_id).await?;
        vpc.state = state.clone();
        self.put_vpc(&vpc)
    }

    async fn insert_vpc_cidr(&self, region: &str, vpc_id: &str, cidr: &Ipv4) -> Result<()> {
        let mut vpc = self.get_vpc(region, vpc_id).await?;
        if !vpc.cidrs.contains(cidr) {
            vpc.cidrs.push(*cidr);
            log::info!("Recorded CIDR {cidr} for {vpc_id}");
        }
        self.put_vpc(&vpc)
    }
}

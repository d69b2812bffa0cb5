//! Access to the IPAM inventory.
//!
//! The inventory has no transactions of its own: callers load the whole tree,
//! allocate or delete blocks on it, and save it back while holding
//! [`LockTarget::IpamWrite`](crate::lock::LockTarget::IpamWrite).

use super::tree::ContainerTree;
use crate::error::{Error, Result};
use crate::persist::{read_json_file, write_json_file};
use async_trait::async_trait;
use std::path::PathBuf;

#[async_trait]
pub trait IpamClient: Send + Sync {
    async fn load_tree(&self) -> Result<ContainerTree>;

    async fn save_tree(&self, tree: &ContainerTree) -> Result<()>;
}

/// Keeps the inventory in one JSON file.
pub struct FileIpamClient {
    path: PathBuf,
}

impl FileIpamClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileIpamClient { path: path.into() }
    }
}

#[async_trait]
impl IpamClient for FileIpamClient {
    async fn load_tree(&self) -> Result<ContainerTree> {
        if !self.path.exists() {
            log::warn!(
                "Inventory file not found: {}, starting empty",
                self.path.display()
            );
            return Ok(ContainerTree::new());
        }
        log::info!("Reading inventory from {}", self.path.display());
        read_json_file(&self.path)
    }

    async fn save_tree(&self, tree: &ContainerTree) -> Result<()> {
        tree.verify_tiling().map_err(|e| match e {
            Error::InconsistentInventory(msg) => {
                Error::InconsistentInventory(format!("refusing to save: {msg}"))
            }
            other => other,
        })?;
        log::info!("Writing inventory to {}", self.path.display());
        write_json_file(&self.path, tree)
    }
}

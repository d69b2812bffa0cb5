//! CIDR container tree.
//!
//! Containers are addressed by their full path (`/Global/AWS/V4/...`). Each
//! block records the container it was carved from (`parent_path`) and the
//! container that owns it (`container_path`):
//! - a container's *own* blocks are those held in its `blocks` list that were
//!   carved from another container (Aggregate, Deployed, or an unused Free
//!   registration such as an environment root's range)
//! - a container's *level* is every block in the tree whose `parent_path` is
//!   that container: its own Free remainders plus the blocks handed to children
//!
//! For every container holding Aggregate blocks, the level must tile the
//! Aggregate ranges exactly. [`ContainerTree::verify_tiling`] checks that.

use crate::error::{Error, Result};
use crate::models::Ipv4;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Path of the single tree root.
pub const ROOT_PATH: &str = "/Global";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockType {
    Environment,
    #[serde(rename = "VPC")]
    Vpc,
    Subnet,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockStatus {
    Free,
    Aggregate,
    Deployed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub parent_path: String,
    pub container_path: String,
    pub address: Ipv4Addr,
    pub block_type: BlockType,
    pub prefix_length: u8,
    pub status: BlockStatus,
}

impl Block {
    pub fn cidr(&self) -> Ipv4 {
        Ipv4 {
            addr: self.address,
            mask: self.prefix_length,
        }
    }

    /// Free space of the container that holds it.
    fn is_level_free(&self) -> bool {
        self.status == BlockStatus::Free && self.parent_path == self.container_path
    }

    /// Range registered to a container but never subdivided.
    fn is_unused_registration(&self) -> bool {
        self.status == BlockStatus::Free && self.parent_path != self.container_path
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub children: Vec<Container>,
}

impl Container {
    fn new(name: &str) -> Self {
        Container {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Last path component.
    pub fn short_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn aggregate_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks
            .iter()
            .filter(|b| b.status == BlockStatus::Aggregate && b.parent_path != self.name)
    }

    pub fn free_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_level_free())
    }

    pub fn deployed_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks
            .iter()
            .filter(|b| b.status == BlockStatus::Deployed)
    }
}

/// A Free block chosen for allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeBlock {
    pub container: String,
    pub cidr: Ipv4,
    pub block_type: BlockType,
    /// An unused registration that becomes Aggregate when allocated from.
    pub needs_promotion: bool,
}

pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    format!("{parent}/{name}")
}

/// `path` is `ancestor` or lies below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || (path.starts_with(ancestor) && path[ancestor.len()..].starts_with('/'))
}

fn find<'a>(node: &'a Container, path: &str) -> Option<&'a Container> {
    if node.name == path {
        return Some(node);
    }
    let child = node.children.iter().find(|c| is_within(path, &c.name))?;
    find(child, path)
}

fn find_mut<'a>(node: &'a mut Container, path: &str) -> Option<&'a mut Container> {
    if node.name == path {
        return Some(node);
    }
    let child = node.children.iter_mut().find(|c| is_within(path, &c.name))?;
    find_mut(child, path)
}

fn walk<'a>(node: &'a Container, out: &mut Vec<&'a Container>) {
    out.push(node);
    for child in &node.children {
        walk(child, out);
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct ContainerTree {
    pub root: Container,
}

impl Default for ContainerTree {
    fn default() -> Self {
        ContainerTree {
            root: Container::new(ROOT_PATH),
        }
    }
}

impl ContainerTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Container> {
        find(&self.root, path)
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Container> {
        find_mut(&mut self.root, path)
    }

    fn require_mut(&mut self, path: &str) -> Result<&mut Container> {
        self.get_mut(path)
            .ok_or_else(|| Error::InconsistentInventory(format!("container {path} does not exist")))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Every container, parents before children.
    pub fn containers(&self) -> Vec<&Container> {
        let mut out = Vec::new();
        walk(&self.root, &mut out);
        out
    }

    /// Create a container directly under `parent`.
    pub fn add_container(&mut self, parent: &str, name: &str) -> Result<String> {
        let path = join_path(parent, name);
        if self.contains(&path) {
            return Err(Error::InconsistentInventory(format!(
                "container {path} already exists"
            )));
        }
        let node = self.require_mut(parent)?;
        node.children.push(Container::new(&path));
        log::debug!("Created container {path}");
        Ok(path)
    }

    /// Create `path` and any missing ancestors below the root.
    pub fn ensure_container(&mut self, path: &str) -> Result<()> {
        if self.contains(path) {
            return Ok(());
        }
        if !is_within(path, ROOT_PATH) {
            return Err(Error::InvalidRequest(format!(
                "container {path} is outside {ROOT_PATH}"
            )));
        }
        let parent = parent_path(path)
            .ok_or_else(|| Error::InvalidRequest(format!("invalid container path {path}")))?;
        self.ensure_container(parent)?;
        let name = &path[parent.len() + 1..];
        self.add_container(parent, name)?;
        Ok(())
    }

    /// Register an environment root owning `cidrs` as unused ranges.
    ///
    /// The first allocation from a range promotes it to Aggregate.
    pub fn add_environment_root(&mut self, path: &str, cidrs: &[Ipv4]) -> Result<()> {
        self.ensure_container(path)?;
        let parent = parent_path(path).unwrap_or(ROOT_PATH).to_string();
        let node = self.require_mut(path)?;
        for cidr in cidrs {
            let cidr = cidr.network();
            if node.blocks.iter().any(|b| b.cidr().overlaps(&cidr)) {
                return Err(Error::InconsistentInventory(format!(
                    "{cidr} overlaps an existing block of {path}"
                )));
            }
            node.blocks.push(Block {
                parent_path: parent.clone(),
                container_path: path.to_string(),
                address: cidr.addr,
                block_type: BlockType::Environment,
                prefix_length: cidr.mask,
                status: BlockStatus::Free,
            });
        }
        Ok(())
    }

    pub fn set_resource_id(&mut self, path: &str, resource_id: &str) -> Result<()> {
        self.require_mut(path)?.resource_id = Some(resource_id.to_string());
        Ok(())
    }

    pub fn container_for_resource(&self, resource_id: &str) -> Option<&Container> {
        self.containers()
            .into_iter()
            .find(|c| c.resource_id.as_deref() == Some(resource_id))
    }

    fn best_free_in(&self, container: &str, prefix_len: u8) -> Option<FreeBlock> {
        let node = self.get(container)?;
        node.blocks
            .iter()
            .filter(|b| b.is_level_free() || b.is_unused_registration())
            .filter(|b| b.prefix_length <= prefix_len)
            .min_by_key(|b| (Reverse(b.prefix_length), b.address))
            .map(|b| FreeBlock {
                container: container.to_string(),
                cidr: b.cidr(),
                block_type: b.block_type,
                needs_promotion: b.is_unused_registration(),
            })
    }

    /// Smallest Free block able to hold a `/prefix_len`, searching `container`
    /// and then `alternate_root`. Ties go to the lowest address.
    pub fn find_free_block(
        &self,
        container: &str,
        alternate_root: Option<&str>,
        prefix_len: u8,
    ) -> Result<FreeBlock> {
        if let Some(found) = self.best_free_in(container, prefix_len) {
            return Ok(found);
        }
        if let Some(alt) = alternate_root {
            if let Some(found) = self.best_free_in(alt, prefix_len) {
                log::debug!("No /{prefix_len} in {container}, using {alt}");
                return Ok(found);
            }
        }
        let searched = match alternate_root {
            Some(alt) => format!("{container} or {alt}"),
            None => container.to_string(),
        };
        Err(Error::NoSpaceAvailable {
            prefix: prefix_len,
            searched,
        })
    }

    pub fn has_free_space(&self, container: &str, prefix_len: u8) -> bool {
        self.best_free_in(container, prefix_len).is_some()
    }

    /// Carve a `/prefix_len` out of `parent` and hand it to `target`.
    ///
    /// Picks the smallest sufficient Free block and halves it until the
    /// requested size is isolated; each upper half stays Free in `parent`.
    /// An Aggregate allocation also seeds `target` with an equal Free range.
    pub fn allocate_block(
        &mut self,
        parent: &str,
        target: &str,
        prefix_len: u8,
        block_type: BlockType,
        status: BlockStatus,
    ) -> Result<Ipv4> {
        if status == BlockStatus::Free {
            return Err(Error::InvalidRequest(
                "blocks are allocated as Aggregate or Deployed".to_string(),
            ));
        }
        if status == BlockStatus::Aggregate && parent == target {
            return Err(Error::InvalidRequest(format!(
                "{target} cannot aggregate its own space"
            )));
        }
        if prefix_len > crate::models::MAX_LENGTH {
            return Err(Error::invalid_cidr(prefix_len, "network length is too long"));
        }
        if !self.contains(target) {
            return Err(Error::InconsistentInventory(format!(
                "container {target} does not exist"
            )));
        }
        let chosen = self.find_free_block(parent, None, prefix_len)?;
        let node = self.require_mut(parent)?;

        if chosen.needs_promotion {
            let registration = node
                .blocks
                .iter_mut()
                .find(|b| b.is_unused_registration() && b.cidr() == chosen.cidr)
                .ok_or_else(|| {
                    Error::InconsistentInventory(format!("{} vanished from {parent}", chosen.cidr))
                })?;
            registration.status = BlockStatus::Aggregate;
            log::info!("Promoted {} in {parent} to Aggregate", chosen.cidr);
        } else {
            node.blocks
                .retain(|b| !(b.is_level_free() && b.cidr() == chosen.cidr));
        }

        let residual_type = chosen.block_type;
        let mut piece = chosen.cidr;
        while piece.mask < prefix_len {
            let (low, high) = piece.halves()?;
            node.blocks.push(Block {
                parent_path: parent.to_string(),
                container_path: parent.to_string(),
                address: high.addr,
                block_type: residual_type,
                prefix_length: high.mask,
                status: BlockStatus::Free,
            });
            piece = low;
        }

        let target_node = self.require_mut(target)?;
        target_node.blocks.push(Block {
            parent_path: parent.to_string(),
            container_path: target.to_string(),
            address: piece.addr,
            block_type,
            prefix_length: piece.mask,
            status,
        });
        if status == BlockStatus::Aggregate {
            target_node.blocks.push(Block {
                parent_path: target.to_string(),
                container_path: target.to_string(),
                address: piece.addr,
                block_type,
                prefix_length: piece.mask,
                status: BlockStatus::Free,
            });
        }
        log::info!("Allocated {piece} ({status:?}) from {parent} to {target}");
        Ok(piece)
    }

    /// Return an allocated block of `container` to its parent as Free space.
    ///
    /// Free siblings are not coalesced.
    pub fn delete_block(&mut self, container: &str, cidr: &Ipv4) -> Result<()> {
        let node = self.get(container).ok_or_else(|| {
            Error::InconsistentInventory(format!("container {container} does not exist"))
        })?;
        let block = node
            .blocks
            .iter()
            .find(|b| b.cidr() == *cidr && b.status != BlockStatus::Free)
            .cloned()
            .ok_or_else(|| {
                Error::InconsistentInventory(format!("{cidr} is not allocated in {container}"))
            })?;

        if block.status == BlockStatus::Aggregate {
            let in_use: Vec<Ipv4> = self
                .level_blocks(container)
                .into_iter()
                .filter(|b| cidr.contains(&b.cidr()) && !b.is_level_free())
                .map(|b| b.cidr())
                .collect();
            if !in_use.is_empty() {
                return Err(Error::InconsistentInventory(format!(
                    "{cidr} in {container} still holds {} allocated block(s)",
                    in_use.len()
                )));
            }
        }

        let is_own_level = block.parent_path == container;
        let node = self.require_mut(container)?;
        if is_own_level {
            if let Some(b) = node
                .blocks
                .iter_mut()
                .find(|b| b.cidr() == *cidr && b.status == block.status)
            {
                b.status = BlockStatus::Free;
            }
        } else {
            node.blocks.retain(|b| {
                let same = b.cidr() == *cidr && b.status == block.status;
                let inside_free = b.is_level_free() && cidr.contains(&b.cidr());
                !same && !inside_free
            });
            let parent = self.require_mut(&block.parent_path)?;
            parent.blocks.push(Block {
                container_path: block.parent_path.clone(),
                status: BlockStatus::Free,
                ..block
            });
        }
        log::info!("Released {cidr} from {container}");
        Ok(())
    }

    /// Every block carved from `path`, wherever it is held.
    pub fn level_blocks(&self, path: &str) -> Vec<&Block> {
        self.containers()
            .into_iter()
            .flat_map(|c| c.blocks.iter())
            .filter(|b| b.parent_path == path)
            .collect()
    }

    /// Check that every Aggregate container is exactly tiled by its level.
    pub fn verify_tiling(&self) -> Result<()> {
        let mut levels: BTreeMap<&str, Vec<&Block>> = BTreeMap::new();
        for node in self.containers() {
            for b in &node.blocks {
                levels.entry(b.parent_path.as_str()).or_default().push(b);
            }
        }

        for node in self.containers() {
            let mut aggregates: Vec<Ipv4> = node.aggregate_blocks().map(|b| b.cidr()).collect();
            if aggregates.is_empty() {
                continue;
            }
            aggregates.sort_by_key(|c| c.lo());
            check_disjoint(&node.name, &aggregates)?;

            let mut level: Vec<Ipv4> = levels
                .remove(node.name.as_str())
                .unwrap_or_default()
                .iter()
                .map(|b| b.cidr())
                .collect();
            level.sort_by_key(|c| c.lo());
            for cidr in &level {
                if cidr.lo() != cidr.addr {
                    return Err(Error::InconsistentInventory(format!(
                        "{cidr} in {} is not aligned",
                        node.name
                    )));
                }
                if !aggregates.iter().any(|a| a.contains(cidr)) {
                    return Err(Error::InconsistentInventory(format!(
                        "{cidr} lies outside the aggregates of {}",
                        node.name
                    )));
                }
            }
            check_disjoint(&node.name, &level)?;

            let total: u64 = aggregates.iter().map(|c| c.size()).sum();
            let covered: u64 = level.iter().map(|c| c.size()).sum();
            if total != covered {
                return Err(Error::InconsistentInventory(format!(
                    "{} tiles {covered} of {total} addresses",
                    node.name
                )));
            }
        }

        // Only environment registrations may hang off a container without Aggregates.
        for (path, blocks) in &levels {
            if let Some(b) = blocks
                .iter()
                .find(|b| b.block_type != BlockType::Environment)
            {
                return Err(Error::InconsistentInventory(format!(
                    "{} in {} was carved from {path}, which holds no Aggregate",
                    b.cidr(),
                    b.container_path
                )));
            }
        }
        Ok(())
    }
}

fn check_disjoint(path: &str, sorted: &[Ipv4]) -> Result<()> {
    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(Error::InconsistentInventory(format!(
                "{} overlaps {} in {path}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

//! IP address management.
//!
//! - [`tree`] - the CIDR container tree and its allocator
//! - [`naming`] - environment root and container naming
//! - [`client`] - loading and saving the tree

pub mod client;
pub mod naming;
pub mod tree;

pub use client::{FileIpamClient, IpamClient};
pub use tree::{Block, BlockStatus, BlockType, Container, ContainerTree, FreeBlock};

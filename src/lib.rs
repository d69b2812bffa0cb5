// cargo watch -x 'fmt' -x 'test'

//! VPC topology engine.
//!
//! Keeps a hierarchical CIDR tree, replicates a VPC's subnet layout into new
//! availability zones and converges VPC routing, one locked task at a time.

pub mod cloud;
pub mod config;
pub mod error;
pub mod ipam;
pub mod lock;
pub mod models;
pub mod output;
pub mod persist;
pub mod store;
pub mod tasks;
#[cfg(any(test, feature = "testmocks"))]
pub mod testmocks;

pub use error::{Error, Result};

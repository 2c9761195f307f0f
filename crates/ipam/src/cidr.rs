/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CidrError {
    #[error("invalid CIDR {0:?}: {1}")]
    Parse(String, String),

    #[error("prefix length {0} out of range for {1:?}")]
    BadPrefixLength(u8, AddressFamily),

    #[error("cannot split a /{0} prefix any further")]
    TooNarrow(u8),

    #[error("address family mismatch between {0} and {1}")]
    FamilyMismatch(AddressFamily, AddressFamily),

    #[error("offset {0} is outside of {1}")]
    OffsetOutOfRange(u128, Cidr),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// A contiguous IPv4 or IPv6 address range, represented internally the way
/// spec.md's data model demands: a base address and prefix length, with the
/// address bits past the prefix required to be zero. This mirrors
/// `carbide_network::ip::prefix::IpPrefix`, generalized with the iteration
/// and offset operations the allocator needs that a plain aggregation
/// data-structure does not.
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Cidr {
    V4(Ipv4Net),
    V6(Ipv6Net),
}

impl Cidr {
    pub fn parse(s: &str) -> Result<Self, CidrError> {
        s.parse()
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            Cidr::V4(_) => AddressFamily::V4,
            Cidr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            Cidr::V4(n) => n.prefix_len(),
            Cidr::V6(n) => n.prefix_len(),
        }
    }

    fn max_prefix_len(&self) -> u8 {
        match self {
            Cidr::V4(_) => 32,
            Cidr::V6(_) => 128,
        }
    }

    /// The number of addresses covered, as a `u128` so both families share a
    /// type (a /0 IPv6 network does not fit in a u64).
    pub fn size(&self) -> u128 {
        1u128 << (self.max_prefix_len() - self.prefix_len())
    }

    /// A single-address (`/32` or `/128`) CIDR for `ip`, matching `self`'s
    /// address family.
    pub fn host_route(ip: IpAddr) -> Cidr {
        match ip {
            IpAddr::V4(a) => Cidr::V4(Ipv4Net::new(a, 32).unwrap()),
            IpAddr::V6(a) => Cidr::V6(Ipv6Net::new(a, 128).unwrap()),
        }
    }

    pub fn network_address(&self) -> IpAddr {
        match self {
            Cidr::V4(n) => IpAddr::V4(n.network()),
            Cidr::V6(n) => IpAddr::V6(n.network()),
        }
    }

    fn base_bits(&self) -> u128 {
        match self {
            Cidr::V4(n) => n.network().to_bits() as u128,
            Cidr::V6(n) => n.network().to_bits(),
        }
    }

    /// Whether `self` fully covers `other`. Two CIDRs of this shape never
    /// partially overlap, so containment also answers the overlap question
    /// for prefixes of differing length.
    pub fn contains(&self, other: &Cidr) -> bool {
        match (self, other) {
            (Cidr::V4(a), Cidr::V4(b)) => a.contains(b),
            (Cidr::V6(a), Cidr::V6(b)) => a.contains(b),
            _ => false,
        }
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Split this CIDR into its two equal halves at prefix length `p + 1`.
    /// Fails on a host route (`/32` or `/128`).
    pub fn split(&self) -> Result<(Cidr, Cidr), CidrError> {
        let max = self.max_prefix_len();
        if self.prefix_len() >= max {
            return Err(CidrError::TooNarrow(self.prefix_len()));
        }
        match self {
            Cidr::V4(n) => {
                let base = n.network().to_bits();
                let new_len = n.prefix_len() + 1;
                let flip = 0x8000_0000u32 >> n.prefix_len();
                let even = Ipv4Net::new(Ipv4Addr::from_bits(base), new_len).unwrap();
                let odd = Ipv4Net::new(Ipv4Addr::from_bits(base | flip), new_len).unwrap();
                Ok((Cidr::V4(even), Cidr::V4(odd)))
            }
            Cidr::V6(n) => {
                let base = n.network().to_bits();
                let new_len = n.prefix_len() + 1;
                let flip = 0x8000_0000_0000_0000_0000_0000_0000_0000u128 >> n.prefix_len();
                let even = Ipv6Net::new(Ipv6Addr::from_bits(base), new_len).unwrap();
                let odd = Ipv6Net::new(Ipv6Addr::from_bits(base | flip), new_len).unwrap();
                Ok((Cidr::V6(even), Cidr::V6(odd)))
            }
        }
    }

    /// The sibling CIDR that `split()`'s parent would also have produced,
    /// i.e. the other half of this CIDR's immediate supernet. `None` for a
    /// `/0`, which has no supernet.
    pub fn sibling(&self) -> Option<Cidr> {
        let len = self.prefix_len();
        if len == 0 {
            return None;
        }
        let shift = self.max_prefix_len() - len;
        match self {
            Cidr::V4(n) => {
                let bits = n.network().to_bits() ^ (1u32 << shift);
                Some(Cidr::V4(Ipv4Net::new(Ipv4Addr::from_bits(bits), len).unwrap()))
            }
            Cidr::V6(n) => {
                let bits = n.network().to_bits() ^ (1u128 << shift);
                Some(Cidr::V6(Ipv6Net::new(Ipv6Addr::from_bits(bits), len).unwrap()))
            }
        }
    }

    /// Attempt to merge `self` and `other` into a single covering CIDR: one
    /// contains the other, or they are siblings under a common supernet.
    pub fn try_aggregate(&self, other: &Cidr) -> Option<Cidr> {
        if self.contains(other) {
            return Some(*self);
        }
        if other.contains(self) {
            return Some(*other);
        }
        if self.family() != other.family() || self.prefix_len() != other.prefix_len() {
            return None;
        }
        let sibling = self.sibling()?;
        if sibling == *other {
            let mut supernet = *self;
            supernet.set_prefix_len(self.prefix_len() - 1);
            Some(supernet)
        } else {
            None
        }
    }

    fn set_prefix_len(&mut self, len: u8) {
        *self = match self {
            Cidr::V4(n) => Cidr::V4(Ipv4Net::new(n.network(), len).unwrap()),
            Cidr::V6(n) => Cidr::V6(Ipv6Net::new(n.network(), len).unwrap()),
        };
    }

    /// The ordered sequence of child CIDRs of prefix length `child_len`
    /// contained within this CIDR.
    pub fn iterate_children(&self, child_len: u8) -> Result<Vec<Cidr>, CidrError> {
        if child_len < self.prefix_len() || child_len > self.max_prefix_len() {
            return Err(CidrError::BadPrefixLength(child_len, self.family()));
        }
        let count = 1u128 << (child_len - self.prefix_len());
        let child_size = 1u128 << (self.max_prefix_len() - child_len);
        let base = self.base_bits();
        let mut out = Vec::with_capacity(count as usize);
        for i in 0..count {
            let addr_bits = base + i * child_size;
            out.push(match self {
                Cidr::V4(_) => Cidr::V4(
                    Ipv4Net::new(Ipv4Addr::from_bits(addr_bits as u32), child_len).unwrap(),
                ),
                Cidr::V6(_) => {
                    Cidr::V6(Ipv6Net::new(Ipv6Addr::from_bits(addr_bits), child_len).unwrap())
                }
            });
        }
        Ok(out)
    }

    /// The zero-based offset of `ip` within this CIDR.
    pub fn ip_to_offset(&self, ip: IpAddr) -> Result<u128, CidrError> {
        let ip_bits = match (self, ip) {
            (Cidr::V4(_), IpAddr::V4(a)) => a.to_bits() as u128,
            (Cidr::V6(_), IpAddr::V6(a)) => a.to_bits(),
            _ => {
                let fam = match ip {
                    IpAddr::V4(_) => AddressFamily::V4,
                    IpAddr::V6(_) => AddressFamily::V6,
                };
                return Err(CidrError::FamilyMismatch(self.family(), fam));
            }
        };
        let base = self.base_bits();
        if ip_bits < base || ip_bits - base >= self.size() {
            return Err(CidrError::OffsetOutOfRange(ip_bits.wrapping_sub(base), *self));
        }
        Ok(ip_bits - base)
    }

    pub fn offset_to_ip(&self, offset: u128) -> Result<IpAddr, CidrError> {
        if offset >= self.size() {
            return Err(CidrError::OffsetOutOfRange(offset, *self));
        }
        let bits = self.base_bits() + offset;
        Ok(match self {
            Cidr::V4(_) => IpAddr::V4(Ipv4Addr::from_bits(bits as u32)),
            Cidr::V6(_) => IpAddr::V6(Ipv6Addr::from_bits(bits)),
        })
    }
}

/// Given an iterator of CIDRs, merge adjacent/nested ranges into the minimal
/// set of covering CIDRs. Ported from the sibling-aggregation trick in
/// `carbide_network::ip::ipset::IpSet`.
pub fn aggregate(cidrs: impl IntoIterator<Item = Cidr>) -> Vec<Cidr> {
    let mut set: BTreeSet<Cidr> = BTreeSet::new();
    for cidr in cidrs {
        add_to_set(&mut set, cidr);
    }
    set.into_iter().collect()
}

fn contains_in_set(set: &BTreeSet<Cidr>, cidr: &Cidr) -> Option<Cidr> {
    set.range(..=*cidr)
        .next_back()
        .and_then(|c| c.contains(cidr).then_some(*c))
}

fn add_to_set(set: &mut BTreeSet<Cidr>, cidr: Cidr) {
    if contains_in_set(set, &cidr).is_some() {
        return;
    }
    // Drop any narrower entries this cidr now subsumes.
    let subsumed: Vec<Cidr> = set.iter().filter(|c| cidr.contains(c)).copied().collect();
    for s in subsumed {
        set.remove(&s);
    }
    let mut cidr = cidr;
    while let Some(sibling) = cidr.sibling() {
        if set.remove(&sibling) {
            cidr = cidr.try_aggregate(&sibling).expect("siblings always aggregate");
        } else {
            break;
        }
    }
    set.insert(cidr);
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(net) = Ipv4Net::from_str(s) {
            if net.addr() != net.network() {
                return Err(CidrError::Parse(
                    s.to_string(),
                    "host bits set past the prefix length".to_string(),
                ));
            }
            return Ok(Cidr::V4(net));
        }
        if let Ok(net) = Ipv6Net::from_str(s) {
            if net.addr() != net.network() {
                return Err(CidrError::Parse(
                    s.to_string(),
                    "host bits set past the prefix length".to_string(),
                ));
            }
            return Ok(Cidr::V6(net));
        }
        Err(CidrError::Parse(s.to_string(), "not a valid CIDR".to_string()))
    }
}

impl TryFrom<String> for Cidr {
    type Error = CidrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

impl Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cidr::V4(n) => write!(f, "{n}"),
            Cidr::V6(n) => write!(f, "{n}"),
        }
    }
}

impl fmt::Debug for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Ord for Cidr {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Cidr::V4(_), Cidr::V6(_)) => Ordering::Less,
            (Cidr::V6(_), Cidr::V4(_)) => Ordering::Greater,
            (Cidr::V4(a), Cidr::V4(b)) => a
                .network()
                .cmp(&b.network())
                .then(a.prefix_len().cmp(&b.prefix_len())),
            (Cidr::V6(a), Cidr::V6(b)) => a
                .network()
                .cmp(&b.network())
                .then(a.prefix_len().cmp(&b.prefix_len())),
        }
    }
}

impl PartialOrd for Cidr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

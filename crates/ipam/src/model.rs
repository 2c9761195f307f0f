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
use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::cidr::Cidr;

/// Tenant/segment scoping tag. An empty string is the wildcard: it matches
/// any segment when reused, and is never itself a "real" segment a caller
/// asked for.
pub const WILDCARD_SEGMENT: &str = "";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub ip: IpAddr,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A single fixed-size allocation unit carved from a leaf group's address
/// space. Pinned to one `(tenant, segment)` for its lifetime, per spec.md
/// section 4.4 — reuse re-tags it, carving never does.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub cidr: Cidr,
    pub owner_host: String,
    pub tenant: String,
    pub segment: String,
    pub bitmap: Bitmap,
    /// Bits of `bitmap` set because a blackout covers that offset, rather
    /// than because an endpoint holds it. Always a subset of `bitmap`'s set
    /// bits; kept so the owner/endpoint index can tell the two reasons a
    /// bit is unavailable apart instead of expecting one reverse-index
    /// entry per set bit regardless of cause.
    #[serde(default)]
    pub masked: Bitmap,
    pub revision: u64,
}

impl Block {
    pub fn new(cidr: Cidr, owner_host: String, tenant: String, segment: String) -> Self {
        let bits = cidr.size();
        Self {
            cidr,
            owner_host,
            tenant,
            segment,
            bitmap: Bitmap::new(bits as usize),
            masked: Bitmap::new(bits as usize),
            revision: 0,
        }
    }

    pub fn matches(&self, tenant: &str, segment: &str) -> bool {
        self.tenant == tenant && self.segment == segment
    }

    pub fn is_reusable(&self) -> bool {
        self.bitmap.is_reusable()
    }

    pub fn re_tag(&mut self, tenant: String, segment: String) {
        self.tenant = tenant;
        self.segment = segment;
        self.revision += 1;
    }

    pub fn allocated_ip_count(&self) -> usize {
        self.bitmap.count_ones()
    }

    /// Bits held by a live endpoint, excluding bits a blackout has masked.
    /// This is what the owner/endpoint index's invariant check compares
    /// against the number of reverse-index entries pointing into this
    /// block; `allocated_ip_count` is the wire-facing "how full is this
    /// block" figure and intentionally still counts masked bits too.
    pub fn endpoint_bit_count(&self) -> usize {
        self.bitmap.count_ones() - self.masked.count_ones()
    }
}

/// A node in a network's topology tree, stored in a flat per-network arena
/// and referenced by index rather than by owned pointer, so the tree can be
/// walked top-down (resolution) and bottom-up (invalidation) without
/// introducing ownership cycles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupNode {
    pub name: Option<String>,
    /// The CIDR(s) resolved for this group. More than one only when this
    /// group absorbed a non-power-of-two remainder that could not be
    /// expressed as a single covering CIDR (see DESIGN.md).
    pub cidrs: Vec<Cidr>,
    pub assignment: BTreeMap<String, String>,
    pub parent: Option<usize>,
    /// Indices of child groups. Empty means this is a leaf.
    pub children: Vec<usize>,
    /// Host names placed in this leaf, in insertion order. Always empty on
    /// an internal node.
    pub hosts: Vec<String>,
    /// Reusable block pool, in carve order. Always empty on an internal
    /// node.
    pub blocks: Vec<Block>,
}

impl GroupNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether `tags` satisfies this group's assignment selector: every key
    /// in `assignment` must be present in `tags` with an equal value. An
    /// empty assignment matches everything.
    pub fn accepts(&self, tags: &BTreeMap<String, String>) -> bool {
        self.assignment
            .iter()
            .all(|(k, v)| tags.get(k).is_some_and(|tv| tv == v))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    pub cidr: Cidr,
    pub block_mask: u8,
    /// Allowed tenants. Empty means wildcard: any tenant may allocate here.
    pub tenants: Vec<String>,
    /// Arena of topology nodes; index 0 is always the root.
    pub groups: Vec<GroupNode>,
    /// Blackout CIDRs registered directly on this network.
    pub blackouts: Vec<Cidr>,
}

impl Network {
    pub fn is_wildcard(&self) -> bool {
        self.tenants.is_empty()
    }

    pub fn accepts_tenant(&self, tenant: &str) -> bool {
        self.is_wildcard() || self.tenants.iter().any(|t| t == tenant)
    }

    pub fn root(&self) -> &GroupNode {
        &self.groups[0]
    }
}

/// A live allocation: who asked for it (`owner_token`), what address they
/// got, and where that address lives so deallocation is O(1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub owner_token: String,
    pub ip: IpAddr,
    pub network: String,
    pub group_index: usize,
    pub block_index: usize,
    pub offset: usize,
    pub host: String,
    pub tenant: String,
    pub segment: String,
}

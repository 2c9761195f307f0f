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

use crate::cidr::{aggregate, Cidr};
use crate::error::{IpamError, IpamResult};
use crate::model::{GroupNode, Host, Network};

/// Wire shape for `UpdateTopology`, mirroring spec.md section 6 exactly:
/// an ordered list of network definitions, and an ordered list of topology
/// definitions that apply a shared group/host tree shape across one or more
/// of those networks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TopologyUpdateRequest {
    pub networks: Vec<NetworkDefinition>,
    pub topologies: Vec<TopologyDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkDefinition {
    pub name: String,
    pub cidr: String,
    /// Omit to fall back to the instance's configured default block mask;
    /// a network with neither is rejected as `Invalid`.
    #[serde(default)]
    pub block_mask: Option<u8>,
    #[serde(default)]
    pub tenants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyDefinition {
    pub networks: Vec<String>,
    pub map: Vec<GroupOrHost>,
}

/// A node of the declarative group tree. `groups` and `hosts` are mutually
/// exclusive in a well-formed request (an internal node subdivides further;
/// a leaf terminates in hosts), matching the leaf/internal split spec.md's
/// data model requires of the resolved `Group`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GroupOrHost {
    pub name: Option<String>,
    /// An explicit CIDR for this node. When given, this node (and every
    /// sibling at the same level) is exempted from automatic bisection; see
    /// DESIGN.md for the scope of this escape hatch.
    pub cidr: Option<String>,
    #[serde(default)]
    pub assignment: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: Vec<GroupOrHost>,
    #[serde(default)]
    pub hosts: Vec<HostStub>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostStub {
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A host that was declared directly under a leaf in the topology map,
/// rather than placed later by tag match through `AddHost`.
pub struct SeededHost {
    pub host: Host,
    pub group_index: usize,
}

/// Resolve one network's definition against one topology definition's
/// group/host map, producing a fully-populated [`Network`] (root at index
/// 0) plus the hosts declared inline in the map.
#[tracing::instrument(skip(def, topo), fields(network = %def.name))]
pub fn resolve_network(
    def: &NetworkDefinition,
    topo: &TopologyDefinition,
    block_mask: u8,
) -> IpamResult<(Network, Vec<SeededHost>)> {
    let base = Cidr::parse(&def.cidr)?;
    let max_len = match base {
        Cidr::V4(_) => 32,
        Cidr::V6(_) => 128,
    };

    let mut groups = vec![GroupNode {
        name: None,
        cidrs: vec![base],
        assignment: BTreeMap::new(),
        parent: None,
        children: Vec::new(),
        hosts: Vec::new(),
        blocks: Vec::new(),
    }];
    let mut seeded = Vec::new();
    resolve_children(&mut groups, 0, &topo.map, max_len, &mut seeded)?;

    for group in &groups {
        if group.is_leaf() {
            for cidr in &group.cidrs {
                if cidr.prefix_len() > block_mask {
                    return Err(IpamError::invalid(format!(
                        "block mask /{block_mask} is coarser than leaf {cidr}"
                    )));
                }
            }
        }
    }

    tracing::debug!(groups = groups.len(), seeded_hosts = seeded.len(), "resolved network topology");

    Ok((
        Network {
            name: def.name.clone(),
            cidr: base,
            block_mask,
            tenants: def.tenants.clone(),
            groups,
            blackouts: Vec::new(),
        },
        seeded,
    ))
}

fn push_group(
    groups: &mut Vec<GroupNode>,
    name: Option<String>,
    cidrs: Vec<Cidr>,
    assignment: BTreeMap<String, String>,
    parent: usize,
) -> usize {
    let idx = groups.len();
    groups.push(GroupNode {
        name,
        cidrs,
        assignment,
        parent: Some(parent),
        children: Vec::new(),
        hosts: Vec::new(),
        blocks: Vec::new(),
    });
    groups[parent].children.push(idx);
    idx
}

fn resolve_children(
    groups: &mut Vec<GroupNode>,
    parent_idx: usize,
    defs: &[GroupOrHost],
    max_len: u8,
    seeded: &mut Vec<SeededHost>,
) -> IpamResult<()> {
    if defs.is_empty() {
        return Ok(());
    }

    let has_explicit = defs.iter().any(|d| d.cidr.is_some());
    let all_explicit = defs.iter().all(|d| d.cidr.is_some());
    if has_explicit && !all_explicit {
        return Err(IpamError::invalid(
            "cannot mix explicit and auto-derived CIDRs among sibling topology entries",
        ));
    }

    let parent_cidrs = groups[parent_idx].cidrs.clone();
    let child_cidr_lists: Vec<Vec<Cidr>> = if all_explicit {
        let mut lists = Vec::with_capacity(defs.len());
        for d in defs {
            let c = Cidr::parse(d.cidr.as_deref().unwrap())?;
            if !parent_cidrs.iter().any(|p| p.contains(&c)) {
                return Err(IpamError::invalid(format!(
                    "explicit CIDR {c} is not contained within its parent group"
                )));
            }
            lists.push(vec![c]);
        }
        for i in 0..lists.len() {
            for j in (i + 1)..lists.len() {
                if lists[i][0].overlaps(&lists[j][0]) {
                    return Err(IpamError::invalid(format!(
                        "sibling CIDRs {} and {} overlap",
                        lists[i][0], lists[j][0]
                    )));
                }
            }
        }
        lists
    } else {
        if parent_cidrs.len() != 1 {
            return Err(IpamError::invalid(
                "cannot further subdivide a group that absorbed a non-power-of-two remainder",
            ));
        }
        let working = parent_cidrs[0];
        let k = defs.len() as u32;
        let bits = k.next_power_of_two().trailing_zeros() as u8;
        let new_len = working.prefix_len() + bits;
        if new_len > max_len {
            return Err(IpamError::invalid(
                "topology requires a prefix longer than the address family allows",
            ));
        }
        let slices = working.iterate_children(new_len)?;
        let mut lists: Vec<Vec<Cidr>> = slices[..defs.len() - 1].iter().map(|c| vec![*c]).collect();
        let remainder = &slices[defs.len() - 1..];
        let merged = aggregate(remainder.iter().copied());
        lists.push(merged);
        lists
    };

    for (def, cidrs) in defs.iter().zip(child_cidr_lists.into_iter()) {
        if cidrs.len() > 1 && !def.groups.is_empty() {
            return Err(IpamError::invalid(
                "a group that absorbed a non-power-of-two remainder cannot have nested groups",
            ));
        }
        let idx = push_group(
            groups,
            def.name.clone(),
            cidrs,
            def.assignment.clone(),
            parent_idx,
        );
        if !def.groups.is_empty() {
            resolve_children(groups, idx, &def.groups, max_len, seeded)?;
        } else {
            for stub in &def.hosts {
                let ip: IpAddr = stub
                    .ip
                    .parse()
                    .map_err(|_| IpamError::invalid(format!("invalid host IP {:?}", stub.ip)))?;
                groups[idx].hosts.push(stub.name.clone());
                seeded.push(SeededHost {
                    host: Host {
                        name: stub.name.clone(),
                        ip,
                        tags: stub.tags.clone(),
                    },
                    group_index: idx,
                });
            }
        }
    }
    Ok(())
}

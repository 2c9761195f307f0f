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
//! The whole of an IPAM instance's mutable state, plus the operations that
//! aren't squarely block-pool or host-registry concerns: topology updates
//! and the invariant checks run after every mutation in tests and after
//! every snapshot load in production.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{IpamError, IpamResult};
use crate::hosts::find_leaf_for_tags;
use crate::index::EndpointIndex;
use crate::model::{GroupNode, Host, Network};
use crate::topology::{self, TopologyUpdateRequest};

/// Which networks share one topology's group/host tree shape. The tree
/// itself isn't duplicated here: since every network listed shares identical
/// arena indices (only the base CIDR differs per network), a host's leaf
/// placement computed against any one of them applies to all of them.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyBinding {
    pub networks: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IpamState {
    pub networks: Vec<Network>,
    pub hosts: Vec<Host>,
    /// host name -> every (network, leaf index) it was placed into.
    pub placements: BTreeMap<String, Vec<(String, usize)>>,
    pub endpoints: EndpointIndex,
    pub topology_bindings: Vec<TopologyBinding>,
    /// The last request `update_topology` was given, kept only so a
    /// byte-for-byte repeat of the same call is a true no-op (spec.md
    /// section 4.2).
    pub last_update: Option<TopologyUpdateRequest>,
}

impl IpamState {
    pub fn network(&self, name: &str) -> Option<&Network> {
        self.networks.iter().find(|n| n.name == name)
    }

    pub fn network_mut(&mut self, name: &str) -> Option<&mut Network> {
        self.networks.iter_mut().find(|n| n.name == name)
    }

    #[tracing::instrument(skip(self, request))]
    pub fn update_topology(
        &mut self,
        request: TopologyUpdateRequest,
        default_block_mask: Option<u8>,
    ) -> IpamResult<()> {
        if self.last_update.as_ref() == Some(&request) {
            tracing::debug!("topology update request is identical to the last one; no-op");
            return Ok(());
        }

        let mut resolved: Vec<(Network, Vec<topology::SeededHost>)> = Vec::new();
        for topo in &request.topologies {
            for net_name in &topo.networks {
                let net_def = request
                    .networks
                    .iter()
                    .find(|n| &n.name == net_name)
                    .ok_or_else(|| {
                        IpamError::invalid(format!("topology references unknown network {net_name}"))
                    })?;
                let block_mask = net_def.block_mask.or(default_block_mask).ok_or_else(|| {
                    IpamError::invalid(format!(
                        "network {net_name} has no block mask and no default is configured"
                    ))
                })?;
                resolved.push(topology::resolve_network(net_def, topo, block_mask)?);
            }
        }

        // Fail closed on any network whose shape changed while it still
        // holds live endpoints: we refuse to orphan them (spec.md section 9,
        // open question on UpdateTopology/live-endpoint interaction).
        for (new_net, _) in &resolved {
            if let Some(old_net) = self.network(&new_net.name) {
                if !same_shape(old_net, new_net)
                    && old_net
                        .groups
                        .iter()
                        .flat_map(|g| &g.blocks)
                        .any(|b| b.endpoint_bit_count() > 0)
                {
                    return Err(IpamError::conflict(format!(
                        "network {} changed shape but still has live endpoints",
                        new_net.name
                    )));
                }
            }
        }

        let mut committed = self.networks.clone();
        for (new_net, _) in &resolved {
            let keep_live_state = self
                .network(&new_net.name)
                .is_some_and(|old| same_shape(old, new_net));
            let mut new_net = new_net.clone();
            if keep_live_state {
                let old_net = self.network(&new_net.name).unwrap();
                new_net.blackouts = old_net.blackouts.clone();
                for (i, g) in new_net.groups.iter_mut().enumerate() {
                    g.blocks = old_net.groups[i].blocks.clone();
                    g.hosts = old_net.groups[i].hosts.clone();
                }
            }
            match committed.iter_mut().find(|n| n.name == new_net.name) {
                Some(slot) => *slot = new_net,
                None => committed.push(new_net),
            }
        }
        self.networks = committed;

        for (new_net, seeded) in resolved {
            // `register_host` is idempotent for a name it already knows
            // about (it only adds the placement if missing), so this is
            // safe to repeat even for a network whose live state we just
            // carried over unchanged.
            for sh in seeded {
                self.register_host(sh.host, vec![(new_net.name.clone(), sh.group_index)])?;
            }
        }

        self.topology_bindings = request
            .topologies
            .iter()
            .map(|t| TopologyBinding { networks: t.networks.clone() })
            .collect();
        self.last_update = Some(request);
        Ok(())
    }

    fn register_host(&mut self, host: Host, placements: Vec<(String, usize)>) -> IpamResult<()> {
        if let Some(existing) = self.hosts.iter().find(|h| h.name == host.name) {
            if existing.ip != host.ip || existing.tags != host.tags {
                return Err(IpamError::conflict(format!(
                    "host {} already exists with a different definition",
                    host.name
                )));
            }
            let entry = self.placements.entry(host.name.clone()).or_default();
            for p in placements {
                if !entry.contains(&p) {
                    entry.push(p);
                }
            }
            return Ok(());
        }
        for (net_name, idx) in &placements {
            let hosts = &mut self.network_mut(net_name).unwrap().groups[*idx].hosts;
            if !hosts.contains(&host.name) {
                hosts.push(host.name.clone());
            }
        }
        self.placements.insert(host.name.clone(), placements);
        self.hosts.push(host);
        Ok(())
    }

    #[tracing::instrument(skip(self, host), fields(host = %host.name))]
    pub fn add_host(&mut self, host: Host) -> IpamResult<()> {
        if host.name.is_empty() {
            return Err(IpamError::invalid("host name must not be empty"));
        }
        if self.hosts.iter().any(|h| h.name == host.name) {
            return Err(IpamError::conflict(format!("host {} already exists", host.name)));
        }

        for binding in &self.topology_bindings {
            let Some(reference_name) = binding.networks.first() else { continue };
            let Some(reference) = self.network(reference_name) else { continue };
            if let Some(leaf_idx) = find_leaf_for_tags(reference, &host.tags) {
                let placements = binding.networks.iter().map(|n| (n.clone(), leaf_idx)).collect();
                tracing::info!(leaf = leaf_idx, "host placed by tag match");
                return self.register_host(host, placements);
            }
        }
        Err(IpamError::conflict(format!(
            "no leaf group's assignment selector accepts host {}",
            host.name
        )))
    }

    #[tracing::instrument(skip(self))]
    pub fn remove_host(&mut self, name: &str) -> IpamResult<()> {
        let placements = self
            .placements
            .get(name)
            .cloned()
            .ok_or_else(|| IpamError::not_found(format!("host {name} not found")))?;
        for (net_name, idx) in &placements {
            let net = self.network(net_name).ok_or_else(|| {
                IpamError::internal(format!("host {name} placed in unknown network {net_name}"))
            })?;
            if net.groups[*idx]
                .blocks
                .iter()
                .any(|b| b.owner_host == name && b.endpoint_bit_count() > 0)
            {
                return Err(IpamError::conflict(format!(
                    "host {name} still owns a block with live allocations"
                )));
            }
        }
        for (net_name, idx) in &placements {
            self.network_mut(net_name).unwrap().groups[*idx].hosts.retain(|h| h != name);
        }
        self.placements.remove(name);
        self.hosts.retain(|h| h.name != name);
        Ok(())
    }

    /// Cross-checks beyond what [`EndpointIndex::check_invariant`] already
    /// does: sibling groups never overlap, and a child's CIDR(s) are always
    /// contained within its parent's.
    pub fn check_invariants(&self) -> IpamResult<()> {
        self.endpoints.check_invariant(&self.networks)?;
        for network in &self.networks {
            check_group_tree(&network.groups, 0)?;
        }
        Ok(())
    }
}

fn group_shape(g: &GroupNode) -> (&Option<String>, &Vec<crate::cidr::Cidr>, &BTreeMap<String, String>, Option<usize>, &Vec<usize>) {
    (&g.name, &g.cidrs, &g.assignment, g.parent, &g.children)
}

/// Whether two resolutions of the same network name describe the same tree:
/// same base CIDR, same block mask, and structurally identical groups
/// (ignoring the mutable `blocks`/`hosts` payload each group carries).
fn same_shape(a: &Network, b: &Network) -> bool {
    a.cidr == b.cidr
        && a.block_mask == b.block_mask
        && a.groups.len() == b.groups.len()
        && a.groups.iter().zip(b.groups.iter()).all(|(x, y)| group_shape(x) == group_shape(y))
}

fn check_group_tree(groups: &[GroupNode], idx: usize) -> IpamResult<()> {
    let node = &groups[idx];
    for i in 0..node.children.len() {
        for j in (i + 1)..node.children.len() {
            let a = &groups[node.children[i]];
            let b = &groups[node.children[j]];
            for ca in &a.cidrs {
                for cb in &b.cidrs {
                    if ca.overlaps(cb) {
                        return Err(IpamError::internal(format!("sibling groups overlap: {ca} and {cb}")));
                    }
                }
            }
        }
    }
    for &child in &node.children {
        for c in &groups[child].cidrs {
            if !node.cidrs.iter().any(|p| p.contains(c)) {
                return Err(IpamError::internal(format!(
                    "child CIDR {c} is not contained within its parent group"
                )));
            }
        }
        check_group_tree(groups, child)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{GroupOrHost, NetworkDefinition, TopologyDefinition};
    use std::collections::BTreeMap as Map;

    fn net_def(name: &str, cidr: &str) -> NetworkDefinition {
        NetworkDefinition { name: name.to_string(), cidr: cidr.to_string(), block_mask: Some(30), tenants: Vec::new() }
    }

    fn simple_request() -> TopologyUpdateRequest {
        TopologyUpdateRequest {
            networks: vec![net_def("net1", "10.0.0.0/24")],
            topologies: vec![TopologyDefinition {
                networks: vec!["net1".to_string()],
                map: vec![
                    GroupOrHost { name: Some("a".into()), assignment: Map::from([("tier".to_string(), "a".to_string())]), ..Default::default() },
                    GroupOrHost { name: Some("b".into()), assignment: Map::from([("tier".to_string(), "b".to_string())]), ..Default::default() },
                ],
            }],
        }
    }

    #[test]
    fn repeated_identical_update_is_a_no_op() {
        let mut state = IpamState::default();
        state.update_topology(simple_request(), None).unwrap();
        let snapshot = state.networks.clone();
        state.update_topology(simple_request(), None).unwrap();
        assert_eq!(state.networks.len(), snapshot.len());
    }

    #[test]
    fn add_host_places_by_tag_match() {
        let mut state = IpamState::default();
        state.update_topology(simple_request(), None).unwrap();
        state
            .add_host(Host {
                name: "h1".into(),
                ip: "10.0.0.1".parse().unwrap(),
                tags: Map::from([("tier".to_string(), "b".to_string())]),
            })
            .unwrap();
        assert_eq!(state.placements.get("h1").unwrap(), &vec![("net1".to_string(), 2)]);
    }

    #[test]
    fn reshape_with_live_endpoints_is_rejected() {
        let mut state = IpamState::default();
        state.update_topology(simple_request(), None).unwrap();
        state.networks[0].groups[1].blocks.push(crate::model::Block::new(
            crate::cidr::Cidr::parse("10.0.0.0/30").unwrap(),
            "h1".into(),
            "tenant".into(),
            "seg".into(),
        ));
        state.networks[0].groups[1].blocks[0].bitmap.set(0);

        let mut reshaped = simple_request();
        reshaped.topologies[0].map.push(GroupOrHost {
            name: Some("c".into()),
            assignment: Map::from([("tier".to_string(), "c".to_string())]),
            ..Default::default()
        });
        state.update_topology(reshaped, None).expect_err("shape change with a live endpoint must be rejected");
    }
}

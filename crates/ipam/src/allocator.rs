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
//! `AllocateIP`, `DeallocateIP`, and the blackout list, per spec.md
//! sections 4.5 and 4.6. These sit a layer above [`crate::block_pool`]:
//! that module decides *which block* serves a request, this module decides
//! *which network and leaf* to hand the block pool in the first place, and
//! owns the reverse index and blackout bookkeeping around it.
use std::net::IpAddr;

use serde::Serialize;

use crate::block_pool::{self, Selection};
use crate::cidr::Cidr;
use crate::error::{IpamError, IpamResult};
use crate::model::EndpointRecord;
use crate::state::IpamState;

/// A read-only view of one carved block, as returned by `ListAllBlocks`.
#[derive(Debug, Clone, Serialize)]
pub struct BlockSummary {
    pub network: String,
    pub group_name: Option<String>,
    pub cidr: Cidr,
    pub owner_host: String,
    pub tenant: String,
    pub segment: String,
    pub allocated_ip_count: usize,
    pub revision: u64,
}

#[tracing::instrument(skip(state, host_name), fields(token, host = host_name, tenant, segment))]
pub fn allocate(
    state: &mut IpamState,
    token: &str,
    host_name: &str,
    tenant: &str,
    segment: &str,
) -> IpamResult<IpAddr> {
    if token.is_empty() {
        return Err(IpamError::invalid("owner token must not be empty"));
    }

    if let Some(existing) = state.endpoints.get(token) {
        if existing.host == host_name && existing.tenant == tenant && existing.segment == segment {
            tracing::debug!(ip = %existing.ip, "repeat allocation request, returning prior address");
            return Ok(existing.ip);
        }
        return Err(IpamError::conflict(format!(
            "token {token} is already allocated with different parameters"
        )));
    }

    // Most-specific network wins: a network scoped to this tenant beats a
    // wildcard network, ties broken by declaration order.
    let mut candidates: Vec<usize> = state
        .networks
        .iter()
        .enumerate()
        .filter(|(_, n)| n.accepts_tenant(tenant))
        .map(|(i, _)| i)
        .collect();
    candidates.sort_by_key(|&i| (state.networks[i].is_wildcard(), i));
    let net_idx = *candidates
        .first()
        .ok_or_else(|| IpamError::not_found(format!("no network accepts tenant {tenant}")))?;

    let network_name = state.networks[net_idx].name.clone();
    let group_idx = state
        .placements
        .get(host_name)
        .and_then(|ps| ps.iter().find(|(n, _)| n == &network_name).map(|(_, idx)| *idx))
        .ok_or_else(|| {
            IpamError::not_found(format!("host {host_name} is not placed in network {network_name}"))
        })?;

    let block_mask = state.networks[net_idx].block_mask;
    let blackouts = state.networks[net_idx].blackouts.clone();
    let leaf = &mut state.networks[net_idx].groups[group_idx];
    let selection = block_pool::select_block(leaf, block_mask, &blackouts, tenant, segment)?;
    let block_idx = match selection {
        Selection::Existing(i) => i,
        Selection::Carved(i) => {
            leaf.blocks[i].owner_host = host_name.to_string();
            i
        }
    };

    let block = &mut leaf.blocks[block_idx];
    let offset = block.bitmap.first_free().ok_or(IpamError::Exhausted)?;
    block.bitmap.set(offset);
    block.revision += 1;
    let ip = block.cidr.offset_to_ip(offset as u128)?;

    state.endpoints.insert(EndpointRecord {
        owner_token: token.to_string(),
        ip,
        network: network_name,
        group_index: group_idx,
        block_index: block_idx,
        offset,
        host: host_name.to_string(),
        tenant: tenant.to_string(),
        segment: segment.to_string(),
    });
    tracing::info!(%ip, "allocated");
    Ok(ip)
}

#[tracing::instrument(skip(state))]
pub fn deallocate(state: &mut IpamState, token: &str) -> IpamResult<()> {
    let record = state
        .endpoints
        .remove(token)
        .ok_or_else(|| IpamError::not_found(format!("token {token} not found")))?;
    let network = state
        .network_mut(&record.network)
        .ok_or_else(|| IpamError::internal("endpoint references a network that no longer exists"))?;
    let block = &mut network.groups[record.group_index].blocks[record.block_index];
    block.bitmap.clear(record.offset);
    block.revision += 1;
    tracing::info!(ip = %record.ip, "deallocated");
    Ok(())
}

#[tracing::instrument(skip(state))]
pub fn black_out(state: &mut IpamState, cidr_str: &str) -> IpamResult<()> {
    let cidr = Cidr::parse(cidr_str)?;
    let net_idx = state
        .networks
        .iter()
        .position(|n| n.cidr.contains(&cidr))
        .ok_or_else(|| IpamError::not_found(format!("no network contains {cidr}")))?;

    if cidr.contains(&state.networks[net_idx].cidr) {
        return Err(IpamError::invalid("a blackout cannot cover an entire network"));
    }

    let conflicting = state.endpoints.iter().any(|e| {
        e.network == state.networks[net_idx].name && cidr.overlaps(&Cidr::host_route(e.ip))
    });
    if conflicting {
        return Err(IpamError::conflict(format!("blackout {cidr} overlaps a live allocation")));
    }

    let network = &mut state.networks[net_idx];
    if network.blackouts.contains(&cidr) {
        tracing::debug!(%cidr, "blackout already recorded; no-op");
        return Ok(());
    }
    if network.blackouts.iter().any(|b| b.contains(&cidr)) {
        tracing::debug!(%cidr, "blackout already covered by a wider existing blackout; no-op");
        return Ok(());
    }
    // A wider blackout replaces every narrower one it now subsumes.
    network.blackouts.retain(|b| !cidr.contains(b));
    network.blackouts.push(cidr);

    for group in &mut network.groups {
        for block in &mut group.blocks {
            if !block.cidr.overlaps(&cidr) {
                continue;
            }
            for offset in 0..block.bitmap.len() {
                let ip = block.cidr.offset_to_ip(offset as u128)?;
                if cidr.contains(&Cidr::host_route(ip)) {
                    block.bitmap.set(offset);
                    block.masked.set(offset);
                }
            }
            block.revision += 1;
        }
    }
    tracing::info!(%cidr, "blacked out");
    Ok(())
}

#[tracing::instrument(skip(state))]
pub fn un_black_out(state: &mut IpamState, cidr_str: &str) -> IpamResult<()> {
    let cidr = Cidr::parse(cidr_str)?;
    let net_idx = state
        .networks
        .iter()
        .position(|n| n.blackouts.contains(&cidr))
        .ok_or_else(|| IpamError::not_found(format!("no recorded blackout exactly matches {cidr}")))?;

    let network = &mut state.networks[net_idx];
    network.blackouts.retain(|b| *b != cidr);
    let remaining = network.blackouts.clone();

    for group in &mut network.groups {
        for block in &mut group.blocks {
            if !block.cidr.overlaps(&cidr) {
                continue;
            }
            for offset in 0..block.bitmap.len() {
                let ip = block.cidr.offset_to_ip(offset as u128)?;
                let host_route = Cidr::host_route(ip);
                if cidr.contains(&host_route) && !remaining.iter().any(|b| b.contains(&host_route)) {
                    block.bitmap.clear(offset);
                    block.masked.clear(offset);
                }
            }
            block.revision += 1;
        }
    }
    tracing::info!(%cidr, "un-blacked-out");
    Ok(())
}

pub fn list_all_blocks(state: &IpamState) -> Vec<BlockSummary> {
    let mut out = Vec::new();
    for network in &state.networks {
        for group in &network.groups {
            for block in &group.blocks {
                out.push(BlockSummary {
                    network: network.name.clone(),
                    group_name: group.name.clone(),
                    cidr: block.cidr,
                    owner_host: block.owner_host.clone(),
                    tenant: block.tenant.clone(),
                    segment: block.segment.clone(),
                    allocated_ip_count: block.allocated_ip_count(),
                    revision: block.revision,
                });
            }
        }
    }
    out
}

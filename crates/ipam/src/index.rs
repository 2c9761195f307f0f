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
//! The owner-token → endpoint index described in spec.md section 4.7.
//!
//! This is kept as its own small map rather than folded into
//! [`crate::model::Block`] so that deallocation by token is O(1) without
//! blocks needing a back-pointer list of their own live offsets (which
//! would duplicate what the bitmap already tells us).
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{IpamError, IpamResult};
use crate::model::{EndpointRecord, Network};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EndpointIndex {
    by_token: BTreeMap<String, EndpointRecord>,
}

impl EndpointIndex {
    pub fn get(&self, token: &str) -> Option<&EndpointRecord> {
        self.by_token.get(token)
    }

    pub fn insert(&mut self, record: EndpointRecord) {
        self.by_token.insert(record.owner_token.clone(), record);
    }

    pub fn remove(&mut self, token: &str) -> Option<EndpointRecord> {
        self.by_token.remove(token)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointRecord> {
        self.by_token.values()
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    /// Every live (i.e. endpoint-owned, not blackout-masked) bit in every
    /// block's bitmap must have exactly one reverse entry here, and every
    /// entry must point at a set bit. Checked after load and, in tests,
    /// after every operation (spec.md section 4.7).
    pub fn check_invariant(&self, networks: &[Network]) -> IpamResult<()> {
        let mut expected = 0usize;
        for network in networks {
            for group in &network.groups {
                for block in &group.blocks {
                    expected += block.endpoint_bit_count();
                }
            }
        }
        if expected != self.by_token.len() {
            return Err(IpamError::internal(format!(
                "endpoint index has {} entries but blocks carry {} endpoint-owned bits",
                self.by_token.len(),
                expected
            )));
        }
        for record in self.by_token.values() {
            let network = networks
                .iter()
                .find(|n| n.name == record.network)
                .ok_or_else(|| {
                    IpamError::internal(format!(
                        "endpoint {} references unknown network {}",
                        record.owner_token, record.network
                    ))
                })?;
            let group = network.groups.get(record.group_index).ok_or_else(|| {
                IpamError::internal(format!(
                    "endpoint {} references out-of-range group {}",
                    record.owner_token, record.group_index
                ))
            })?;
            let block = group.blocks.get(record.block_index).ok_or_else(|| {
                IpamError::internal(format!(
                    "endpoint {} references out-of-range block {}",
                    record.owner_token, record.block_index
                ))
            })?;
            if record.offset >= block.bitmap.len() {
                return Err(IpamError::internal(format!(
                    "endpoint {} references out-of-range offset {} in a {}-bit block",
                    record.owner_token,
                    record.offset,
                    block.bitmap.len()
                )));
            }
            if !block.bitmap.get(record.offset) {
                return Err(IpamError::internal(format!(
                    "endpoint {} points at offset {} which is not set",
                    record.owner_token, record.offset
                )));
            }
        }
        Ok(())
    }
}

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
//! Per-leaf block allocation: reuse-first, carve-next, exhausted-last, as
//! laid out in spec.md section 4.4.
use crate::cidr::Cidr;
use crate::error::{IpamError, IpamResult};
use crate::model::{Block, GroupNode};

/// The result of selecting a block to allocate from within a leaf: either an
/// existing block (reused as-is, or re-tagged) or a freshly carved one.
pub(crate) enum Selection {
    Existing(usize),
    Carved(usize),
}

/// Find (and carve, if needed) a block in `leaf` suitable for `(tenant,
/// segment)`, applying the three-step policy from spec.md section 4.4:
/// reuse an already-tagged block with a free bit, else re-tag a reusable
/// (all-zero) block, else carve a new one, else fail with `Exhausted`.
pub(crate) fn select_block(
    leaf: &mut GroupNode,
    block_mask: u8,
    blackouts: &[Cidr],
    tenant: &str,
    segment: &str,
) -> IpamResult<Selection> {
    if let Some(idx) = leaf
        .blocks
        .iter()
        .position(|b| b.matches(tenant, segment) && b.bitmap.first_free().is_some())
    {
        return Ok(Selection::Existing(idx));
    }

    if let Some(idx) = leaf.blocks.iter().position(|b| b.is_reusable()) {
        let block = &mut leaf.blocks[idx];
        tracing::debug!(cidr = %block.cidr, tenant, segment, "re-tagging reusable block");
        block.re_tag(tenant.to_string(), segment.to_string());
        return Ok(Selection::Existing(idx));
    }

    loop {
        match carve_next(leaf, block_mask)? {
            Some(cidr) => {
                let mut block = Block::new(cidr, String::new(), tenant.to_string(), segment.to_string());
                mask_blackouts(&mut block, blackouts);
                let has_free = block.bitmap.first_free().is_some();
                leaf.blocks.push(block);
                let idx = leaf.blocks.len() - 1;
                if has_free {
                    tracing::info!(cidr = %leaf.blocks[idx].cidr, tenant, segment, "carved new block");
                    return Ok(Selection::Carved(idx));
                }
                // Entirely blacked out; keep it in the pool (so `carve_next`
                // doesn't re-offer it) and carve the next one instead.
                tracing::debug!(cidr = %leaf.blocks[idx].cidr, "freshly carved block is entirely blacked out, carving past it");
            }
            None => return Err(IpamError::Exhausted),
        }
    }
}

/// The next not-yet-carved `block_mask`-sized CIDR within `leaf`'s address
/// space, in ascending order across `leaf`'s (possibly several, if this
/// group absorbed a non-power-of-two remainder) component CIDRs.
fn carve_next(leaf: &GroupNode, block_mask: u8) -> IpamResult<Option<Cidr>> {
    let already_carved = leaf.blocks.len();
    let mut seen = 0usize;
    for cidr in &leaf.cidrs {
        let candidates = cidr.iterate_children(block_mask)?;
        if already_carved < seen + candidates.len() {
            return Ok(Some(candidates[already_carved - seen]));
        }
        seen += candidates.len();
    }
    Ok(None)
}

/// Pre-mask every offset in `block` that falls under a registered blackout,
/// so those addresses can never be handed out even though the block itself
/// is otherwise usable.
pub(crate) fn mask_blackouts(block: &mut Block, blackouts: &[Cidr]) {
    for blackout in blackouts {
        if !block.cidr.overlaps(blackout) {
            continue;
        }
        for offset in 0..block.bitmap.len() {
            let ip = block.cidr.offset_to_ip(offset as u128).expect("offset within block");
            if blackout.contains(&Cidr::host_route(ip)) {
                block.bitmap.set(offset);
                block.masked.set(offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn leaf(cidrs: Vec<Cidr>) -> GroupNode {
        GroupNode {
            name: None,
            cidrs,
            assignment: BTreeMap::new(),
            parent: Some(0),
            children: Vec::new(),
            hosts: Vec::new(),
            blocks: Vec::new(),
        }
    }

    #[test]
    fn reuse_then_carve_then_exhausted() {
        let mut g = leaf(vec![Cidr::parse("10.0.0.0/29").unwrap()]);
        for _ in 0..2 {
            match select_block(&mut g, 30, &[], "ten1", "seg1").unwrap() {
                Selection::Carved(_) => {}
                Selection::Existing(_) => panic!("expected a fresh carve"),
            }
        }
        assert_eq!(g.blocks.len(), 2);
        let err = select_block(&mut g, 30, &[], "ten1", "seg1").unwrap_err();
        assert!(matches!(err, IpamError::Exhausted));
    }

    #[test]
    fn reusable_block_is_re_tagged_not_carried_over() {
        let mut g = leaf(vec![Cidr::parse("10.0.0.0/30").unwrap()]);
        match select_block(&mut g, 30, &[], "ten1", "seg1").unwrap() {
            Selection::Carved(idx) => {
                g.blocks[idx].bitmap.set(0);
            }
            _ => unreachable!(),
        }
        g.blocks[0].bitmap.clear(0);
        assert!(g.blocks[0].is_reusable());
        match select_block(&mut g, 30, &[], "ten2", "seg2").unwrap() {
            Selection::Existing(idx) => {
                assert_eq!(idx, 0);
                assert_eq!(g.blocks[0].tenant, "ten2");
                assert_eq!(g.blocks[0].segment, "seg2");
            }
            Selection::Carved(_) => panic!("only one block's worth of space exists"),
        }
    }
}

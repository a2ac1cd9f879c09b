//! Cached positional lookups for sequence containers.
//!
//! Positional operations on a linked list are O(N); a small cache of
//! `(item, index)` pairs turns repeated nearby lookups into short
//! walks. Markers are best-effort: they are repaired before deletions,
//! shifted on inserts, and dropped wholesale when a remote transaction
//! restructures the list.

use crate::branch::BranchRef;
use crate::store::StructRef;
use crate::transaction::Transaction;

pub(crate) const MAX_SEARCH_MARKERS: usize = 80;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SearchMarker {
    pub item: StructRef,
    pub index: u32,
    pub timestamp: u64,
}

/// Finds the item covering `index`, preferring the closest cached
/// marker as a starting point. Returns the item and the index of its
/// first content unit, positioned at a merge boundary.
pub(crate) fn find_marker(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    index: u32,
) -> Option<(StructRef, u32)> {
    let start = txn.store.branch(branch).start?;
    if index == 0 || !txn.store.branch(branch).kind.uses_markers() {
        return None;
    }
    let closest = txn
        .store
        .branch(branch)
        .markers
        .iter()
        .enumerate()
        .min_by_key(|(_, m)| (index as i64 - m.index as i64).abs())
        .map(|(i, m)| (i, m.item, m.index));

    let (mut p, mut pindex) = match closest {
        Some((slot, item, idx)) => {
            let tick = txn.store.next_marker_tick();
            txn.store.branch_mut(branch).markers[slot].timestamp = tick;
            (item, idx)
        }
        None => (start, 0),
    };

    // Walk right while the target lies past the current item.
    loop {
        let item = txn.store.blocks.item(p);
        let Some(right) = item.right else { break };
        if pindex >= index {
            break;
        }
        if !item.is_deleted() && item.is_countable() {
            if index < pindex + item.len {
                break;
            }
            pindex += item.len;
        }
        p = right;
    }
    // Walk left when the marker overshot.
    while pindex > index {
        let Some(left) = txn.store.blocks.item(p).left else {
            break;
        };
        p = left;
        let item = txn.store.blocks.item(p);
        if !item.is_deleted() && item.is_countable() {
            pindex -= item.len;
        }
    }
    // Retreat to a merge boundary: a marker on an item that could
    // still merge into its left neighbor would go stale on merge.
    loop {
        let item = txn.store.blocks.item(p);
        let Some(left) = item.left else { break };
        let li = txn.store.blocks.item(left);
        if li.id.client == item.id.client && li.id.clock + li.len == item.id.clock {
            p = left;
            let li = txn.store.blocks.item(p);
            if !li.is_deleted() && li.is_countable() {
                pindex -= li.len;
            }
        } else {
            break;
        }
    }

    let parent_len = txn.store.branch(branch).content_len;
    match closest {
        Some((slot, _, midx))
            if ((midx as i64 - pindex as i64).unsigned_abs() * MAX_SEARCH_MARKERS as u64)
                < parent_len as u64 =>
        {
            // Close enough: move the existing marker instead of
            // spending a cache slot.
            overwrite_marker(txn, branch, slot, p, pindex);
        }
        _ => {
            mark_position(txn, branch, p, pindex);
        }
    }
    Some((p, pindex))
}

fn overwrite_marker(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    slot: usize,
    item: StructRef,
    index: u32,
) {
    let old = txn.store.branch(branch).markers[slot].item;
    txn.store.blocks.item_mut(old).set_marker(false);
    txn.store.blocks.item_mut(item).set_marker(true);
    let tick = txn.store.next_marker_tick();
    let marker = &mut txn.store.branch_mut(branch).markers[slot];
    marker.item = item;
    marker.index = index;
    marker.timestamp = tick;
}

fn mark_position(txn: &mut Transaction<'_>, branch: BranchRef, item: StructRef, index: u32) {
    let tick = txn.store.next_marker_tick();
    if txn.store.branch(branch).markers.len() >= MAX_SEARCH_MARKERS {
        let slot = txn
            .store
            .branch(branch)
            .markers
            .iter()
            .enumerate()
            .min_by_key(|(_, m)| m.timestamp)
            .map(|(i, _)| i)
            .expect("marker cache is full, so non-empty");
        overwrite_marker(txn, branch, slot, item, index);
    } else {
        txn.store.blocks.item_mut(item).set_marker(true);
        txn.store.branch_mut(branch).markers.push(SearchMarker {
            item,
            index,
            timestamp: tick,
        });
    }
}

/// Repairs markers around a positional change at `index`. `len` is
/// positive for inserts and negative for deletions; markers pointing
/// into soon-to-be-deleted or non-countable items are walked left to
/// solid ground or dropped.
pub(crate) fn update_marker_changes(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    index: u32,
    len: i64,
) {
    let mut i = txn.store.branch(branch).markers.len();
    while i > 0 {
        i -= 1;
        let (mut mitem, mut mindex) = {
            let m = &txn.store.branch(branch).markers[i];
            (m.item, m.index)
        };
        if len > 0 {
            txn.store.blocks.item_mut(mitem).set_marker(false);
            let mut p = Some(mitem);
            while let Some(pr) = p {
                let item = txn.store.blocks.item(pr);
                if !item.is_deleted() && item.is_countable() {
                    break;
                }
                let left = item.left;
                p = left;
                if let Some(l) = left {
                    let li = txn.store.blocks.item(l);
                    if !li.is_deleted() && li.is_countable() {
                        mindex -= li.len;
                    }
                }
            }
            match p {
                Some(pr) if !txn.store.blocks.item(pr).is_marker() => {
                    mitem = pr;
                    txn.store.blocks.item_mut(pr).set_marker(true);
                }
                _ => {
                    // Walked off the list or onto an already marked
                    // position.
                    txn.store.branch_mut(branch).markers.remove(i);
                    continue;
                }
            }
        }
        let new_index = if index < mindex || (len > 0 && index == mindex) {
            (mindex as i64 + len).max(index as i64) as u32
        } else {
            mindex
        };
        let marker = &mut txn.store.branch_mut(branch).markers[i];
        marker.item = mitem;
        marker.index = new_index;
    }
}

//! Transactions: mutation batching and the close-time pipeline.
//!
//! Every mutation runs inside a transaction. On close the engine
//! normalizes the transaction's delete set, computes observer events,
//! collapses tombstones, merges adjacent structs, rotates the client
//! id after a collision, and encodes the update for subscribers.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::branch::BranchRef;
use crate::codec::{EncoderV1, EncoderV2, UpdateEncoder};
use crate::delete_set::DeleteSet;
use crate::error::EngineError;
use crate::event::{
    ContainerEvent, DeltaOp, EntryChange, KeyChange, PathSegment, SubdocsEvent, TransactionEvent,
};
use crate::id::StateVector;
use crate::item::{gc_item, try_merge_with_left};
use crate::store::{Slot, Store, StructRef};
use crate::types::chunk_values;
use crate::update::write_update;

/// An open transaction. Holds the document state exclusively; observer
/// dispatch happens after it closes.
pub struct Transaction<'doc> {
    pub(crate) store: &'doc mut Store,
    pub(crate) before_state: StateVector,
    pub(crate) after_state: StateVector,
    pub(crate) delete_set: DeleteSet,
    /// Changed container → set of changed map keys; `None` marks a
    /// sequence change.
    pub(crate) changed: HashMap<BranchRef, HashSet<Option<String>>>,
    /// Split products to re-examine for recombination on close.
    pub(crate) merge_structs: Vec<StructRef>,
    pub(crate) origin: Option<Value>,
    pub(crate) local: bool,
    pub(crate) subdocs_added: Vec<String>,
    pub(crate) subdocs_removed: Vec<String>,
    pub(crate) subdocs_loaded: Vec<String>,
    pub(crate) need_formatting_cleanup: bool,
}

impl<'doc> Transaction<'doc> {
    pub(crate) fn new(store: &'doc mut Store, origin: Option<Value>, local: bool) -> Self {
        let before_state = store.blocks.state_vector();
        Self {
            store,
            before_state,
            after_state: StateVector::new(),
            delete_set: DeleteSet::new(),
            changed: HashMap::new(),
            merge_structs: Vec::new(),
            origin,
            local,
            subdocs_added: Vec::new(),
            subdocs_removed: Vec::new(),
            subdocs_loaded: Vec::new(),
            need_formatting_cleanup: false,
        }
    }

    /// Tag supplied by whoever opened the transaction.
    pub fn origin(&self) -> Option<&Value> {
        self.origin.as_ref()
    }

    /// `true` for local mutations, `false` while applying a remote
    /// update.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn before_state(&self) -> &StateVector {
        &self.before_state
    }
}

/// Everything the document dispatches after the transaction's borrow
/// ends.
pub(crate) struct CleanupOutput {
    pub shallow: Vec<(BranchRef, ContainerEvent)>,
    pub deep: Vec<(BranchRef, Vec<ContainerEvent>)>,
    pub update_v1: Option<Vec<u8>>,
    pub update_v2: Option<Vec<u8>>,
    pub subdocs: Option<SubdocsEvent>,
    pub summary: TransactionEvent,
}

pub(crate) fn cleanup_transaction(
    txn: &mut Transaction<'_>,
    want_v1: bool,
    want_v2: bool,
) -> Result<CleanupOutput, EngineError> {
    txn.delete_set.sort_and_merge();
    txn.after_state = txn.store.blocks.state_vector();

    // Event payloads are computed before garbage collection so old
    // values are still readable.
    let (shallow, deep) = compute_events(txn);

    if !txn.local {
        // Remote updates restructure the list arbitrarily; cached
        // positions cannot be repaired incrementally.
        let changed: Vec<BranchRef> = txn.changed.keys().copied().collect();
        for branch in changed {
            clear_markers(txn, branch);
        }
    }
    txn.need_formatting_cleanup = false;

    if txn.store.gc {
        try_gc_delete_set(txn);
    }
    try_merge_delete_set(txn);
    merge_new_structs(txn);

    if !txn.local {
        let client = txn.store.client_id;
        if txn.after_state.get(client) != txn.before_state.get(client) {
            // A remote peer wrote under our client id; writing more
            // under it would fork its history.
            txn.store.client_id = crate::generate_client_id();
        }
    }

    let has_content =
        !txn.delete_set.is_empty() || txn.after_state != txn.before_state;
    let update_v1 = if want_v1 && has_content {
        let mut enc = EncoderV1::new();
        write_update(&mut enc, txn.store, &txn.before_state, &txn.delete_set)?;
        Some(enc.finish())
    } else {
        None
    };
    let update_v2 = if want_v2 && has_content {
        let mut enc = EncoderV2::new();
        write_update(&mut enc, txn.store, &txn.before_state, &txn.delete_set)?;
        Some(enc.finish())
    } else {
        None
    };

    let subdocs = collect_subdocs(txn);

    Ok(CleanupOutput {
        shallow,
        deep,
        update_v1,
        update_v2,
        subdocs,
        summary: TransactionEvent {
            origin: txn.origin.clone(),
            local: txn.local,
            before_state: txn.before_state.clone(),
            after_state: txn.after_state.clone(),
        },
    })
}

fn clear_markers(txn: &mut Transaction<'_>, branch: BranchRef) {
    let markers = std::mem::take(&mut txn.store.branch_mut(branch).markers);
    for marker in markers {
        if txn.store.blocks.try_item(marker.item).is_some() {
            txn.store.blocks.item_mut(marker.item).set_marker(false);
        }
    }
}

fn try_gc_delete_set(txn: &mut Transaction<'_>) {
    let ds = txn.delete_set.clone();
    for (client, ranges) in ds.iter() {
        for range in ranges.iter().rev() {
            let Ok(start) = txn.store.blocks.find_index(client, range.clock) else {
                continue;
            };
            let mut candidates = Vec::new();
            let mut si = start;
            loop {
                let Some(&r) = txn.store.blocks.clients[&client].get(si) else {
                    break;
                };
                if txn.store.blocks.id_of(r).clock >= range.end() {
                    break;
                }
                if let Slot::Item(item) = txn.store.blocks.slot(r) {
                    let collectable = item.is_deleted()
                        && !item.keep()
                        && match &txn.store.gc_filter {
                            Some(filter) => filter(item.id, item.len),
                            None => true,
                        };
                    if collectable {
                        candidates.push(r);
                    }
                }
                si += 1;
            }
            for r in candidates {
                gc_item(txn, r, false);
            }
        }
    }
}

fn try_merge_delete_set(txn: &mut Transaction<'_>) {
    let ds = txn.delete_set.clone();
    for (client, ranges) in ds.iter() {
        for range in ranges.iter().rev() {
            let len = txn
                .store
                .blocks
                .clients
                .get(&client)
                .map(Vec::len)
                .unwrap_or(0);
            if len < 2 {
                continue;
            }
            let Ok(end_index) = txn.store.blocks.find_index(client, range.end() - 1) else {
                continue;
            };
            // Start one past the range so a struct that follows the
            // deleted run can also fold in.
            let mut si = (len - 1).min(end_index + 1);
            while si > 0 {
                let refs = &txn.store.blocks.clients[&client];
                if si >= refs.len() {
                    si = refs.len() - 1;
                    continue;
                }
                if txn.store.blocks.id_of(refs[si]).clock < range.clock {
                    break;
                }
                try_merge_with_left(txn.store, client, si);
                si -= 1;
            }
        }
    }
}

fn merge_new_structs(txn: &mut Transaction<'_>) {
    let after: Vec<(u32, u32)> = txn.after_state.iter().collect();
    for (client, after_clock) in after {
        let before_clock = txn.before_state.get(client);
        if before_clock == after_clock {
            continue;
        }
        let len = txn
            .store
            .blocks
            .clients
            .get(&client)
            .map(Vec::len)
            .unwrap_or(0);
        if len < 2 {
            continue;
        }
        let first_change = txn
            .store
            .blocks
            .find_index(client, before_clock)
            .unwrap_or(0)
            .max(1);
        let mut i = len - 1;
        while i >= first_change {
            let refs_len = txn.store.blocks.clients[&client].len();
            if i < refs_len {
                try_merge_with_left(txn.store, client, i);
            }
            if i == first_change {
                break;
            }
            i -= 1;
        }
    }

    let candidates = std::mem::take(&mut txn.merge_structs);
    for r in candidates {
        let id = match txn.store.blocks.slot(r) {
            Slot::Free => continue,
            _ => txn.store.blocks.id_of(r),
        };
        let Ok(pos) = txn.store.blocks.find_index(id.client, id.clock) else {
            continue;
        };
        let refs_len = txn.store.blocks.clients[&id.client].len();
        if pos + 1 < refs_len {
            try_merge_with_left(txn.store, id.client, pos + 1);
        }
        if pos > 0 {
            try_merge_with_left(txn.store, id.client, pos);
        }
    }
}

fn collect_subdocs(txn: &mut Transaction<'_>) -> Option<SubdocsEvent> {
    if txn.subdocs_added.is_empty()
        && txn.subdocs_removed.is_empty()
        && txn.subdocs_loaded.is_empty()
    {
        return None;
    }
    for guid in &txn.subdocs_added {
        txn.store.subdocs.insert(guid.clone());
    }
    for guid in &txn.subdocs_removed {
        txn.store.subdocs.remove(guid);
    }
    Some(SubdocsEvent {
        added: std::mem::take(&mut txn.subdocs_added),
        removed: std::mem::take(&mut txn.subdocs_removed),
        loaded: std::mem::take(&mut txn.subdocs_loaded),
    })
}

type EventBatches = (
    Vec<(BranchRef, ContainerEvent)>,
    Vec<(BranchRef, Vec<ContainerEvent>)>,
);

fn compute_events(txn: &Transaction<'_>) -> EventBatches {
    let mut shallow = Vec::new();
    let mut deep_acc: HashMap<BranchRef, Vec<ContainerEvent>> = HashMap::new();
    let mut changed: Vec<(&BranchRef, &HashSet<Option<String>>)> = txn.changed.iter().collect();
    changed.sort_by_key(|(b, _)| b.0);
    for (&branch, subs) in changed {
        if let Some(item_ref) = txn.store.branch(branch).item {
            if txn.store.blocks.item(item_ref).is_deleted() {
                continue;
            }
        }
        let event = build_event(txn, branch, subs);
        shallow.push((branch, event.clone()));
        // The event bubbles from the target to its root; deep
        // subscribers on any ancestor (the target included) see it.
        let mut t = branch;
        loop {
            deep_acc.entry(t).or_default().push(event.clone());
            match txn.store.branch(t).item {
                Some(item_ref) => match txn.store.blocks.item(item_ref).parent {
                    Some(p) => t = p,
                    None => break,
                },
                None => break,
            }
        }
    }
    let mut deep: Vec<(BranchRef, Vec<ContainerEvent>)> = deep_acc
        .into_iter()
        .map(|(b, mut events)| {
            events.sort_by_key(|e| e.path.len());
            (b, events)
        })
        .collect();
    deep.sort_by_key(|(b, _)| b.0);
    (shallow, deep)
}

fn build_event(
    txn: &Transaction<'_>,
    branch: BranchRef,
    subs: &HashSet<Option<String>>,
) -> ContainerEvent {
    let (root, path) = path_of(txn, branch);
    let delta = if subs.contains(&None) {
        compute_delta(txn, branch)
    } else {
        Vec::new()
    };
    let mut keys = HashMap::new();
    for sub in subs.iter().flatten() {
        if let Some(change) = compute_key_change(txn, branch, sub) {
            keys.insert(sub.clone(), change);
        }
    }
    ContainerEvent {
        root,
        path,
        kind: txn.store.branch(branch).kind,
        keys,
        delta,
        origin: txn.origin.clone(),
        local: txn.local,
    }
}

fn path_of(txn: &Transaction<'_>, branch: BranchRef) -> (String, Vec<PathSegment>) {
    let mut segments = Vec::new();
    let mut child = branch;
    loop {
        let b = txn.store.branch(child);
        let Some(item_ref) = b.item else {
            segments.reverse();
            return (b.name.clone().unwrap_or_default(), segments);
        };
        let item = txn.store.blocks.item(item_ref);
        let parent = item.parent.expect("nested container has a parent");
        match &item.parent_sub {
            Some(sub) => segments.push(PathSegment::Key(sub.clone())),
            None => {
                let mut index = 0u32;
                let mut c = txn.store.branch(parent).start;
                while let Some(cr) = c {
                    if cr == item_ref {
                        break;
                    }
                    let ci = txn.store.blocks.item(cr);
                    if !ci.is_deleted() && ci.is_countable() {
                        index += ci.len;
                    }
                    c = ci.right;
                }
                segments.push(PathSegment::Index(index));
            }
        }
        child = parent;
    }
}

fn compute_delta(txn: &Transaction<'_>, branch: BranchRef) -> Vec<DeltaOp> {
    let mut ops: Vec<DeltaOp> = Vec::new();
    let mut retain = 0u32;
    let mut c = txn.store.branch(branch).start;
    while let Some(cr) = c {
        let item = txn.store.blocks.item(cr);
        c = item.right;
        if !item.is_countable() {
            continue;
        }
        let added = item.id.clock >= txn.before_state.get(item.id.client);
        if added {
            if item.is_deleted() {
                // Inserted and removed within the same transaction;
                // observers never saw it.
                continue;
            }
            flush_retain(&mut ops, &mut retain);
            push_insert(&mut ops, chunk_values(txn.store, cr));
        } else if item.is_deleted() {
            if txn.delete_set.is_deleted(item.id) {
                flush_retain(&mut ops, &mut retain);
                push_delete(&mut ops, item.len);
            }
        } else {
            retain += item.len;
        }
    }
    ops
}

fn flush_retain(ops: &mut Vec<DeltaOp>, retain: &mut u32) {
    if *retain > 0 {
        ops.push(DeltaOp::Retain(*retain));
        *retain = 0;
    }
}

fn push_insert(ops: &mut Vec<DeltaOp>, mut values: Vec<Value>) {
    if let Some(DeltaOp::Insert(prev)) = ops.last_mut() {
        prev.append(&mut values);
    } else {
        ops.push(DeltaOp::Insert(values));
    }
}

fn push_delete(ops: &mut Vec<DeltaOp>, len: u32) {
    if let Some(DeltaOp::Delete(prev)) = ops.last_mut() {
        *prev += len;
    } else {
        ops.push(DeltaOp::Delete(len));
    }
}

fn last_value(txn: &Transaction<'_>, r: StructRef) -> Option<Value> {
    chunk_values(txn.store, r).pop()
}

fn compute_key_change(
    txn: &Transaction<'_>,
    branch: BranchRef,
    key: &str,
) -> Option<KeyChange> {
    let tail = txn.store.branch(branch).map.get(key).copied()?;
    let added_in_txn =
        |r: StructRef| -> bool {
            let item = txn.store.blocks.item(r);
            item.id.clock >= txn.before_state.get(item.id.client)
        };
    let deleted_in_txn = |r: StructRef| -> bool {
        txn.delete_set.is_deleted(txn.store.blocks.item(r).id)
    };
    let tail_item = txn.store.blocks.item(tail);
    if added_in_txn(tail) {
        let mut prev = tail_item.left;
        while let Some(p) = prev {
            if added_in_txn(p) {
                prev = txn.store.blocks.item(p).left;
            } else {
                break;
            }
        }
        if tail_item.is_deleted() {
            match prev {
                Some(p) if deleted_in_txn(p) => Some(KeyChange {
                    action: EntryChange::Delete,
                    old_value: last_value(txn, p),
                    new_value: None,
                }),
                _ => None,
            }
        } else {
            let new_value = last_value(txn, tail);
            match prev {
                Some(p) if deleted_in_txn(p) => Some(KeyChange {
                    action: EntryChange::Update,
                    old_value: last_value(txn, p),
                    new_value,
                }),
                _ => Some(KeyChange {
                    action: EntryChange::Add,
                    old_value: None,
                    new_value,
                }),
            }
        }
    } else if tail_item.is_deleted() && deleted_in_txn(tail) {
        Some(KeyChange {
            action: EntryChange::Delete,
            old_value: last_value(txn, tail),
            new_value: None,
        })
    } else {
        None
    }
}

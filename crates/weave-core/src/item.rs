//! The operation record and the integration algorithm.
//!
//! An item is the smallest unit of replication: a run of content with
//! an identity, the neighbors it observed at creation time (immutable
//! origins) and its current neighbors in the container list. Placing a
//! remote item between concurrently inserted siblings is the conflict
//! resolution at the core of the engine: scan the tied region,
//! tie-break by origin equality and client id, and link at the
//! resolved boundary.

use std::collections::HashSet;

use crate::branch::BranchRef;
use crate::content::Content;
use crate::error::EngineError;
use crate::id::Id;
use crate::store::{GcRange, Slot, Store, StructRef};
use crate::transaction::Transaction;

pub(crate) const ITEM_KEEP: u8 = 0b0001;
pub(crate) const ITEM_COUNTABLE: u8 = 0b0010;
pub(crate) const ITEM_DELETED: u8 = 0b0100;
pub(crate) const ITEM_MARKER: u8 = 0b1000;

pub(crate) struct Item {
    pub id: Id,
    pub len: u32,
    /// Id of the item unit immediately left at creation time. Never
    /// changes after creation.
    pub origin: Option<Id>,
    /// Id of the item immediately right at creation time. Never
    /// changes after creation.
    pub right_origin: Option<Id>,
    /// Current left neighbor in the container list.
    pub left: Option<StructRef>,
    /// Current right neighbor in the container list.
    pub right: Option<StructRef>,
    pub parent: Option<BranchRef>,
    /// `Some` turns this item into a versioned value for that map key.
    pub parent_sub: Option<String>,
    /// Id of a later item that redoes this one; maintained by undo
    /// consumers.
    pub redone: Option<Id>,
    pub content: Content,
    pub info: u8,
}

impl Item {
    pub fn new(
        id: Id,
        origin: Option<Id>,
        right_origin: Option<Id>,
        left: Option<StructRef>,
        right: Option<StructRef>,
        parent: Option<BranchRef>,
        parent_sub: Option<String>,
        content: Content,
    ) -> Self {
        let info = if content.is_countable() {
            ITEM_COUNTABLE
        } else {
            0
        };
        Self {
            id,
            len: content.len(),
            origin,
            right_origin,
            left,
            right,
            parent,
            parent_sub,
            redone: None,
            content,
            info,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.info & ITEM_DELETED != 0
    }

    pub fn is_countable(&self) -> bool {
        self.info & ITEM_COUNTABLE != 0
    }

    pub fn keep(&self) -> bool {
        self.info & ITEM_KEEP != 0
    }

    pub fn is_marker(&self) -> bool {
        self.info & ITEM_MARKER != 0
    }

    pub fn set_deleted(&mut self) {
        self.info |= ITEM_DELETED;
    }

    pub fn set_keep(&mut self, keep: bool) {
        if keep {
            self.info |= ITEM_KEEP;
        } else {
            self.info &= !ITEM_KEEP;
        }
    }

    pub fn set_marker(&mut self, marker: bool) {
        if marker {
            self.info |= ITEM_MARKER;
        } else {
            self.info &= !ITEM_MARKER;
        }
    }

    /// Recomputes the countable bit after a content swap.
    pub fn refresh_countable(&mut self) {
        if self.content.is_countable() {
            self.info |= ITEM_COUNTABLE;
        } else {
            self.info &= !ITEM_COUNTABLE;
        }
    }

    pub fn last_id(&self) -> Id {
        Id::new(self.id.client, self.id.clock + self.len - 1)
    }
}

/// Splits the item behind `left_ref` at `diff` content units and
/// allocates the right half. The right half inherits the deleted and
/// keep flags and becomes a merge candidate for transaction close. The
/// caller inserts the returned ref into the client segment.
pub(crate) fn split_item(txn: &mut Transaction<'_>, left_ref: StructRef, diff: u32) -> StructRef {
    let right_content = txn.store.blocks.item_mut(left_ref).content.split(diff);
    let (id, len, right, right_origin, parent, parent_sub, redone, info) = {
        let left = txn.store.blocks.item(left_ref);
        (
            left.id,
            left.len,
            left.right,
            left.right_origin,
            left.parent,
            left.parent_sub.clone(),
            left.redone,
            left.info,
        )
    };
    let mut right_item = Item::new(
        Id::new(id.client, id.clock + diff),
        Some(Id::new(id.client, id.clock + diff - 1)),
        right_origin,
        Some(left_ref),
        right,
        parent,
        parent_sub.clone(),
        right_content,
    );
    right_item.len = len - diff;
    right_item.info |= info & (ITEM_DELETED | ITEM_KEEP);
    right_item.redone = redone.map(|r| Id::new(r.client, r.clock + diff));
    let right_ref = txn.store.blocks.alloc(Slot::Item(right_item));

    {
        let left = txn.store.blocks.item_mut(left_ref);
        left.len = diff;
        left.right = Some(right_ref);
    }
    if let Some(rr) = right {
        txn.store.blocks.item_mut(rr).left = Some(right_ref);
    }
    txn.merge_structs.push(right_ref);
    // The right half took over the map-tail role.
    if let (Some(sub), None, Some(p)) = (parent_sub, right, parent) {
        txn.store.branch_mut(p).map.insert(sub, right_ref);
    }
    right_ref
}

/// Locates the index of the struct starting exactly at `clock`,
/// splitting the covering struct when `clock` falls inside it.
pub(crate) fn find_index_clean_start(
    txn: &mut Transaction<'_>,
    client: u32,
    clock: u32,
) -> Result<usize, EngineError> {
    let index = txn.store.blocks.find_index(client, clock)?;
    let r = txn.store.blocks.clients[&client][index];
    let start = txn.store.blocks.id_of(r).clock;
    if start < clock && matches!(txn.store.blocks.slot(r), Slot::Item(_)) {
        let right = split_item(txn, r, clock - start);
        txn.store
            .blocks
            .clients
            .get_mut(&client)
            .expect("client segment exists")
            .insert(index + 1, right);
        return Ok(index + 1);
    }
    Ok(index)
}

/// Returns the struct whose first unit is `id`, splitting on demand.
pub(crate) fn get_item_clean_start(
    txn: &mut Transaction<'_>,
    id: Id,
) -> Result<StructRef, EngineError> {
    let index = find_index_clean_start(txn, id.client, id.clock)?;
    Ok(txn.store.blocks.clients[&id.client][index])
}

/// Returns the struct whose last unit is `id`, splitting on demand.
pub(crate) fn get_item_clean_end(
    txn: &mut Transaction<'_>,
    id: Id,
) -> Result<StructRef, EngineError> {
    let index = txn.store.blocks.find_index(id.client, id.clock)?;
    let r = txn.store.blocks.clients[&id.client][index];
    let start = txn.store.blocks.id_of(r).clock;
    let len = txn.store.blocks.len_of(r);
    if id.clock != start + len - 1 && matches!(txn.store.blocks.slot(r), Slot::Item(_)) {
        let right = split_item(txn, r, id.clock - start + 1);
        txn.store
            .blocks
            .clients
            .get_mut(&id.client)
            .expect("client segment exists")
            .insert(index + 1, right);
    }
    Ok(r)
}

/// Splits cleanly at both ends of `[clock, clock + len)` and returns
/// every struct covered by the range, in clock order.
pub(crate) fn range_refs(
    txn: &mut Transaction<'_>,
    client: u32,
    clock: u32,
    len: u32,
) -> Result<Vec<StructRef>, EngineError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let end = clock + len;
    let mut index = find_index_clean_start(txn, client, clock)?;
    let mut out = Vec::new();
    loop {
        let Some(&r) = txn.store.blocks.clients[&client].get(index) else {
            break;
        };
        let start = txn.store.blocks.id_of(r).clock;
        if start >= end {
            break;
        }
        if end < start + txn.store.blocks.len_of(r) {
            find_index_clean_start(txn, client, end)?;
        }
        out.push(r);
        index += 1;
    }
    Ok(out)
}

/// Records `(parent, parent_sub)` in the transaction's changed set,
/// unless the parent itself was created inside this transaction.
pub(crate) fn add_changed_type(
    txn: &mut Transaction<'_>,
    parent: BranchRef,
    parent_sub: Option<String>,
) {
    let record = match txn.store.branch(parent).item {
        None => true,
        Some(item_ref) => {
            let item = txn.store.blocks.item(item_ref);
            item.id.clock < txn.before_state.get(item.id.client) && !item.is_deleted()
        }
    };
    if record {
        txn.changed.entry(parent).or_default().insert(parent_sub);
    }
}

/// Integrates a collapsed tombstone.
pub(crate) fn integrate_gc(
    txn: &mut Transaction<'_>,
    mut gc: GcRange,
    offset: u32,
) -> Result<StructRef, EngineError> {
    if offset > 0 {
        gc.id.clock += offset;
        gc.len -= offset;
    }
    let r = txn.store.blocks.alloc(Slot::Gc(gc));
    txn.store.blocks.add_struct(r)?;
    Ok(r)
}

/// Integrates `item` into its container list and the struct store.
///
/// `item.left`/`item.right` are the provisional neighbors derived from
/// the origins (or picked by a positional insert); the conflict scan
/// corrects `left` when concurrent siblings interleaved since the
/// origins were observed. `offset > 0` trims a prefix that is already
/// known locally.
pub(crate) fn integrate_item(
    txn: &mut Transaction<'_>,
    mut item: Item,
    offset: u32,
) -> Result<StructRef, EngineError> {
    if offset > 0 {
        item.id.clock += offset;
        let left = get_item_clean_end(txn, Id::new(item.id.client, item.id.clock - 1))?;
        item.origin = Some(txn.store.blocks.last_id_of(left));
        item.left = Some(left);
        item.content = item.content.split(offset);
        item.len -= offset;
    }

    let Some(parent) = item.parent else {
        // The container is gone; the item only survives as a clock
        // range.
        return integrate_gc(
            txn,
            GcRange {
                id: item.id,
                len: item.len,
            },
            0,
        );
    };

    let scan = match (item.left, item.right) {
        (None, None) => true,
        (None, Some(r)) => txn.store.blocks.item(r).left.is_some(),
        (Some(l), r) => txn.store.blocks.item(l).right != r,
    };
    if scan {
        let mut left = item.left;
        let mut o = match left {
            Some(l) => txn.store.blocks.item(l).right,
            None => match &item.parent_sub {
                Some(sub) => {
                    let mut cur = txn.store.branch(parent).map.get(sub).copied();
                    while let Some(c) = cur {
                        match txn.store.blocks.item(c).left {
                            Some(l) => cur = Some(l),
                            None => break,
                        }
                    }
                    cur
                }
                None => txn.store.branch(parent).start,
            },
        };
        let mut conflicting: HashSet<StructRef> = HashSet::new();
        let mut items_before_origin: HashSet<StructRef> = HashSet::new();
        while let Some(o_ref) = o {
            if item.right == Some(o_ref) {
                break;
            }
            // Inserted before the case analysis: case B tests
            // membership against everything visited so far, including
            // structs not (or no longer) classified as conflicting.
            items_before_origin.insert(o_ref);
            conflicting.insert(o_ref);
            let (o_origin, o_right_origin, o_client, o_right) = {
                let oi = txn.store.blocks.item(o_ref);
                (oi.origin, oi.right_origin, oi.id.client, oi.right)
            };
            if o_origin == item.origin {
                // Tied sibling: same original left neighbor.
                if o_client < item.id.client {
                    left = Some(o_ref);
                    conflicting.clear();
                } else if o_right_origin == item.right_origin {
                    break;
                }
            } else if let Some(oo) = o_origin {
                match txn.store.blocks.find(oo) {
                    Some(origin_ref) if items_before_origin.contains(&origin_ref) => {
                        // Chained behind an earlier sibling.
                        if !conflicting.contains(&origin_ref) {
                            left = Some(o_ref);
                            conflicting.clear();
                        }
                    }
                    _ => break,
                }
            } else {
                break;
            }
            o = o_right;
        }
        item.left = left;
    }

    let parent_sub = item.parent_sub.clone();
    let countable = item.is_countable();
    let len = item.len;
    let this_ref = txn.store.blocks.alloc(Slot::Item(item));

    // Link into the container list.
    let left_now = txn.store.blocks.item(this_ref).left;
    match left_now {
        Some(l) => {
            let r = txn.store.blocks.item(l).right;
            txn.store.blocks.item_mut(this_ref).right = r;
            txn.store.blocks.item_mut(l).right = Some(this_ref);
        }
        None => {
            let r = match &parent_sub {
                Some(sub) => {
                    let mut cur = txn.store.branch(parent).map.get(sub).copied();
                    while let Some(c) = cur {
                        let l = txn.store.blocks.item(c).left;
                        match l {
                            Some(l) => cur = Some(l),
                            None => break,
                        }
                    }
                    cur
                }
                None => {
                    let s = txn.store.branch(parent).start;
                    txn.store.branch_mut(parent).start = Some(this_ref);
                    s
                }
            };
            txn.store.blocks.item_mut(this_ref).right = r;
        }
    }
    let right_now = txn.store.blocks.item(this_ref).right;
    match right_now {
        Some(r) => txn.store.blocks.item_mut(r).left = Some(this_ref),
        None => {
            if let Some(sub) = &parent_sub {
                // This item is the key's new tail; the previous tail
                // becomes an old version.
                txn.store.branch_mut(parent).map.insert(sub.clone(), this_ref);
                let left_of_this = txn.store.blocks.item(this_ref).left;
                if let Some(l) = left_of_this {
                    delete_item(txn, l);
                }
            }
        }
    }
    if parent_sub.is_none() && countable {
        txn.store.branch_mut(parent).content_len += len;
    }
    txn.store.blocks.add_struct(this_ref)?;

    integrate_content(txn, this_ref);
    add_changed_type(txn, parent, parent_sub.clone());

    let parent_item_deleted = txn
        .store
        .branch(parent)
        .item
        .map(|pi| txn.store.blocks.item(pi).is_deleted())
        .unwrap_or(false);
    let stale_map_entry = parent_sub.is_some() && txn.store.blocks.item(this_ref).right.is_some();
    if parent_item_deleted || stale_map_entry {
        delete_item(txn, this_ref);
    }
    Ok(this_ref)
}

enum ContentHook {
    Type(BranchRef),
    Doc { guid: String, load: bool },
    Format,
    None,
}

fn content_hook(txn: &Transaction<'_>, r: StructRef) -> ContentHook {
    match &txn.store.blocks.item(r).content {
        Content::Type(b) => ContentHook::Type(*b),
        Content::Doc(doc) => ContentHook::Doc {
            guid: doc.guid().to_string(),
            load: doc.auto_load() || doc.should_load(),
        },
        Content::Format { .. } => ContentHook::Format,
        _ => ContentHook::None,
    }
}

fn integrate_content(txn: &mut Transaction<'_>, this_ref: StructRef) {
    match content_hook(txn, this_ref) {
        ContentHook::Type(b) => {
            txn.store.branch_mut(b).item = Some(this_ref);
        }
        ContentHook::Doc { guid, load } => {
            txn.subdocs_added.push(guid.clone());
            if load {
                txn.subdocs_loaded.push(guid);
            }
        }
        ContentHook::Format => {
            txn.need_formatting_cleanup = true;
        }
        ContentHook::None => {}
    }
}

/// Marks the item deleted: it stays in the container list as a
/// tombstone until garbage collection.
pub(crate) fn delete_item(txn: &mut Transaction<'_>, r: StructRef) {
    let (deleted, parent, parent_sub, countable, len, id) = {
        let item = txn.store.blocks.item(r);
        (
            item.is_deleted(),
            item.parent,
            item.parent_sub.clone(),
            item.is_countable(),
            item.len,
            item.id,
        )
    };
    if deleted {
        return;
    }
    if let Some(p) = parent {
        if countable && parent_sub.is_none() {
            txn.store.branch_mut(p).content_len -= len;
        }
    }
    txn.store.blocks.item_mut(r).set_deleted();
    txn.delete_set.add(id.client, id.clock, len);
    if let Some(p) = parent {
        add_changed_type(txn, p, parent_sub);
    }
    delete_content(txn, r);
}

fn delete_content(txn: &mut Transaction<'_>, r: StructRef) {
    match content_hook(txn, r) {
        ContentHook::Type(b) => {
            let mut children: Vec<StructRef> = Vec::new();
            let mut cur = txn.store.branch(b).start;
            while let Some(c) = cur {
                children.push(c);
                cur = txn.store.blocks.item(c).right;
            }
            children.extend(txn.store.branch(b).map.values().copied());
            for c in children {
                if !txn.store.blocks.item(c).is_deleted() {
                    delete_item(txn, c);
                } else {
                    txn.merge_structs.push(c);
                }
            }
        }
        ContentHook::Doc { guid, .. } => {
            txn.subdocs_removed.push(guid);
        }
        _ => {}
    }
}

/// Collapses a tombstone. When the parent container itself was
/// collected the whole struct degrades to a `GC` range; otherwise only
/// the content is dropped and the item keeps its place in the list.
pub(crate) fn gc_item(txn: &mut Transaction<'_>, r: StructRef, parent_gcd: bool) {
    // The struct may already have collapsed through its container.
    let Some(item) = txn.store.blocks.try_item(r) else {
        return;
    };
    if !item.is_deleted() {
        return;
    }
    gc_content(txn, r);
    let (id, len) = {
        let item = txn.store.blocks.item(r);
        (item.id, item.len)
    };
    if parent_gcd {
        txn.store.blocks.replace(r, Slot::Gc(GcRange { id, len }));
    } else {
        let item = txn.store.blocks.item_mut(r);
        item.content = Content::Deleted(len);
        item.refresh_countable();
        item.set_marker(false);
    }
}

fn gc_content(txn: &mut Transaction<'_>, r: StructRef) {
    if let ContentHook::Type(b) = content_hook(txn, r) {
        let mut children: Vec<StructRef> = Vec::new();
        let mut cur = txn.store.branch(b).start;
        while let Some(c) = cur {
            children.push(c);
            cur = txn.store.blocks.item(c).right;
        }
        for &tail in txn.store.branch(b).map.clone().values() {
            let mut cur = Some(tail);
            while let Some(c) = cur {
                children.push(c);
                cur = txn.store.blocks.item(c).left;
            }
        }
        for c in children {
            gc_item(txn, c, true);
        }
        let branch = txn.store.branch_mut(b);
        branch.start = None;
        branch.map.clear();
        branch.markers.clear();
    }
}

/// Merges the struct at `index` of `client`'s segment into its left
/// neighbor when they are causally contiguous and of the same shape.
/// Returns `true` when a merge happened (the segment shrank by one).
pub(crate) fn try_merge_with_left(store: &mut Store, client: u32, index: usize) -> bool {
    if index == 0 {
        return false;
    }
    let refs = &store.blocks.clients[&client];
    let left_ref = refs[index - 1];
    let right_ref = refs[index];
    let mergeable = match (store.blocks.slot(left_ref), store.blocks.slot(right_ref)) {
        (Slot::Gc(_), Slot::Gc(_)) => true,
        (Slot::Item(l), Slot::Item(r)) => {
            r.origin == Some(Id::new(l.id.client, l.id.clock + l.len - 1))
                && l.right == Some(right_ref)
                && l.right_origin == r.right_origin
                && l.id.client == r.id.client
                && l.id.clock + l.len == r.id.clock
                && l.is_deleted() == r.is_deleted()
                && l.redone.is_none()
                && r.redone.is_none()
                && l.content.can_merge(&r.content)
        }
        _ => false,
    };
    if !mergeable {
        return false;
    }
    match std::mem::replace(store.blocks.slot_mut(right_ref), Slot::Free) {
        Slot::Gc(gc) => {
            if let Slot::Gc(left) = store.blocks.slot_mut(left_ref) {
                left.len += gc.len;
            }
        }
        Slot::Item(right_item) => {
            let (left_len_before, left_visible, parent, parent_sub) = {
                let l = store.blocks.item(left_ref);
                (
                    l.len,
                    !l.is_deleted() && l.is_countable(),
                    l.parent,
                    l.parent_sub.clone(),
                )
            };
            if let Some(p) = parent {
                for marker in &mut store.branch_mut(p).markers {
                    if marker.item == right_ref {
                        marker.item = left_ref;
                        if left_visible {
                            marker.index -= left_len_before;
                        }
                    }
                }
                if let Some(sub) = &parent_sub {
                    if store.branch(p).map.get(sub) == Some(&right_ref) {
                        store.branch_mut(p).map.insert(sub.clone(), left_ref);
                    }
                }
            }
            let keep = right_item.keep();
            let new_right = right_item.right;
            {
                let left = store.blocks.item_mut(left_ref);
                if keep {
                    left.set_keep(true);
                }
                left.right = new_right;
                left.len += right_item.len;
                left.content.merge(right_item.content);
            }
            if let Some(nr) = new_right {
                store.blocks.item_mut(nr).left = Some(left_ref);
            }
        }
        Slot::Free => return false,
    }
    let refs = store.blocks.clients.get_mut(&client).expect("client segment exists");
    refs.remove(index);
    true
}

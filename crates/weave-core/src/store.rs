//! Struct storage.
//!
//! Every struct (item or collapsed tombstone) lives in a slot arena
//! and is addressed by a stable `StructRef`. On top of the arena the
//! store keeps one ordered, clock-contiguous segment per client: the
//! insertion-order log the codec walks and the binary search runs on.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::branch::{Branch, BranchKind, BranchRef};
use crate::delete_set::DeleteSet;
use crate::error::EngineError;
use crate::id::{Id, StateVector};
use crate::item::Item;
use crate::update::PendingStructs;

/// Stable handle into the slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StructRef(pub(crate) u32);

/// A collapsed tombstone occupying a clock range.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GcRange {
    pub id: Id,
    pub len: u32,
}

pub(crate) enum Slot {
    Item(Item),
    Gc(GcRange),
    /// Left behind when a struct is merged into its left neighbor.
    Free,
}

#[derive(Default)]
pub(crate) struct StructStore {
    slots: Vec<Slot>,
    pub(crate) clients: HashMap<u32, Vec<StructRef>>,
}

impl StructStore {
    pub fn alloc(&mut self, slot: Slot) -> StructRef {
        let r = StructRef(self.slots.len() as u32);
        self.slots.push(slot);
        r
    }

    pub fn slot(&self, r: StructRef) -> &Slot {
        &self.slots[r.0 as usize]
    }

    pub fn slot_mut(&mut self, r: StructRef) -> &mut Slot {
        &mut self.slots[r.0 as usize]
    }

    /// Arena integrity is an internal invariant; a non-item slot here
    /// is unrecoverable corruption, not an error to propagate.
    pub fn item(&self, r: StructRef) -> &Item {
        match self.slot(r) {
            Slot::Item(item) => item,
            _ => panic!("struct slot is not an item"),
        }
    }

    pub fn item_mut(&mut self, r: StructRef) -> &mut Item {
        match self.slot_mut(r) {
            Slot::Item(item) => item,
            _ => panic!("struct slot is not an item"),
        }
    }

    pub fn try_item(&self, r: StructRef) -> Option<&Item> {
        match self.slot(r) {
            Slot::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn is_gc(&self, r: StructRef) -> bool {
        matches!(self.slot(r), Slot::Gc(_))
    }

    pub fn id_of(&self, r: StructRef) -> Id {
        match self.slot(r) {
            Slot::Item(item) => item.id,
            Slot::Gc(gc) => gc.id,
            Slot::Free => panic!("struct slot is free"),
        }
    }

    pub fn len_of(&self, r: StructRef) -> u32 {
        match self.slot(r) {
            Slot::Item(item) => item.len,
            Slot::Gc(gc) => gc.len,
            Slot::Free => panic!("struct slot is free"),
        }
    }

    /// Id of the last content unit covered by the struct.
    pub fn last_id_of(&self, r: StructRef) -> Id {
        let id = self.id_of(r);
        Id::new(id.client, id.clock + self.len_of(r) - 1)
    }

    /// Next expected clock for `client`.
    pub fn get_state(&self, client: u32) -> u32 {
        match self.clients.get(&client).and_then(|refs| refs.last()) {
            Some(&last) => {
                let id = self.id_of(last);
                id.clock + self.len_of(last)
            }
            None => 0,
        }
    }

    pub fn state_vector(&self) -> StateVector {
        self.clients
            .keys()
            .map(|&client| (client, self.get_state(client)))
            .collect()
    }

    /// Appends a freshly allocated struct to its client segment,
    /// enforcing clock contiguity.
    pub fn add_struct(&mut self, r: StructRef) -> Result<(), EngineError> {
        let id = self.id_of(r);
        let expected = self.get_state(id.client);
        if id.clock != expected {
            return Err(EngineError::BrokenInvariant(
                "struct does not continue its client segment",
            ));
        }
        self.clients.entry(id.client).or_default().push(r);
        Ok(())
    }

    /// Interpolated binary search over one client segment. Returns the
    /// index of the struct covering `clock`.
    pub fn find_index(&self, client: u32, clock: u32) -> Result<usize, EngineError> {
        let refs = self
            .clients
            .get(&client)
            .filter(|refs| !refs.is_empty())
            .ok_or(EngineError::NotPresent)?;
        let mut left = 0usize;
        let mut right = refs.len() - 1;
        let last = refs[right];
        let last_id = self.id_of(last);
        if last_id.clock == clock {
            return Ok(right);
        }
        let span = last_id.clock as u64 + self.len_of(last) as u64;
        // Clock distributions are near-uniform per client, so start
        // the bisection at the proportional position.
        let mut mid = ((clock as u64 * right as u64) / (span - 1).max(1)) as usize;
        while left <= right {
            let r = refs[mid];
            let mid_clock = self.id_of(r).clock;
            if mid_clock <= clock {
                if clock < mid_clock + self.len_of(r) {
                    return Ok(mid);
                }
                left = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                right = mid - 1;
            }
            mid = (left + right) / 2;
        }
        Err(EngineError::NotPresent)
    }

    /// Locates the struct covering `id` without splitting.
    pub fn find(&self, id: Id) -> Option<StructRef> {
        let index = self.find_index(id.client, id.clock).ok()?;
        Some(self.clients[&id.client][index])
    }

    /// Replaces the struct behind `r` in place; ordering and every
    /// outstanding reference stay valid.
    pub fn replace(&mut self, r: StructRef, slot: Slot) {
        self.slots[r.0 as usize] = slot;
    }

    /// Builds the delete set describing every tombstone currently in
    /// the store.
    pub fn delete_set(&self) -> DeleteSet {
        let mut ds = DeleteSet::new();
        for (&client, refs) in &self.clients {
            for &r in refs {
                match self.slot(r) {
                    Slot::Gc(gc) => ds.add(client, gc.id.clock, gc.len),
                    Slot::Item(item) if item.is_deleted() => {
                        ds.add(client, item.id.clock, item.len)
                    }
                    _ => {}
                }
            }
        }
        ds.sort_and_merge();
        ds
    }
}

/// Predicate deciding whether a tombstone may be collapsed.
pub type GcFilter = Box<dyn Fn(Id, u32) -> bool + Send + Sync>;

/// The complete CRDT state of one document, separate from the event
/// registries so a transaction can borrow it exclusively while
/// listeners stay reachable.
pub(crate) struct Store {
    pub blocks: StructStore,
    pub branches: Vec<Branch>,
    pub roots: HashMap<String, BranchRef>,
    pub client_id: u32,
    pub guid: String,
    pub collection_id: Option<String>,
    pub meta: Option<Value>,
    pub gc: bool,
    pub gc_filter: Option<GcFilter>,
    pub auto_load: bool,
    pub should_load: bool,
    pub subdocs: HashSet<String>,
    pub pending_structs: Option<PendingStructs>,
    pub pending_ds: Option<DeleteSet>,
    /// Logical timestamp source for the search-marker caches.
    pub marker_tick: u64,
    pub destroyed: bool,
}

impl Store {
    pub fn branch(&self, r: BranchRef) -> &Branch {
        &self.branches[r.0 as usize]
    }

    pub fn branch_mut(&mut self, r: BranchRef) -> &mut Branch {
        &mut self.branches[r.0 as usize]
    }

    pub fn alloc_branch(&mut self, branch: Branch) -> BranchRef {
        let r = BranchRef(self.branches.len() as u32);
        self.branches.push(branch);
        r
    }

    /// Root lookup used by the decoder: unknown names materialize as
    /// unspecialized containers that `Doc::get_*` re-types later.
    pub fn root_or_create_abstract(&mut self, name: &str) -> BranchRef {
        if let Some(&r) = self.roots.get(name) {
            return r;
        }
        let r = self.alloc_branch(Branch::new(BranchKind::Abstract, Some(name.to_string())));
        self.roots.insert(name.to_string(), r);
        r
    }

    pub fn next_marker_tick(&mut self) -> u64 {
        self.marker_tick += 1;
        self.marker_tick
    }
}

//! The shared document.
//!
//! A `Doc` owns the CRDT state plus the listener registries. Every
//! mutation runs through `transact`; observers and update subscribers
//! fire after the transaction's cleanup, with value-based payloads.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::{Map as JsonMap, Value};

use crate::branch::{Branch, BranchKind, BranchRef};
use crate::codec::{DecoderV1, DecoderV2, EncoderV1, EncoderV2, UpdateEncoder};
use crate::error::EngineError;
use crate::event::{
    ContainerEvent, SubdocsEvent, SubscriptionId, TransactionEvent, UpdateEvent,
};
use crate::id::StateVector;
use crate::store::{GcFilter, Store, StructStore};
use crate::transaction::{cleanup_transaction, CleanupOutput, Transaction};
use crate::types::{
    branch_to_json, ArrayRef, MapRef, TextRef, XmlElementRef, XmlFragmentRef, XmlHookRef,
    XmlTextRef,
};
use crate::update::{
    apply_update_impl, decode_state_vector_bytes, encode_state_vector_bytes, write_update,
};

/// Construction options. `Default` gives a random client id and guid,
/// garbage collection on, and no filter.
pub struct DocOptions {
    pub client_id: Option<u32>,
    pub guid: Option<String>,
    pub collection_id: Option<String>,
    pub gc: bool,
    pub gc_filter: Option<GcFilter>,
    pub meta: Option<Value>,
    pub auto_load: bool,
    pub should_load: bool,
}

impl Default for DocOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            guid: None,
            collection_id: None,
            gc: true,
            gc_filter: None,
            meta: None,
            auto_load: false,
            should_load: true,
        }
    }
}

type TxnCb = Box<dyn FnMut(&TransactionEvent) + Send + Sync>;
type UpdateCb = Box<dyn FnMut(&UpdateEvent) + Send + Sync>;
type SubdocsCb = Box<dyn FnMut(&SubdocsEvent) + Send + Sync>;
type VoidCb = Box<dyn FnMut() + Send + Sync>;
type SyncCb = Box<dyn FnMut(bool) + Send + Sync>;
type ShallowCb = Box<dyn FnMut(&ContainerEvent) + Send + Sync>;
type DeepCb = Box<dyn FnMut(&[ContainerEvent]) + Send + Sync>;

#[derive(Default)]
struct DocEvents {
    before_all_transactions: BTreeMap<u64, VoidCb>,
    before_transaction: BTreeMap<u64, TxnCb>,
    before_observer_calls: BTreeMap<u64, TxnCb>,
    after_transaction: BTreeMap<u64, TxnCb>,
    after_transaction_cleanup: BTreeMap<u64, TxnCb>,
    after_all_transactions: BTreeMap<u64, VoidCb>,
    update: BTreeMap<u64, UpdateCb>,
    update_v2: BTreeMap<u64, UpdateCb>,
    subdocs: BTreeMap<u64, SubdocsCb>,
    destroy: BTreeMap<u64, VoidCb>,
    load: BTreeMap<u64, VoidCb>,
    sync: BTreeMap<u64, SyncCb>,
}

pub struct Doc {
    pub(crate) store: Store,
    events: DocEvents,
    observers: HashMap<BranchRef, BTreeMap<u64, ShallowCb>>,
    deep_observers: HashMap<BranchRef, BTreeMap<u64, DeepCb>>,
    next_subscription: u64,
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}

impl Doc {
    pub fn new() -> Self {
        Self::with_options(DocOptions::default())
    }

    pub fn with_options(options: DocOptions) -> Self {
        let client_id = options.client_id.unwrap_or_else(crate::generate_client_id);
        let guid = options.guid.unwrap_or_else(crate::generate_guid);
        Self {
            store: Store {
                blocks: StructStore::default(),
                branches: Vec::new(),
                roots: HashMap::new(),
                client_id,
                guid,
                collection_id: options.collection_id,
                meta: options.meta,
                gc: options.gc,
                gc_filter: options.gc_filter,
                auto_load: options.auto_load,
                should_load: options.should_load,
                subdocs: HashSet::new(),
                pending_structs: None,
                pending_ds: None,
                marker_tick: 0,
                destroyed: false,
            },
            events: DocEvents::default(),
            observers: HashMap::new(),
            deep_observers: HashMap::new(),
            next_subscription: 1,
        }
    }

    /// Shell for a sub-document referenced by an update; its content
    /// arrives through its own updates once the host loads it.
    pub(crate) fn subdoc_shell(guid: String, opts: &Value) -> Self {
        let auto_load = opts
            .get("autoLoad")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let should_load = opts
            .get("shouldLoad")
            .and_then(Value::as_bool)
            .unwrap_or(auto_load);
        Self::with_options(DocOptions {
            guid: Some(guid),
            auto_load,
            should_load,
            ..DocOptions::default()
        })
    }

    pub fn client_id(&self) -> u32 {
        self.store.client_id
    }

    pub fn guid(&self) -> &str {
        &self.store.guid
    }

    pub fn collection_id(&self) -> Option<&str> {
        self.store.collection_id.as_deref()
    }

    pub fn meta(&self) -> Option<&Value> {
        self.store.meta.as_ref()
    }

    pub fn auto_load(&self) -> bool {
        self.store.auto_load
    }

    pub fn should_load(&self) -> bool {
        self.store.should_load
    }

    /// Guids of sub-documents currently embedded in this document.
    pub fn subdocs(&self) -> &HashSet<String> {
        &self.store.subdocs
    }

    // --- roots ---

    fn get_root(&mut self, name: &str, kind: BranchKind) -> Result<BranchRef, EngineError> {
        if let Some(&r) = self.store.roots.get(name) {
            let current = self.store.branch(r).kind;
            if current == kind {
                return Ok(r);
            }
            if current == BranchKind::Abstract {
                // The root was materialized by a decoded update before
                // the application named its kind; specialize in place.
                self.store.branch_mut(r).kind = kind;
                return Ok(r);
            }
            return Err(EngineError::TypeMismatch {
                name: name.to_string(),
                actual: current.name(),
            });
        }
        let r = self
            .store
            .alloc_branch(Branch::new(kind, Some(name.to_string())));
        self.store.roots.insert(name.to_string(), r);
        Ok(r)
    }

    pub fn get_array(&mut self, name: &str) -> Result<ArrayRef, EngineError> {
        Ok(ArrayRef {
            branch: self.get_root(name, BranchKind::Array)?,
        })
    }

    pub fn get_map(&mut self, name: &str) -> Result<MapRef, EngineError> {
        Ok(MapRef {
            branch: self.get_root(name, BranchKind::Map)?,
        })
    }

    pub fn get_text(&mut self, name: &str) -> Result<TextRef, EngineError> {
        Ok(TextRef {
            branch: self.get_root(name, BranchKind::Text)?,
        })
    }

    pub fn get_xml_fragment(&mut self, name: &str) -> Result<XmlFragmentRef, EngineError> {
        Ok(XmlFragmentRef {
            branch: self.get_root(name, BranchKind::XmlFragment)?,
        })
    }

    pub fn get_xml_element(&mut self, name: &str) -> Result<XmlElementRef, EngineError> {
        Ok(XmlElementRef {
            branch: self.get_root(name, BranchKind::XmlElement)?,
        })
    }

    pub fn get_xml_hook(&mut self, name: &str) -> Result<XmlHookRef, EngineError> {
        Ok(XmlHookRef {
            branch: self.get_root(name, BranchKind::XmlHook)?,
        })
    }

    pub fn get_xml_text(&mut self, name: &str) -> Result<XmlTextRef, EngineError> {
        Ok(XmlTextRef {
            branch: self.get_root(name, BranchKind::XmlText)?,
        })
    }

    // --- transactions ---

    /// Runs `f` in a transaction and closes it: observers fire, the
    /// update is emitted, tombstones are collected. An error from `f`
    /// does not skip cleanup.
    pub fn transact<T>(
        &mut self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.transact_inner(None, true, f)
    }

    /// Like [`Doc::transact`] with a caller-supplied origin tag, which
    /// every event of this transaction carries.
    pub fn transact_with<T>(
        &mut self,
        origin: Value,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        self.transact_inner(Some(origin), true, f)
    }

    fn transact_inner<T>(
        &mut self,
        origin: Option<Value>,
        local: bool,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let pre = TransactionEvent {
            origin: origin.clone(),
            local,
            before_state: self.store.blocks.state_vector(),
            after_state: StateVector::new(),
        };
        for cb in self.events.before_all_transactions.values_mut() {
            cb();
        }
        for cb in self.events.before_transaction.values_mut() {
            cb(&pre);
        }
        let want_v1 = !self.events.update.is_empty();
        let want_v2 = !self.events.update_v2.is_empty();

        let mut txn = Transaction::new(&mut self.store, origin, local);
        let out = f(&mut txn);
        // Cleanup runs regardless of how `f` went.
        let cleaned = cleanup_transaction(&mut txn, want_v1, want_v2);
        drop(txn);

        let result = match cleaned {
            Ok(output) => {
                self.dispatch(output);
                out
            }
            Err(cleanup_err) => match out {
                Ok(_) => Err(cleanup_err),
                Err(user_err) => Err(user_err),
            },
        };
        for cb in self.events.after_all_transactions.values_mut() {
            cb();
        }
        result
    }

    fn dispatch(&mut self, output: CleanupOutput) {
        for cb in self.events.before_observer_calls.values_mut() {
            cb(&output.summary);
        }
        for (branch, event) in &output.shallow {
            if let Some(mut cbs) = self.observers.remove(branch) {
                for cb in cbs.values_mut() {
                    cb(event);
                }
                self.observers.insert(*branch, cbs);
            }
        }
        for (branch, events) in &output.deep {
            if let Some(mut cbs) = self.deep_observers.remove(branch) {
                for cb in cbs.values_mut() {
                    cb(events);
                }
                self.deep_observers.insert(*branch, cbs);
            }
        }
        for cb in self.events.after_transaction.values_mut() {
            cb(&output.summary);
        }
        for cb in self.events.after_transaction_cleanup.values_mut() {
            cb(&output.summary);
        }
        if let Some(update) = output.update_v1 {
            let event = UpdateEvent {
                update,
                origin: output.summary.origin.clone(),
                local: output.summary.local,
            };
            for cb in self.events.update.values_mut() {
                cb(&event);
            }
        }
        if let Some(update) = output.update_v2 {
            let event = UpdateEvent {
                update,
                origin: output.summary.origin.clone(),
                local: output.summary.local,
            };
            for cb in self.events.update_v2.values_mut() {
                cb(&event);
            }
        }
        if let Some(subdocs) = output.subdocs {
            for cb in self.events.subdocs.values_mut() {
                cb(&subdocs);
            }
        }
    }

    // --- update interface ---

    pub fn state_vector(&self) -> StateVector {
        self.store.blocks.state_vector()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        encode_state_vector_bytes(&self.state_vector())
    }

    /// Encodes everything a peer at `remote_state_vector` is missing;
    /// the whole history when `None`.
    pub fn encode_state_as_update_v1(
        &self,
        remote_state_vector: Option<&[u8]>,
    ) -> Result<Vec<u8>, EngineError> {
        self.encode_state_as_update(remote_state_vector, EncoderV1::new())
    }

    /// V2 counterpart of [`Doc::encode_state_as_update_v1`].
    pub fn encode_state_as_update_v2(
        &self,
        remote_state_vector: Option<&[u8]>,
    ) -> Result<Vec<u8>, EngineError> {
        self.encode_state_as_update(remote_state_vector, EncoderV2::new())
    }

    fn encode_state_as_update<E: UpdateEncoder>(
        &self,
        remote_state_vector: Option<&[u8]>,
        mut enc: E,
    ) -> Result<Vec<u8>, EngineError> {
        let sv = match remote_state_vector {
            Some(bytes) => decode_state_vector_bytes(bytes)?,
            None => StateVector::new(),
        };
        let ds = self.store.blocks.delete_set();
        write_update(&mut enc, &self.store, &sv, &ds)?;
        Ok(enc.finish())
    }

    /// Applies a V1-encoded update. Structs with missing dependencies
    /// are buffered and retried once the dependencies arrive.
    pub fn apply_update_v1(
        &mut self,
        update: &[u8],
        origin: Option<Value>,
    ) -> Result<(), EngineError> {
        self.transact_inner(origin, false, |txn| {
            let mut dec = DecoderV1::new(update);
            apply_update_impl(txn, &mut dec)
        })
    }

    /// V2 counterpart of [`Doc::apply_update_v1`].
    pub fn apply_update_v2(
        &mut self,
        update: &[u8],
        origin: Option<Value>,
    ) -> Result<(), EngineError> {
        self.transact_inner(origin, false, |txn| {
            let mut dec = DecoderV2::new(update)?;
            apply_update_impl(txn, &mut dec)
        })
    }

    /// `true` while buffered remote structs wait for missing
    /// dependencies.
    pub fn has_pending_structs(&self) -> bool {
        self.store.pending_structs.is_some()
    }

    /// The state-vector entries the pending buffer waits for.
    pub fn pending_missing(&self) -> Option<HashMap<u32, u32>> {
        self.store
            .pending_structs
            .as_ref()
            .map(|p| p.missing.clone())
    }

    pub fn has_pending_deletes(&self) -> bool {
        self.store.pending_ds.is_some()
    }

    /// JSON view of every root container.
    pub fn to_json(&self) -> Value {
        let mut out = JsonMap::new();
        let mut names: Vec<&String> = self.store.roots.keys().collect();
        names.sort();
        for name in names {
            out.insert(name.clone(), branch_to_json(&self.store, self.store.roots[name]));
        }
        Value::Object(out)
    }

    // --- events ---

    fn next_id(&mut self) -> u64 {
        let id = self.next_subscription;
        self.next_subscription += 1;
        id
    }

    pub fn observe(
        &mut self,
        target: impl Into<BranchRef>,
        cb: impl FnMut(&ContainerEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.observers
            .entry(target.into())
            .or_default()
            .insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn observe_deep(
        &mut self,
        target: impl Into<BranchRef>,
        cb: impl FnMut(&[ContainerEvent]) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.deep_observers
            .entry(target.into())
            .or_default()
            .insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_update(
        &mut self,
        cb: impl FnMut(&UpdateEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.events.update.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_update_v2(
        &mut self,
        cb: impl FnMut(&UpdateEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.events.update_v2.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_before_all_transactions(
        &mut self,
        cb: impl FnMut() + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.events.before_all_transactions.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_before_transaction(
        &mut self,
        cb: impl FnMut(&TransactionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.events.before_transaction.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_before_observer_calls(
        &mut self,
        cb: impl FnMut(&TransactionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.events.before_observer_calls.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_after_transaction(
        &mut self,
        cb: impl FnMut(&TransactionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.events.after_transaction.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_after_transaction_cleanup(
        &mut self,
        cb: impl FnMut(&TransactionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.events
            .after_transaction_cleanup
            .insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_after_all_transactions(
        &mut self,
        cb: impl FnMut() + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.events.after_all_transactions.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_subdocs(
        &mut self,
        cb: impl FnMut(&SubdocsEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id();
        self.events.subdocs.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_destroy(&mut self, cb: impl FnMut() + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id();
        self.events.destroy.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_load(&mut self, cb: impl FnMut() + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id();
        self.events.load.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    pub fn on_sync(&mut self, cb: impl FnMut(bool) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_id();
        self.events.sync.insert(id, Box::new(cb));
        SubscriptionId(id)
    }

    /// Removes any subscription created on this document. Returns
    /// `false` when the id is unknown (already removed).
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let key = id.0;
        for cbs in self.observers.values_mut() {
            if cbs.remove(&key).is_some() {
                return true;
            }
        }
        for cbs in self.deep_observers.values_mut() {
            if cbs.remove(&key).is_some() {
                return true;
            }
        }
        let e = &mut self.events;
        e.before_all_transactions.remove(&key).is_some()
            || e.before_transaction.remove(&key).is_some()
            || e.before_observer_calls.remove(&key).is_some()
            || e.after_transaction.remove(&key).is_some()
            || e.after_transaction_cleanup.remove(&key).is_some()
            || e.after_all_transactions.remove(&key).is_some()
            || e.update.remove(&key).is_some()
            || e.update_v2.remove(&key).is_some()
            || e.subdocs.remove(&key).is_some()
            || e.destroy.remove(&key).is_some()
            || e.load.remove(&key).is_some()
            || e.sync.remove(&key).is_some()
    }

    // --- lifecycle ---

    /// Requests loading of this (sub-)document's content from the
    /// host; fires the `load` listeners.
    pub fn load(&mut self) {
        self.store.should_load = true;
        for cb in self.events.load.values_mut() {
            cb();
        }
    }

    /// Signals a transport sync-state change to subscribers.
    pub fn emit_sync(&mut self, synced: bool) {
        for cb in self.events.sync.values_mut() {
            cb(synced);
        }
    }

    /// Fires `destroy` listeners and drops every subscription. The
    /// document keeps its data but stops notifying.
    pub fn destroy(&mut self) {
        for cb in self.events.destroy.values_mut() {
            cb();
        }
        self.events = DocEvents::default();
        self.observers.clear();
        self.deep_observers.clear();
        self.store.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.store.destroyed
    }

    /// Sweeps the whole store and verifies its structural invariants:
    /// per-client clock contiguity, container link symmetry, length
    /// sums, map-tail shape and search-marker coherence. Intended for
    /// tests and debugging.
    pub fn validate(&self) -> Result<(), String> {
        let store = &self.store;
        for (&client, refs) in &store.blocks.clients {
            let mut expected = 0u32;
            for &r in refs {
                let id = store.blocks.id_of(r);
                if id.client != client {
                    return Err(format!("client {client} segment holds id of {}", id.client));
                }
                if id.clock != expected {
                    return Err(format!(
                        "client {client} segment jumps from {expected} to {}",
                        id.clock
                    ));
                }
                if store.blocks.len_of(r) == 0 {
                    return Err(format!("client {client} has a zero-length struct"));
                }
                expected = id.clock + store.blocks.len_of(r);
            }
        }

        for (index, branch) in self.store.branches.iter().enumerate() {
            // Collapsed containers keep an empty shell in the arena.
            let alive = branch.item.map_or(true, |item_ref| {
                self.store.blocks.try_item(item_ref).is_some()
            });
            if !alive {
                continue;
            }
            let mut visible = 0u32;
            let mut prev: Option<crate::store::StructRef> = None;
            let mut cur = branch.start;
            while let Some(r) = cur {
                let Some(item) = store.blocks.try_item(r) else {
                    return Err(format!("branch {index} links a collapsed struct"));
                };
                if item.left != prev {
                    return Err(format!("branch {index} has asymmetric links"));
                }
                if item.parent_sub.is_some() {
                    return Err(format!("branch {index} lists a map item"));
                }
                if !item.is_deleted() && item.is_countable() {
                    visible += item.len;
                }
                prev = cur;
                cur = item.right;
            }
            if visible != branch.content_len {
                return Err(format!(
                    "branch {index} length {} but visible sum {visible}",
                    branch.content_len
                ));
            }
            for (key, &tail) in &branch.map {
                let Some(item) = store.blocks.try_item(tail) else {
                    return Err(format!("branch {index} map {key:?} tail collapsed"));
                };
                if item.right.is_some() {
                    return Err(format!("branch {index} map {key:?} tail has a right"));
                }
                if item.parent_sub.as_deref() != Some(key) {
                    return Err(format!("branch {index} map {key:?} tail key mismatch"));
                }
            }
            for marker in &branch.markers {
                let mut sum = 0u32;
                let mut cur = branch.start;
                while let Some(r) = cur {
                    if r == marker.item {
                        break;
                    }
                    let item = store.blocks.item(r);
                    if !item.is_deleted() && item.is_countable() {
                        sum += item.len;
                    }
                    cur = item.right;
                }
                if cur.is_none() {
                    return Err(format!("branch {index} marker points outside the list"));
                }
                if sum != marker.index {
                    return Err(format!(
                        "branch {index} marker index {} but walk says {sum}",
                        marker.index
                    ));
                }
            }
        }
        Ok(())
    }
}

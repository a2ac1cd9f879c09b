//! Producing and applying binary updates.
//!
//! Incoming updates decode into transit structs: items whose parent is
//! still an id or a root name and whose neighbors are unresolved.
//! Integration drains per-client queues highest client first, chasing
//! missing dependencies across queues with an explicit stack; whatever
//! cannot apply yet is buffered with the state vector it waits for and
//! retried whenever the store advances.

use std::collections::{HashMap, VecDeque};

use serde_json::{Map, Value};

use crate::branch::BranchKind;
use crate::codec::{DecoderV1, DecoderV2, EncoderV1, EncoderV2, UpdateDecoder, UpdateEncoder};
use crate::content::{
    utf16_len, utf16_to_byte_offset, Content, ANY_REF, BINARY_REF, DELETED_REF, DOC_REF,
    EMBED_REF, FORMAT_REF, GC_REF, JSON_REF, SKIP_REF, STRING_REF, TYPE_REF,
};
use crate::delete_set::DeleteSet;
use crate::doc::Doc;
use crate::error::{CodecError, EngineError};
use crate::id::{Id, StateVector};
use crate::item::{delete_item, integrate_gc, integrate_item, range_refs, Item};
use crate::store::{GcRange, Slot, Store};
use crate::transaction::Transaction;

// --- transit model ---

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransitParent {
    Id(Id),
    Root(String),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransitContent {
    Any(Vec<Value>),
    Binary(Vec<u8>),
    Deleted(u32),
    Doc { guid: String, opts: Value },
    Embed(Value),
    Format { key: String, value: Value },
    Json(Vec<Value>),
    String(String),
    Type { kind: BranchKind, name: Option<String> },
}

impl TransitContent {
    fn len(&self) -> u32 {
        match self {
            TransitContent::Any(v) | TransitContent::Json(v) => v.len() as u32,
            TransitContent::String(s) => utf16_len(s),
            TransitContent::Deleted(len) => *len,
            _ => 1,
        }
    }

    fn ref_tag(&self) -> u8 {
        match self {
            TransitContent::Any(_) => ANY_REF,
            TransitContent::Binary(_) => BINARY_REF,
            TransitContent::Deleted(_) => DELETED_REF,
            TransitContent::Doc { .. } => DOC_REF,
            TransitContent::Embed(_) => EMBED_REF,
            TransitContent::Format { .. } => FORMAT_REF,
            TransitContent::Json(_) => JSON_REF,
            TransitContent::String(_) => STRING_REF,
            TransitContent::Type { .. } => TYPE_REF,
        }
    }

    fn split(&mut self, offset: u32) -> TransitContent {
        match self {
            TransitContent::Any(v) => TransitContent::Any(v.split_off(offset as usize)),
            TransitContent::Json(v) => TransitContent::Json(v.split_off(offset as usize)),
            TransitContent::String(s) => {
                let at = utf16_to_byte_offset(s, offset);
                TransitContent::String(s.split_off(at))
            }
            TransitContent::Deleted(len) => {
                let right = *len - offset;
                *len = offset;
                TransitContent::Deleted(right)
            }
            _ => unreachable!("split of non-splittable transit content"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TransitItem {
    pub id: Id,
    pub origin: Option<Id>,
    pub right_origin: Option<Id>,
    pub parent: Option<TransitParent>,
    pub parent_sub: Option<String>,
    pub content: TransitContent,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransitStruct {
    Item(TransitItem),
    Gc { id: Id, len: u32 },
    Skip { id: Id, len: u32 },
}

impl TransitStruct {
    pub fn id(&self) -> Id {
        match self {
            TransitStruct::Item(item) => item.id,
            TransitStruct::Gc { id, .. } | TransitStruct::Skip { id, .. } => *id,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            TransitStruct::Item(item) => item.content.len(),
            TransitStruct::Gc { len, .. } | TransitStruct::Skip { len, .. } => *len,
        }
    }

    fn is_skip(&self) -> bool {
        matches!(self, TransitStruct::Skip { .. })
    }

    /// Splits off the tail starting at `offset` units, leaving `self`
    /// as the head.
    fn split_at(&mut self, offset: u32) -> TransitStruct {
        match self {
            TransitStruct::Gc { id, len } => {
                let right = TransitStruct::Gc {
                    id: Id::new(id.client, id.clock + offset),
                    len: *len - offset,
                };
                *len = offset;
                right
            }
            TransitStruct::Skip { id, len } => {
                let right = TransitStruct::Skip {
                    id: Id::new(id.client, id.clock + offset),
                    len: *len - offset,
                };
                *len = offset;
                right
            }
            TransitStruct::Item(item) => {
                let right_content = item.content.split(offset);
                TransitStruct::Item(TransitItem {
                    id: Id::new(item.id.client, item.id.clock + offset),
                    origin: Some(Id::new(item.id.client, item.id.clock + offset - 1)),
                    right_origin: item.right_origin,
                    parent: item.parent.clone(),
                    parent_sub: item.parent_sub.clone(),
                    content: right_content,
                })
            }
        }
    }
}

/// Structs that arrived before their dependencies, plus the state
/// vector entries they wait for.
pub(crate) struct PendingStructs {
    pub missing: HashMap<u32, u32>,
    pub structs: HashMap<u32, Vec<TransitStruct>>,
}

// --- decode ---

pub(crate) fn read_client_structs<D: UpdateDecoder>(
    dec: &mut D,
) -> Result<HashMap<u32, VecDeque<TransitStruct>>, EngineError> {
    let num_clients = dec.read_var_u32()?;
    let mut out: HashMap<u32, VecDeque<TransitStruct>> = HashMap::new();
    for _ in 0..num_clients {
        let num_structs = dec.read_var_u32()?;
        let client = dec.read_client()?;
        let mut clock = dec.read_var_u32()?;
        let queue = out.entry(client).or_default();
        for _ in 0..num_structs {
            let info = dec.read_info()?;
            match info & 0b0001_1111 {
                GC_REF => {
                    let len = dec.read_len()?;
                    queue.push_back(TransitStruct::Gc {
                        id: Id::new(client, clock),
                        len,
                    });
                    clock += len;
                }
                SKIP_REF => {
                    let len = dec.read_var_u32()?;
                    queue.push_back(TransitStruct::Skip {
                        id: Id::new(client, clock),
                        len,
                    });
                    clock += len;
                }
                _ => {
                    let item = read_transit_item(dec, Id::new(client, clock), info)?;
                    clock += item.content.len();
                    queue.push_back(TransitStruct::Item(item));
                }
            }
        }
    }
    Ok(out)
}

fn read_transit_item<D: UpdateDecoder>(
    dec: &mut D,
    id: Id,
    info: u8,
) -> Result<TransitItem, EngineError> {
    let origin = if info & 0b1000_0000 != 0 {
        Some(dec.read_left_id()?)
    } else {
        None
    };
    let right_origin = if info & 0b0100_0000 != 0 {
        Some(dec.read_right_id()?)
    } else {
        None
    };
    // Parent info travels only when no origin pins the position; the
    // receiver inherits the parent from the resolved neighbor
    // otherwise.
    let derives_parent = origin.is_some() || right_origin.is_some();
    let parent = if derives_parent {
        None
    } else if dec.read_parent_info()? {
        Some(TransitParent::Root(dec.read_string()?))
    } else {
        Some(TransitParent::Id(dec.read_left_id()?))
    };
    let parent_sub = if !derives_parent && info & 0b0010_0000 != 0 {
        Some(dec.read_string()?)
    } else {
        None
    };
    let content = read_transit_content(dec, info & 0b0001_1111)?;
    Ok(TransitItem {
        id,
        origin,
        right_origin,
        parent,
        parent_sub,
        content,
    })
}

fn read_transit_content<D: UpdateDecoder>(
    dec: &mut D,
    ref_tag: u8,
) -> Result<TransitContent, EngineError> {
    Ok(match ref_tag {
        DELETED_REF => TransitContent::Deleted(dec.read_len()?),
        JSON_REF => {
            let len = dec.read_len()?;
            let mut values = Vec::with_capacity(len as usize);
            for _ in 0..len {
                values.push(dec.read_any()?);
            }
            TransitContent::Json(values)
        }
        BINARY_REF => TransitContent::Binary(dec.read_buf()?),
        STRING_REF => TransitContent::String(dec.read_string()?),
        EMBED_REF => TransitContent::Embed(dec.read_any()?),
        FORMAT_REF => TransitContent::Format {
            key: dec.read_key()?,
            value: dec.read_any()?,
        },
        TYPE_REF => {
            let tag = dec.read_type_ref()?;
            let kind = BranchKind::from_type_ref(tag)
                .ok_or(CodecError::UnknownTypeRef(tag))?;
            let name = if matches!(kind, BranchKind::XmlElement | BranchKind::XmlHook) {
                Some(dec.read_key()?)
            } else {
                None
            };
            TransitContent::Type { kind, name }
        }
        ANY_REF => {
            let len = dec.read_len()?;
            let mut values = Vec::with_capacity(len as usize);
            for _ in 0..len {
                values.push(dec.read_any()?);
            }
            TransitContent::Any(values)
        }
        DOC_REF => TransitContent::Doc {
            guid: dec.read_string()?,
            opts: dec.read_any()?,
        },
        other => return Err(CodecError::UnknownContentRef(other).into()),
    })
}

pub(crate) fn read_delete_set<D: UpdateDecoder>(dec: &mut D) -> Result<DeleteSet, EngineError> {
    let num_clients = dec.read_var_u32()?;
    let mut ds = DeleteSet::new();
    for _ in 0..num_clients {
        dec.reset_ds_cur_val();
        let client = dec.read_var_u32()?;
        let num_ranges = dec.read_var_u32()?;
        for _ in 0..num_ranges {
            let clock = dec.read_ds_clock()?;
            let len = dec.read_ds_len()?;
            ds.add(client, clock, len);
        }
    }
    ds.sort_and_merge();
    Ok(ds)
}

// --- encode ---

pub(crate) fn write_delete_set<E: UpdateEncoder>(enc: &mut E, ds: &DeleteSet) {
    let clients = ds.clients_descending();
    enc.rest().var_u32(clients.len() as u32);
    for client in clients {
        enc.reset_ds_cur_val();
        let ranges = ds.ranges(client);
        enc.rest().var_u32(client);
        enc.rest().var_u32(ranges.len() as u32);
        for range in ranges {
            enc.write_ds_clock(range.clock);
            enc.write_ds_len(range.len);
        }
    }
}

/// Encodes every struct above `sv` plus the given delete set.
pub(crate) fn write_update<E: UpdateEncoder>(
    enc: &mut E,
    store: &Store,
    sv: &StateVector,
    ds: &DeleteSet,
) -> Result<(), EngineError> {
    write_store_structs(enc, store, sv)?;
    write_delete_set(enc, ds);
    Ok(())
}

fn write_store_structs<E: UpdateEncoder>(
    enc: &mut E,
    store: &Store,
    sv: &StateVector,
) -> Result<(), EngineError> {
    let mut clients: Vec<(u32, u32)> = Vec::new();
    for (&client, _) in &store.blocks.clients {
        let clock = sv.get(client);
        if store.blocks.get_state(client) > clock {
            clients.push((client, clock));
        }
    }
    clients.sort_unstable_by(|a, b| b.0.cmp(&a.0));
    enc.rest().var_u32(clients.len() as u32);
    for (client, clock) in clients {
        let refs = &store.blocks.clients[&client];
        let first_clock = store.blocks.id_of(refs[0]).clock;
        let clock = clock.max(first_clock);
        let start = store.blocks.find_index(client, clock)?;
        enc.rest().var_u32((refs.len() - start) as u32);
        enc.write_client(client);
        enc.rest().var_u32(clock);
        let first = refs[start];
        write_store_struct(enc, store, first, clock - store.blocks.id_of(first).clock)?;
        for &r in &refs[start + 1..] {
            write_store_struct(enc, store, r, 0)?;
        }
    }
    Ok(())
}

fn write_store_struct<E: UpdateEncoder>(
    enc: &mut E,
    store: &Store,
    r: crate::store::StructRef,
    offset: u32,
) -> Result<(), EngineError> {
    match store.blocks.slot(r) {
        Slot::Gc(gc) => {
            enc.write_info(GC_REF);
            enc.write_len(gc.len - offset);
        }
        Slot::Item(item) => {
            let origin = if offset > 0 {
                Some(Id::new(item.id.client, item.id.clock + offset - 1))
            } else {
                item.origin
            };
            let info = item.content.ref_tag()
                | origin.map_or(0, |_| 0b1000_0000)
                | item.right_origin.map_or(0, |_| 0b0100_0000)
                | item.parent_sub.as_ref().map_or(0, |_| 0b0010_0000);
            enc.write_info(info);
            if let Some(o) = origin {
                enc.write_left_id(o);
            }
            if let Some(o) = item.right_origin {
                enc.write_right_id(o);
            }
            if origin.is_none() && item.right_origin.is_none() {
                let parent = item.parent.ok_or(EngineError::BrokenInvariant(
                    "stored item without parent",
                ))?;
                let branch = store.branch(parent);
                match branch.item {
                    Some(parent_item) => {
                        enc.write_parent_info(false);
                        enc.write_left_id(store.blocks.id_of(parent_item));
                    }
                    None => {
                        enc.write_parent_info(true);
                        enc.write_string(branch.name.as_deref().unwrap_or_default());
                    }
                }
                if let Some(sub) = &item.parent_sub {
                    enc.write_string(sub);
                }
            }
            write_store_content(enc, store, &item.content, offset)?;
        }
        Slot::Free => {
            return Err(EngineError::BrokenInvariant("free slot in client segment"))
        }
    }
    Ok(())
}

fn write_store_content<E: UpdateEncoder>(
    enc: &mut E,
    store: &Store,
    content: &Content,
    offset: u32,
) -> Result<(), EngineError> {
    match content {
        Content::Deleted(len) => enc.write_len(len - offset),
        Content::Json(values) => {
            let values = &values[offset as usize..];
            enc.write_len(values.len() as u32);
            for v in values {
                enc.write_any(v);
            }
        }
        Content::Binary(data) => enc.write_buf(data),
        Content::String(s) => {
            enc.write_string(&s[utf16_to_byte_offset(s, offset)..]);
        }
        Content::Embed(v) => enc.write_any(v),
        Content::Format { key, value } => {
            enc.write_key(key);
            enc.write_any(value);
        }
        Content::Type(b) => {
            let branch = store.branch(*b);
            enc.write_type_ref(branch.kind.type_ref());
            if matches!(branch.kind, BranchKind::XmlElement | BranchKind::XmlHook) {
                enc.write_key(branch.name.as_deref().unwrap_or_default());
            }
        }
        Content::Any(values) => {
            let values = &values[offset as usize..];
            enc.write_len(values.len() as u32);
            for v in values {
                enc.write_any(v);
            }
        }
        Content::Doc(doc) => {
            enc.write_string(doc.guid());
            let mut opts = Map::new();
            opts.insert("autoLoad".to_string(), Value::Bool(doc.auto_load()));
            opts.insert("shouldLoad".to_string(), Value::Bool(doc.should_load()));
            enc.write_any(&Value::Object(opts));
        }
    }
    Ok(())
}

fn write_transit_structs<E: UpdateEncoder>(
    enc: &mut E,
    structs: &HashMap<u32, Vec<TransitStruct>>,
) {
    let mut clients: Vec<u32> = structs
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(&c, _)| c)
        .collect();
    clients.sort_unstable_by(|a, b| b.cmp(a));
    enc.rest().var_u32(clients.len() as u32);
    for client in clients {
        // Gaps inside a client block are carried as skips so the
        // decoder's running clock stays aligned.
        let list = &structs[&client];
        let mut padded: Vec<TransitStruct> = Vec::with_capacity(list.len());
        let mut cur = list[0].id().clock;
        for s in list {
            if s.id().clock > cur {
                padded.push(TransitStruct::Skip {
                    id: Id::new(client, cur),
                    len: s.id().clock - cur,
                });
            }
            cur = s.id().clock + s.len();
            padded.push(s.clone());
        }
        enc.rest().var_u32(padded.len() as u32);
        enc.write_client(client);
        enc.rest().var_u32(padded[0].id().clock);
        for s in &padded {
            write_transit_struct(enc, s);
        }
    }
}

fn write_transit_struct<E: UpdateEncoder>(enc: &mut E, s: &TransitStruct) {
    match s {
        TransitStruct::Gc { len, .. } => {
            enc.write_info(GC_REF);
            enc.write_len(*len);
        }
        TransitStruct::Skip { len, .. } => {
            enc.write_info(SKIP_REF);
            enc.rest().var_u32(*len);
        }
        TransitStruct::Item(item) => {
            let info = item.content.ref_tag()
                | item.origin.map_or(0, |_| 0b1000_0000)
                | item.right_origin.map_or(0, |_| 0b0100_0000)
                | item.parent_sub.as_ref().map_or(0, |_| 0b0010_0000);
            enc.write_info(info);
            if let Some(o) = item.origin {
                enc.write_left_id(o);
            }
            if let Some(o) = item.right_origin {
                enc.write_right_id(o);
            }
            if item.origin.is_none() && item.right_origin.is_none() {
                match &item.parent {
                    Some(TransitParent::Root(name)) => {
                        enc.write_parent_info(true);
                        enc.write_string(name);
                    }
                    Some(TransitParent::Id(id)) => {
                        enc.write_parent_info(false);
                        enc.write_left_id(*id);
                    }
                    None => {
                        // A decoded item always carries a parent when
                        // both origins are absent; treat the hole as
                        // an empty root name.
                        enc.write_parent_info(true);
                        enc.write_string("");
                    }
                }
                if let Some(sub) = &item.parent_sub {
                    enc.write_string(sub);
                }
            }
            write_transit_content(enc, &item.content);
        }
    }
}

fn write_transit_content<E: UpdateEncoder>(enc: &mut E, content: &TransitContent) {
    match content {
        TransitContent::Deleted(len) => enc.write_len(*len),
        TransitContent::Json(values) => {
            enc.write_len(values.len() as u32);
            for v in values {
                enc.write_any(v);
            }
        }
        TransitContent::Binary(data) => enc.write_buf(data),
        TransitContent::String(s) => enc.write_string(s),
        TransitContent::Embed(v) => enc.write_any(v),
        TransitContent::Format { key, value } => {
            enc.write_key(key);
            enc.write_any(value);
        }
        TransitContent::Type { kind, name } => {
            enc.write_type_ref(kind.type_ref());
            if matches!(kind, BranchKind::XmlElement | BranchKind::XmlHook) {
                enc.write_key(name.as_deref().unwrap_or_default());
            }
        }
        TransitContent::Any(values) => {
            enc.write_len(values.len() as u32);
            for v in values {
                enc.write_any(v);
            }
        }
        TransitContent::Doc { guid, opts } => {
            enc.write_string(guid);
            enc.write_any(opts);
        }
    }
}

// --- integration ---

fn transit_missing(store: &Store, s: &TransitStruct) -> Option<u32> {
    let TransitStruct::Item(item) = s else {
        return None;
    };
    if let Some(o) = item.origin {
        if o.client != item.id.client && o.clock >= store.blocks.get_state(o.client) {
            return Some(o.client);
        }
    }
    if let Some(o) = item.right_origin {
        if o.client != item.id.client && o.clock >= store.blocks.get_state(o.client) {
            return Some(o.client);
        }
    }
    if let Some(TransitParent::Id(p)) = &item.parent {
        if p.client != item.id.client && p.clock >= store.blocks.get_state(p.client) {
            return Some(p.client);
        }
    }
    None
}

/// Resolves a transit item against the store: origins become real
/// neighbors (splitting on demand), the parent becomes a branch, and
/// the content becomes store content.
fn prepare_item(txn: &mut Transaction<'_>, t: TransitItem) -> Result<Item, EngineError> {
    let mut left = None;
    let mut right = None;
    if let Some(origin) = t.origin {
        left = Some(crate::item::get_item_clean_end(txn, origin)?);
    }
    if let Some(right_origin) = t.right_origin {
        right = Some(crate::item::get_item_clean_start(txn, right_origin)?);
    }
    let left_gc = left.map(|l| txn.store.blocks.is_gc(l)).unwrap_or(false);
    let right_gc = right.map(|r| txn.store.blocks.is_gc(r)).unwrap_or(false);

    let mut parent: Option<crate::branch::BranchRef> = None;
    let mut parent_sub = t.parent_sub;
    if left_gc || right_gc {
        // A collected neighbor means the container is gone; the item
        // degrades to a clock range.
    } else {
        match t.parent {
            None => {
                if let Some(l) = left {
                    if let Some(li) = txn.store.blocks.try_item(l) {
                        parent = li.parent;
                        parent_sub = li.parent_sub.clone();
                    }
                }
                if parent.is_none() {
                    if let Some(r) = right {
                        if let Some(ri) = txn.store.blocks.try_item(r) {
                            parent = ri.parent;
                            parent_sub = ri.parent_sub.clone();
                        }
                    }
                }
            }
            Some(TransitParent::Root(name)) => {
                parent = Some(txn.store.root_or_create_abstract(&name));
            }
            Some(TransitParent::Id(pid)) => {
                parent = match txn.store.blocks.find(pid) {
                    Some(pr) => match txn.store.blocks.try_item(pr) {
                        Some(pi) => match &pi.content {
                            Content::Type(b) => Some(*b),
                            _ => None,
                        },
                        None => None,
                    },
                    None => None,
                };
            }
        }
    }

    let content = store_content(txn, t.content)?;
    Ok(Item::new(
        t.id,
        t.origin,
        t.right_origin,
        left,
        right,
        parent,
        parent_sub,
        content,
    ))
}

fn store_content(txn: &mut Transaction<'_>, content: TransitContent) -> Result<Content, EngineError> {
    Ok(match content {
        TransitContent::Any(v) => Content::Any(v),
        TransitContent::Binary(b) => Content::Binary(b),
        TransitContent::Deleted(len) => Content::Deleted(len),
        TransitContent::Doc { guid, opts } => {
            Content::Doc(Box::new(Doc::subdoc_shell(guid, &opts)))
        }
        TransitContent::Embed(v) => Content::Embed(v),
        TransitContent::Format { key, value } => Content::Format { key, value },
        TransitContent::Json(v) => Content::Json(v),
        TransitContent::String(s) => Content::String(s),
        TransitContent::Type { kind, name } => {
            let branch = crate::branch::Branch::new(kind, name);
            Content::Type(txn.store.alloc_branch(branch))
        }
    })
}

fn integrate_transit(
    txn: &mut Transaction<'_>,
    s: TransitStruct,
    offset: u32,
) -> Result<(), EngineError> {
    match s {
        TransitStruct::Skip { .. } => Ok(()),
        TransitStruct::Gc { id, len } => {
            integrate_gc(txn, GcRange { id, len }, offset)?;
            Ok(())
        }
        TransitStruct::Item(t) => {
            let item = prepare_item(txn, t)?;
            integrate_item(txn, item, offset)?;
            Ok(())
        }
    }
}

/// Drains the per-client queues into the store, highest client id
/// first. Returns the buffer of structs whose causal dependencies are
/// still missing.
pub(crate) fn integrate_structs(
    txn: &mut Transaction<'_>,
    queues: &mut HashMap<u32, VecDeque<TransitStruct>>,
) -> Result<Option<PendingStructs>, EngineError> {
    let mut client_ids: Vec<u32> = queues.keys().copied().collect();
    client_ids.sort_unstable();
    let mut rest: HashMap<u32, Vec<TransitStruct>> = HashMap::new();
    let mut missing_sv: HashMap<u32, u32> = HashMap::new();
    let mut stack: Vec<TransitStruct> = Vec::new();

    fn missing_min(missing: &mut HashMap<u32, u32>, client: u32, clock: u32) {
        let entry = missing.entry(client).or_insert(clock);
        if *entry > clock {
            *entry = clock;
        }
    }

    fn flush_stack(
        stack: &mut Vec<TransitStruct>,
        queues: &mut HashMap<u32, VecDeque<TransitStruct>>,
        client_ids: &mut Vec<u32>,
        rest: &mut HashMap<u32, Vec<TransitStruct>>,
    ) {
        for item in stack.drain(..) {
            let client = item.id().client;
            let bucket = rest.entry(client).or_default();
            bucket.push(item);
            if let Some(queue) = queues.remove(&client) {
                bucket.extend(queue);
            }
            client_ids.retain(|&c| c != client);
        }
    }

    fn next_target(
        client_ids: &mut Vec<u32>,
        queues: &mut HashMap<u32, VecDeque<TransitStruct>>,
    ) -> Option<TransitStruct> {
        while let Some(&client) = client_ids.last() {
            if let Some(head) = queues.get_mut(&client).and_then(VecDeque::pop_front) {
                return Some(head);
            }
            client_ids.pop();
        }
        None
    }

    let Some(mut stack_head) = next_target(&mut client_ids, queues) else {
        return Ok(None);
    };

    loop {
        if !stack_head.is_skip() {
            let id = stack_head.id();
            let len = stack_head.len();
            let local_clock = txn.store.blocks.get_state(id.client);
            if local_clock < id.clock {
                // A gap in this client's own history; everything on
                // the stack waits behind it.
                stack.push(stack_head);
                missing_min(&mut missing_sv, id.client, id.clock - 1);
                flush_stack(&mut stack, queues, &mut client_ids, &mut rest);
            } else {
                let offset = local_clock - id.clock;
                match transit_missing(txn.store, &stack_head) {
                    Some(missing_client) => {
                        stack.push(stack_head);
                        match queues
                            .get_mut(&missing_client)
                            .and_then(VecDeque::pop_front)
                        {
                            Some(next) => {
                                // The dependency may still be in this
                                // update; switch to its queue.
                                stack_head = next;
                                continue;
                            }
                            None => {
                                missing_min(
                                    &mut missing_sv,
                                    missing_client,
                                    txn.store.blocks.get_state(missing_client),
                                );
                                flush_stack(&mut stack, queues, &mut client_ids, &mut rest);
                            }
                        }
                    }
                    None => {
                        if offset < len {
                            integrate_transit(txn, stack_head, offset)?;
                        }
                        // Fully known structs are dropped.
                    }
                }
            }
        }
        stack_head = match stack.pop() {
            Some(next) => next,
            None => match next_target(&mut client_ids, queues) {
                Some(next) => next,
                None => break,
            },
        };
    }

    if rest.is_empty() {
        Ok(None)
    } else {
        for bucket in rest.values_mut() {
            *bucket = normalize_client_structs(std::mem::take(bucket));
        }
        Ok(Some(PendingStructs {
            missing: missing_sv,
            structs: rest,
        }))
    }
}

/// Sorts by clock, drops covered duplicates, and trims partial
/// overlaps. Skips are recomputed from the gaps, so input skips are
/// discarded.
fn normalize_client_structs(structs: Vec<TransitStruct>) -> Vec<TransitStruct> {
    let mut items: Vec<TransitStruct> = structs.into_iter().filter(|s| !s.is_skip()).collect();
    items.sort_by_key(|s| (s.id().clock, matches!(s, TransitStruct::Gc { .. }) as u8));
    let mut out: Vec<TransitStruct> = Vec::new();
    for mut s in items {
        match out.last() {
            Some(last) => {
                let covered = last.id().clock + last.len();
                let clock = s.id().clock;
                if clock + s.len() <= covered {
                    continue;
                }
                if clock < covered {
                    s = s.split_at(covered - clock);
                }
                out.push(s);
            }
            None => out.push(s),
        }
    }
    out
}

fn merge_pending(mut a: PendingStructs, b: PendingStructs) -> PendingStructs {
    for (client, clock) in b.missing {
        let entry = a.missing.entry(client).or_insert(clock);
        if *entry > clock {
            *entry = clock;
        }
    }
    for (client, structs) in b.structs {
        a.structs.entry(client).or_default().extend(structs);
    }
    for bucket in a.structs.values_mut() {
        *bucket = normalize_client_structs(std::mem::take(bucket));
    }
    a
}

/// Marks the delete-set ranges as deleted, splitting structs at range
/// boundaries. Ranges in clock space we have not seen yet are returned
/// for buffering.
pub(crate) fn apply_delete_set(
    txn: &mut Transaction<'_>,
    ds: &DeleteSet,
) -> Result<Option<DeleteSet>, EngineError> {
    let mut unapplied = DeleteSet::new();
    for (client, ranges) in ds.iter() {
        let state = txn.store.blocks.get_state(client);
        for range in ranges {
            let clock = range.clock;
            let end = range.end();
            if clock < state {
                if state < end {
                    unapplied.add(client, state, end - state);
                }
                let covered = end.min(state);
                for r in range_refs(txn, client, clock, covered - clock)? {
                    if let Slot::Item(item) = txn.store.blocks.slot(r) {
                        if !item.is_deleted() {
                            delete_item(txn, r);
                        }
                    }
                }
            } else {
                unapplied.add(client, clock, end - clock);
            }
        }
    }
    if unapplied.is_empty() {
        Ok(None)
    } else {
        unapplied.sort_and_merge();
        Ok(Some(unapplied))
    }
}

/// Applies one decoded update inside an open transaction, draining the
/// pending buffers whenever the incoming structs unlock them.
pub(crate) fn apply_update_impl<D: UpdateDecoder>(
    txn: &mut Transaction<'_>,
    dec: &mut D,
) -> Result<(), EngineError> {
    let mut queues = read_client_structs(dec)?;
    let fresh_rest = integrate_structs(txn, &mut queues)?;
    match (txn.store.pending_structs.take(), fresh_rest) {
        (Some(pending), rest) => {
            let merged = match rest {
                Some(rest) => merge_pending(pending, rest),
                None => pending,
            };
            txn.store.pending_structs = Some(merged);
        }
        (None, rest) => txn.store.pending_structs = rest,
    }

    let ds = read_delete_set(dec)?;
    let mut unapplied = apply_delete_set(txn, &ds)?.unwrap_or_default();
    if let Some(pending_ds) = txn.store.pending_ds.take() {
        if let Some(still) = apply_delete_set(txn, &pending_ds)? {
            unapplied.merge(still);
        }
    }
    if unapplied.is_empty() {
        txn.store.pending_ds = None;
    } else {
        unapplied.sort_and_merge();
        txn.store.pending_ds = Some(unapplied);
    }

    // Retry buffered structs while the store keeps advancing past
    // their recorded dependencies.
    loop {
        let Some(pending) = txn.store.pending_structs.take() else {
            break;
        };
        let progress = pending
            .missing
            .iter()
            .any(|(&client, &clock)| clock < txn.store.blocks.get_state(client));
        if !progress {
            txn.store.pending_structs = Some(pending);
            break;
        }
        let mut queues: HashMap<u32, VecDeque<TransitStruct>> = pending
            .structs
            .into_iter()
            .map(|(client, structs)| (client, structs.into_iter().collect()))
            .collect();
        txn.store.pending_structs = integrate_structs(txn, &mut queues)?;
        if let Some(pending_ds) = txn.store.pending_ds.take() {
            txn.store.pending_ds = apply_delete_set(txn, &pending_ds)?;
        }
    }
    Ok(())
}

// --- state vectors ---

pub(crate) fn encode_state_vector_bytes(sv: &StateVector) -> Vec<u8> {
    let mut w = weave_buffers::Writer::new();
    w.var_u32(sv.len() as u32);
    for client in sv.clients_descending() {
        w.var_u32(client);
        w.var_u32(sv.get(client));
    }
    w.flush()
}

pub(crate) fn decode_state_vector_bytes(data: &[u8]) -> Result<StateVector, EngineError> {
    let mut r = weave_buffers::Reader::new(data);
    let len = r.var_u32().map_err(CodecError::from)?;
    let mut sv = StateVector::new();
    for _ in 0..len {
        let client = r.var_u32().map_err(CodecError::from)?;
        let clock = r.var_u32().map_err(CodecError::from)?;
        sv.set_max(client, clock);
    }
    Ok(sv)
}

// --- update-level operations ---

fn decode_update<D: UpdateDecoder>(
    dec: &mut D,
) -> Result<(HashMap<u32, Vec<TransitStruct>>, DeleteSet), EngineError> {
    let queues = read_client_structs(dec)?;
    let ds = read_delete_set(dec)?;
    let structs = queues
        .into_iter()
        .map(|(client, queue)| (client, queue.into_iter().collect()))
        .collect();
    Ok((structs, ds))
}

fn merge_updates_impl<'a, D, E, F>(
    updates: &'a [impl AsRef<[u8]>],
    mut make_decoder: F,
    mut enc: E,
) -> Result<Vec<u8>, EngineError>
where
    D: UpdateDecoder + 'a,
    E: UpdateEncoder,
    F: FnMut(&'a [u8]) -> Result<D, EngineError>,
{
    let mut structs: HashMap<u32, Vec<TransitStruct>> = HashMap::new();
    let mut ds = DeleteSet::new();
    for update in updates {
        let mut dec = make_decoder(update.as_ref())?;
        let (more, more_ds) = decode_update(&mut dec)?;
        for (client, list) in more {
            structs.entry(client).or_default().extend(list);
        }
        ds.merge(more_ds);
    }
    for bucket in structs.values_mut() {
        *bucket = normalize_client_structs(std::mem::take(bucket));
    }
    structs.retain(|_, v| !v.is_empty());
    ds.sort_and_merge();
    write_transit_structs(&mut enc, &structs);
    write_delete_set(&mut enc, &ds);
    Ok(enc.finish())
}

/// Merges V1 updates into one equivalent V1 update. Disjoint updates
/// combine order-insensitively; overlapping slices of one history
/// dedupe.
pub fn merge_updates_v1(updates: &[impl AsRef<[u8]>]) -> Result<Vec<u8>, EngineError> {
    merge_updates_impl(updates, |data| Ok(DecoderV1::new(data)), EncoderV1::new())
}

/// V2 counterpart of [`merge_updates_v1`].
pub fn merge_updates_v2(updates: &[impl AsRef<[u8]>]) -> Result<Vec<u8>, EngineError> {
    merge_updates_impl(
        updates,
        |data| DecoderV2::new(data).map_err(EngineError::from),
        EncoderV2::new(),
    )
}

fn diff_update_impl<D: UpdateDecoder, E: UpdateEncoder>(
    dec: &mut D,
    mut enc: E,
    sv: &StateVector,
) -> Result<Vec<u8>, EngineError> {
    let (mut structs, ds) = decode_update(dec)?;
    for (&client, bucket) in structs.iter_mut() {
        let horizon = sv.get(client);
        let mut kept: Vec<TransitStruct> = Vec::new();
        for mut s in std::mem::take(bucket) {
            let clock = s.id().clock;
            let end = clock + s.len();
            if end <= horizon {
                continue;
            }
            if clock < horizon {
                s = s.split_at(horizon - clock);
            }
            kept.push(s);
        }
        *bucket = kept;
    }
    structs.retain(|_, v| !v.is_empty());
    write_transit_structs(&mut enc, &structs);
    write_delete_set(&mut enc, &ds);
    Ok(enc.finish())
}

/// Returns the subset of `update` not yet covered by the encoded state
/// vector. The delete set rides along unchanged.
pub fn diff_update_v1(update: &[u8], state_vector: &[u8]) -> Result<Vec<u8>, EngineError> {
    let sv = decode_state_vector_bytes(state_vector)?;
    diff_update_impl(&mut DecoderV1::new(update), EncoderV1::new(), &sv)
}

/// V2 counterpart of [`diff_update_v1`].
pub fn diff_update_v2(update: &[u8], state_vector: &[u8]) -> Result<Vec<u8>, EngineError> {
    let sv = decode_state_vector_bytes(state_vector)?;
    diff_update_impl(&mut DecoderV2::new(update)?, EncoderV2::new(), &sv)
}

fn sv_from_update_impl<D: UpdateDecoder>(dec: &mut D) -> Result<StateVector, EngineError> {
    let queues = read_client_structs(dec)?;
    let mut sv = StateVector::new();
    for (client, queue) in queues {
        if let Some(last) = queue.back() {
            sv.set_max(client, last.id().clock + last.len());
        }
    }
    Ok(sv)
}

/// Computes the state vector a document would reach after applying
/// `update` to matching history, without needing the document.
pub fn encode_state_vector_from_update_v1(update: &[u8]) -> Result<Vec<u8>, EngineError> {
    let sv = sv_from_update_impl(&mut DecoderV1::new(update))?;
    Ok(encode_state_vector_bytes(&sv))
}

/// V2 counterpart of [`encode_state_vector_from_update_v1`].
pub fn encode_state_vector_from_update_v2(update: &[u8]) -> Result<Vec<u8>, EngineError> {
    let sv = sv_from_update_impl(&mut DecoderV2::new(update)?)?;
    Ok(encode_state_vector_bytes(&sv))
}

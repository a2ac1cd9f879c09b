//! Shared container operations.
//!
//! The typed handles (`ArrayRef`, `MapRef`, `TextRef`, XML kinds) are
//! thin wrappers over the list and map generics here: positional
//! lookup through the search-marker cache, input coalescing into
//! content runs, and last-writer map chains.

mod array;
mod map;
mod text;
mod xml;

pub use self::array::ArrayRef;
pub use self::map::MapRef;
pub use self::text::TextRef;
pub use self::xml::{XmlElementRef, XmlFragmentRef, XmlHookRef, XmlTextRef};

use serde_json::{Map as JsonMap, Value};

use crate::branch::{Branch, BranchKind, BranchRef};
use crate::content::Content;
use crate::doc::Doc;
use crate::error::EngineError;
use crate::id::Id;
use crate::item::{delete_item, get_item_clean_start, integrate_item, Item};
use crate::marker::{find_marker, update_marker_changes};
use crate::store::{Store, StructRef};
use crate::transaction::Transaction;

/// A value on its way into a shared container.
///
/// JSON primitives coalesce into one content run per contiguous group;
/// everything else becomes its own item. Container variants are
/// prelims: their content is buffered until the container integrates,
/// then flushed into it.
pub enum In {
    /// A JSON value stored as-is.
    Any(Value),
    /// A byte blob.
    Bytes(Vec<u8>),
    /// A nested array built from the given children.
    Array(Vec<In>),
    /// A nested map built from the given entries.
    Map(Vec<(String, In)>),
    /// A nested text initialized with the given string.
    Text(String),
    /// An empty XML element with the given tag name.
    XmlElement(String),
    /// A nested XML text initialized with the given string.
    XmlText(String),
    /// An independent sub-document.
    Doc(Box<Doc>),
}

impl From<Value> for In {
    fn from(v: Value) -> Self {
        In::Any(v)
    }
}

impl From<&str> for In {
    fn from(v: &str) -> Self {
        In::Any(Value::String(v.to_string()))
    }
}

impl From<String> for In {
    fn from(v: String) -> Self {
        In::Any(Value::String(v))
    }
}

impl From<i64> for In {
    fn from(v: i64) -> Self {
        In::Any(Value::from(v))
    }
}

impl From<f64> for In {
    fn from(v: f64) -> Self {
        In::Any(Value::from(v))
    }
}

impl From<bool> for In {
    fn from(v: bool) -> Self {
        In::Any(Value::Bool(v))
    }
}

/// What still has to happen after the item carrying a nested container
/// integrated.
enum NestedInit {
    None,
    Array(Vec<In>),
    Map(Vec<(String, In)>),
    Text(String),
}

fn content_for(txn: &mut Transaction<'_>, value: In) -> (Content, Option<BranchRef>, NestedInit) {
    match value {
        In::Any(v) => (Content::Any(vec![v]), None, NestedInit::None),
        In::Bytes(data) => (Content::Binary(data), None, NestedInit::None),
        In::Array(children) => {
            let b = txn.store.alloc_branch(Branch::new(BranchKind::Array, None));
            (Content::Type(b), Some(b), NestedInit::Array(children))
        }
        In::Map(entries) => {
            let b = txn.store.alloc_branch(Branch::new(BranchKind::Map, None));
            (Content::Type(b), Some(b), NestedInit::Map(entries))
        }
        In::Text(s) => {
            let b = txn.store.alloc_branch(Branch::new(BranchKind::Text, None));
            (Content::Type(b), Some(b), NestedInit::Text(s))
        }
        In::XmlElement(name) => {
            let b = txn
                .store
                .alloc_branch(Branch::new(BranchKind::XmlElement, Some(name)));
            (Content::Type(b), Some(b), NestedInit::None)
        }
        In::XmlText(s) => {
            let b = txn.store.alloc_branch(Branch::new(BranchKind::XmlText, None));
            (Content::Type(b), Some(b), NestedInit::Text(s))
        }
        In::Doc(doc) => (Content::Doc(doc), None, NestedInit::None),
    }
}

fn flush_nested(
    txn: &mut Transaction<'_>,
    branch: Option<BranchRef>,
    init: NestedInit,
) -> Result<(), EngineError> {
    let Some(branch) = branch else { return Ok(()) };
    match init {
        NestedInit::None => Ok(()),
        NestedInit::Array(children) => list_insert_after(txn, branch, None, children),
        NestedInit::Map(entries) => {
            for (key, value) in entries {
                map_set(txn, branch, &key, value)?;
            }
            Ok(())
        }
        NestedInit::Text(s) => text_insert_after(txn, branch, None, &s),
    }
}

/// Creates and integrates one item authored by the local client.
fn integrate_new_item(
    txn: &mut Transaction<'_>,
    parent: BranchRef,
    left: Option<StructRef>,
    right: Option<StructRef>,
    parent_sub: Option<String>,
    content: Content,
) -> Result<StructRef, EngineError> {
    let client = txn.store.client_id;
    let clock = txn.store.blocks.get_state(client);
    let origin = left.map(|l| txn.store.blocks.last_id_of(l));
    let right_origin = right.map(|r| txn.store.blocks.id_of(r));
    let item = Item::new(
        Id::new(client, clock),
        origin,
        right_origin,
        left,
        right,
        Some(parent),
        parent_sub,
        content,
    );
    integrate_item(txn, item, 0)
}

/// Inserts `values` after `reference` (at the head when `None`),
/// coalescing contiguous JSON primitives into single runs.
pub(crate) fn list_insert_after(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    reference: Option<StructRef>,
    values: Vec<In>,
) -> Result<(), EngineError> {
    let mut left = reference;
    let right = match reference {
        Some(r) => txn.store.blocks.item(r).right,
        None => txn.store.branch(branch).start,
    };
    let mut run: Vec<Value> = Vec::new();
    for value in values {
        match value {
            In::Any(v) => run.push(v),
            other => {
                if !run.is_empty() {
                    left = Some(integrate_new_item(
                        txn,
                        branch,
                        left,
                        right,
                        None,
                        Content::Any(std::mem::take(&mut run)),
                    )?);
                }
                let (content, nested_branch, init) = content_for(txn, other);
                left = Some(integrate_new_item(txn, branch, left, right, None, content)?);
                flush_nested(txn, nested_branch, init)?;
            }
        }
    }
    if !run.is_empty() {
        integrate_new_item(txn, branch, left, right, None, Content::Any(run))?;
    }
    Ok(())
}

/// Walks the list to `index`, splitting the covering item so the
/// returned reference ends exactly there. `None` means the head.
fn find_list_position(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    index: u32,
) -> Result<Option<StructRef>, EngineError> {
    if index == 0 {
        return Ok(None);
    }
    let mut remaining = index;
    let mut n = txn.store.branch(branch).start;
    if let Some((mitem, mindex)) = find_marker(txn, branch, index) {
        n = Some(mitem);
        remaining -= mindex;
        if remaining == 0 {
            // Step to the previous visible item so the walk below can
            // land on its tail.
            n = prev_visible(txn.store, mitem);
            if let Some(p) = n {
                let item = txn.store.blocks.item(p);
                if !item.is_deleted() && item.is_countable() {
                    remaining += item.len;
                }
            }
        }
    }
    while let Some(cur) = n {
        let (deleted, countable, len, id) = {
            let item = txn.store.blocks.item(cur);
            (item.is_deleted(), item.is_countable(), item.len, item.id)
        };
        if !deleted && countable {
            if remaining <= len {
                if remaining < len {
                    get_item_clean_start(txn, Id::new(id.client, id.clock + remaining))?;
                }
                return Ok(Some(cur));
            }
            remaining -= len;
        }
        n = txn.store.blocks.item(cur).right;
    }
    Err(EngineError::LengthExceeded {
        index,
        len: txn.store.branch(branch).content_len,
    })
}

fn prev_visible(store: &Store, r: StructRef) -> Option<StructRef> {
    let mut n = store.blocks.item(r).left;
    while let Some(cur) = n {
        if !store.blocks.item(cur).is_deleted() {
            return Some(cur);
        }
        n = store.blocks.item(cur).left;
    }
    None
}

pub(crate) fn list_insert(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    index: u32,
    values: Vec<In>,
) -> Result<(), EngineError> {
    let len = txn.store.branch(branch).content_len;
    if index > len {
        return Err(EngineError::LengthExceeded { index, len });
    }
    let count = values.len() as u32;
    let reference = find_list_position(txn, branch, index)?;
    if txn.store.branch(branch).kind.uses_markers() {
        update_marker_changes(txn, branch, index, count as i64);
    }
    list_insert_after(txn, branch, reference, values)
}

pub(crate) fn list_delete(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    index: u32,
    length: u32,
) -> Result<(), EngineError> {
    if length == 0 {
        return Ok(());
    }
    let len = txn.store.branch(branch).content_len;
    if index + length > len {
        return Err(EngineError::LengthExceeded {
            index: index + length,
            len,
        });
    }
    let mut remaining = length;
    let mut n = match find_list_position(txn, branch, index)? {
        // The reference ends at `index`; deletion starts right of it.
        Some(r) => txn.store.blocks.item(r).right,
        None => txn.store.branch(branch).start,
    };
    while remaining > 0 {
        let Some(cur) = n else { break };
        let deleted = txn.store.blocks.item(cur).is_deleted();
        if !deleted {
            let (id, len) = {
                let item = txn.store.blocks.item(cur);
                (item.id, item.len)
            };
            if remaining < len {
                get_item_clean_start(txn, Id::new(id.client, id.clock + remaining))?;
            }
            let covered = txn.store.blocks.item(cur).len;
            delete_item(txn, cur);
            remaining -= covered;
        }
        n = txn.store.blocks.item(cur).right;
    }
    if remaining > 0 {
        return Err(EngineError::BrokenInvariant(
            "container length disagrees with its list",
        ));
    }
    if txn.store.branch(branch).kind.uses_markers() {
        update_marker_changes(txn, branch, index, -(length as i64));
    }
    Ok(())
}

/// Inserts a text run after `reference` as one string item.
pub(crate) fn text_insert_after(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    reference: Option<StructRef>,
    text: &str,
) -> Result<(), EngineError> {
    if text.is_empty() {
        return Ok(());
    }
    let right = match reference {
        Some(r) => txn.store.blocks.item(r).right,
        None => txn.store.branch(branch).start,
    };
    integrate_new_item(
        txn,
        branch,
        reference,
        right,
        None,
        Content::String(text.to_string()),
    )?;
    Ok(())
}

pub(crate) fn text_insert(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    index: u32,
    text: &str,
) -> Result<(), EngineError> {
    if text.is_empty() {
        return Ok(());
    }
    let len = txn.store.branch(branch).content_len;
    if index > len {
        return Err(EngineError::LengthExceeded { index, len });
    }
    let reference = find_list_position(txn, branch, index)?;
    if txn.store.branch(branch).kind.uses_markers() {
        update_marker_changes(txn, branch, index, crate::content::utf16_len(text) as i64);
    }
    text_insert_after(txn, branch, reference, text)
}

/// Sets `key`: a new item chained onto the key's current tail. Old
/// values become tombstones reachable through `.left`.
pub(crate) fn map_set(
    txn: &mut Transaction<'_>,
    branch: BranchRef,
    key: &str,
    value: In,
) -> Result<(), EngineError> {
    let left = txn.store.branch(branch).map.get(key).copied();
    let (content, nested_branch, init) = content_for(txn, value);
    integrate_new_item(txn, branch, left, None, Some(key.to_string()), content)?;
    flush_nested(txn, nested_branch, init)
}

pub(crate) fn map_delete(txn: &mut Transaction<'_>, branch: BranchRef, key: &str) {
    if let Some(&tail) = txn.store.branch(branch).map.get(key) {
        if !txn.store.blocks.item(tail).is_deleted() {
            delete_item(txn, tail);
        }
    }
}

pub(crate) fn map_get(store: &Store, branch: BranchRef, key: &str) -> Option<Value> {
    let &tail = store.branch(branch).map.get(key)?;
    if store.blocks.item(tail).is_deleted() {
        return None;
    }
    chunk_values(store, tail).pop()
}

/// Live (undeleted) map keys.
pub(crate) fn map_keys(store: &Store, branch: BranchRef) -> Vec<String> {
    let mut keys: Vec<String> = store
        .branch(branch)
        .map
        .iter()
        .filter(|(_, &tail)| !store.blocks.item(tail).is_deleted())
        .map(|(k, _)| k.clone())
        .collect();
    keys.sort_unstable();
    keys
}

/// Values of one item, strings kept as one chunk.
pub(crate) fn chunk_values(store: &Store, r: StructRef) -> Vec<Value> {
    let item = store.blocks.item(r);
    match &item.content {
        Content::String(s) => vec![Value::String(s.clone())],
        Content::Type(b) => vec![branch_to_json(store, *b)],
        Content::Doc(doc) => vec![Value::String(doc.guid().to_string())],
        other => other.values(),
    }
}

/// Values of one item, one entry per countable unit.
pub(crate) fn unit_values(store: &Store, r: StructRef) -> Vec<Value> {
    let item = store.blocks.item(r);
    match &item.content {
        Content::Type(b) => vec![branch_to_json(store, *b)],
        Content::Doc(doc) => vec![Value::String(doc.guid().to_string())],
        other => other.values(),
    }
}

pub(crate) fn list_get(store: &Store, branch: BranchRef, index: u32) -> Option<Value> {
    let mut remaining = index;
    let mut n = store.branch(branch).start;
    while let Some(cur) = n {
        let item = store.blocks.item(cur);
        if !item.is_deleted() && item.is_countable() {
            if remaining < item.len {
                return unit_values(store, cur).get(remaining as usize).cloned();
            }
            remaining -= item.len;
        }
        n = item.right;
    }
    None
}

pub(crate) fn list_slice(store: &Store, branch: BranchRef, start: u32, end: u32) -> Vec<Value> {
    let mut out = Vec::new();
    let mut pos = 0u32;
    let mut n = store.branch(branch).start;
    while let Some(cur) = n {
        if pos >= end {
            break;
        }
        let item = store.blocks.item(cur);
        if !item.is_deleted() && item.is_countable() {
            if pos + item.len > start {
                let values = unit_values(store, cur);
                for (i, v) in values.into_iter().enumerate() {
                    let at = pos + i as u32;
                    if at >= start && at < end {
                        out.push(v);
                    }
                }
            }
            pos += item.len;
        }
        n = item.right;
    }
    out
}

pub(crate) fn text_string(store: &Store, branch: BranchRef) -> String {
    let mut out = String::new();
    let mut n = store.branch(branch).start;
    while let Some(cur) = n {
        let item = store.blocks.item(cur);
        if !item.is_deleted() {
            if let Content::String(s) = &item.content {
                out.push_str(s);
            }
        }
        n = item.right;
    }
    out
}

/// JSON view of a container, nested containers rendered recursively.
pub(crate) fn branch_to_json(store: &Store, branch: BranchRef) -> Value {
    let b = store.branch(branch);
    match b.kind {
        BranchKind::Array | BranchKind::XmlFragment => {
            Value::Array(list_slice(store, branch, 0, b.content_len))
        }
        // An unspecialized root renders by what it holds.
        BranchKind::Abstract if b.start.is_some() => {
            Value::Array(list_slice(store, branch, 0, b.content_len))
        }
        BranchKind::Map | BranchKind::XmlHook | BranchKind::Abstract => {
            let mut out = JsonMap::new();
            for key in map_keys(store, branch) {
                if let Some(v) = map_get(store, branch, &key) {
                    out.insert(key, v);
                }
            }
            Value::Object(out)
        }
        BranchKind::Text | BranchKind::XmlText => Value::String(text_string(store, branch)),
        BranchKind::XmlElement => {
            let mut out = JsonMap::new();
            out.insert(
                "name".to_string(),
                Value::String(b.name.clone().unwrap_or_default()),
            );
            let mut attrs = JsonMap::new();
            for key in map_keys(store, branch) {
                if let Some(v) = map_get(store, branch, &key) {
                    attrs.insert(key, v);
                }
            }
            out.insert("attributes".to_string(), Value::Object(attrs));
            out.insert(
                "children".to_string(),
                Value::Array(list_slice(store, branch, 0, b.content_len)),
            );
            Value::Object(out)
        }
    }
}

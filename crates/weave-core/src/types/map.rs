//! Shared key/value map with last-writer-wins keys.

use serde_json::{Map as JsonMap, Value};

use crate::branch::{BranchKind, BranchRef};
use crate::content::Content;
use crate::error::EngineError;
use crate::transaction::Transaction;

use super::{map_delete, map_get, map_keys, map_set, In};

/// Handle to a shared map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRef {
    pub(crate) branch: BranchRef,
}

impl MapRef {
    pub fn from_ref(txn: &Transaction<'_>, branch: BranchRef) -> Option<Self> {
        matches!(txn.store.branch(branch).kind, BranchKind::Map).then_some(Self { branch })
    }

    pub fn set<V: Into<In>>(
        &self,
        txn: &mut Transaction<'_>,
        key: &str,
        value: V,
    ) -> Result<(), EngineError> {
        map_set(txn, self.branch, key, value.into())
    }

    pub fn get(&self, txn: &Transaction<'_>, key: &str) -> Option<Value> {
        map_get(txn.store, self.branch, key)
    }

    pub fn delete(&self, txn: &mut Transaction<'_>, key: &str) {
        map_delete(txn, self.branch, key)
    }

    pub fn contains_key(&self, txn: &Transaction<'_>, key: &str) -> bool {
        self.get(txn, key).is_some()
    }

    pub fn keys(&self, txn: &Transaction<'_>) -> Vec<String> {
        map_keys(txn.store, self.branch)
    }

    pub fn len(&self, txn: &Transaction<'_>) -> u32 {
        self.keys(txn).len() as u32
    }

    pub fn is_empty(&self, txn: &Transaction<'_>) -> bool {
        self.len(txn) == 0
    }

    pub fn clear(&self, txn: &mut Transaction<'_>) {
        for key in self.keys(txn) {
            map_delete(txn, self.branch, &key);
        }
    }

    pub fn to_json(&self, txn: &Transaction<'_>) -> Value {
        let mut out = JsonMap::new();
        for key in self.keys(txn) {
            if let Some(v) = self.get(txn, &key) {
                out.insert(key, v);
            }
        }
        Value::Object(out)
    }

    /// Raw handle of the nested container stored under `key`, if any.
    pub fn get_container(&self, txn: &Transaction<'_>, key: &str) -> Option<BranchRef> {
        let &tail = txn.store.branch(self.branch).map.get(key)?;
        let item = txn.store.blocks.item(tail);
        if item.is_deleted() {
            return None;
        }
        match &item.content {
            Content::Type(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<MapRef> for BranchRef {
    fn from(r: MapRef) -> Self {
        r.branch
    }
}

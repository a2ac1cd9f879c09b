//! Shared ordered list.

use serde_json::Value;

use crate::branch::{BranchKind, BranchRef};
use crate::content::Content;
use crate::error::EngineError;
use crate::transaction::Transaction;

use super::{list_delete, list_get, list_insert, list_slice, In};

/// Handle to a shared array. Copyable; all operations go through a
/// transaction on the owning document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRef {
    pub(crate) branch: BranchRef,
}

impl ArrayRef {
    /// Wraps a raw container handle after checking its kind.
    pub fn from_ref(txn: &Transaction<'_>, branch: BranchRef) -> Option<Self> {
        matches!(txn.store.branch(branch).kind, BranchKind::Array).then_some(Self { branch })
    }

    pub fn insert<I, V>(&self, txn: &mut Transaction<'_>, index: u32, values: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = V>,
        V: Into<In>,
    {
        let values: Vec<In> = values.into_iter().map(Into::into).collect();
        list_insert(txn, self.branch, index, values)
    }

    pub fn push_back<I, V>(&self, txn: &mut Transaction<'_>, values: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = V>,
        V: Into<In>,
    {
        let len = self.len(txn);
        self.insert(txn, len, values)
    }

    pub fn push_front<I, V>(&self, txn: &mut Transaction<'_>, values: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = V>,
        V: Into<In>,
    {
        self.insert(txn, 0, values)
    }

    pub fn delete(
        &self,
        txn: &mut Transaction<'_>,
        index: u32,
        length: u32,
    ) -> Result<(), EngineError> {
        list_delete(txn, self.branch, index, length)
    }

    pub fn len(&self, txn: &Transaction<'_>) -> u32 {
        txn.store.branch(self.branch).content_len
    }

    pub fn is_empty(&self, txn: &Transaction<'_>) -> bool {
        self.len(txn) == 0
    }

    pub fn get(&self, txn: &Transaction<'_>, index: u32) -> Option<Value> {
        list_get(txn.store, self.branch, index)
    }

    pub fn slice(&self, txn: &Transaction<'_>, start: u32, end: u32) -> Vec<Value> {
        list_slice(txn.store, self.branch, start, end)
    }

    pub fn to_vec(&self, txn: &Transaction<'_>) -> Vec<Value> {
        self.slice(txn, 0, self.len(txn))
    }

    pub fn to_json(&self, txn: &Transaction<'_>) -> Value {
        Value::Array(self.to_vec(txn))
    }

    /// Raw handle of the nested container stored at `index`, if any.
    pub fn get_container(&self, txn: &Transaction<'_>, index: u32) -> Option<BranchRef> {
        let mut remaining = index;
        let mut n = txn.store.branch(self.branch).start;
        while let Some(cur) = n {
            let item = txn.store.blocks.item(cur);
            if !item.is_deleted() && item.is_countable() {
                if remaining < item.len {
                    return match &item.content {
                        Content::Type(b) => Some(*b),
                        _ => None,
                    };
                }
                remaining -= item.len;
            }
            n = item.right;
        }
        None
    }
}

impl From<ArrayRef> for BranchRef {
    fn from(r: ArrayRef) -> Self {
        r.branch
    }
}

//! Shared text. Indexes and lengths count UTF-16 code units.

use crate::branch::{BranchKind, BranchRef};
use crate::error::EngineError;
use crate::transaction::Transaction;

use super::{list_delete, text_insert, text_string};

/// Handle to a shared text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRef {
    pub(crate) branch: BranchRef,
}

impl TextRef {
    pub fn from_ref(txn: &Transaction<'_>, branch: BranchRef) -> Option<Self> {
        matches!(txn.store.branch(branch).kind, BranchKind::Text).then_some(Self { branch })
    }

    pub fn insert(
        &self,
        txn: &mut Transaction<'_>,
        index: u32,
        text: &str,
    ) -> Result<(), EngineError> {
        text_insert(txn, self.branch, index, text)
    }

    pub fn push(&self, txn: &mut Transaction<'_>, text: &str) -> Result<(), EngineError> {
        let len = self.len(txn);
        text_insert(txn, self.branch, len, text)
    }

    pub fn remove_range(
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

    pub fn get_string(&self, txn: &Transaction<'_>) -> String {
        text_string(txn.store, self.branch)
    }
}

impl From<TextRef> for BranchRef {
    fn from(r: TextRef) -> Self {
        r.branch
    }
}

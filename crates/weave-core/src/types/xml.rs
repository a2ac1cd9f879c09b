//! XML container kinds.
//!
//! These are structural containers only: an element is a named node
//! with attributes (its map part) and children (its sequence part).
//! Serializing a tree to markup is the application's concern.

use serde_json::Value;

use crate::branch::{BranchKind, BranchRef};
use crate::error::EngineError;
use crate::transaction::Transaction;

use super::{
    list_delete, list_insert, list_slice, map_delete, map_get, map_keys, map_set, text_insert,
    text_string, In,
};

/// Handle to an XML fragment: an unnamed sequence of XML nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlFragmentRef {
    pub(crate) branch: BranchRef,
}

impl XmlFragmentRef {
    pub fn from_ref(txn: &Transaction<'_>, branch: BranchRef) -> Option<Self> {
        matches!(txn.store.branch(branch).kind, BranchKind::XmlFragment).then_some(Self { branch })
    }

    pub fn insert<I, V>(&self, txn: &mut Transaction<'_>, index: u32, values: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = V>,
        V: Into<In>,
    {
        let values: Vec<In> = values.into_iter().map(Into::into).collect();
        list_insert(txn, self.branch, index, values)
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

    pub fn children(&self, txn: &Transaction<'_>) -> Vec<Value> {
        list_slice(txn.store, self.branch, 0, self.len(txn))
    }
}

/// Handle to an XML element: tag name, attributes, children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlElementRef {
    pub(crate) branch: BranchRef,
}

impl XmlElementRef {
    pub fn from_ref(txn: &Transaction<'_>, branch: BranchRef) -> Option<Self> {
        matches!(txn.store.branch(branch).kind, BranchKind::XmlElement).then_some(Self { branch })
    }

    pub fn tag(&self, txn: &Transaction<'_>) -> String {
        txn.store.branch(self.branch).name.clone().unwrap_or_default()
    }

    pub fn insert_attribute(
        &self,
        txn: &mut Transaction<'_>,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        map_set(txn, self.branch, key, In::Any(Value::String(value.to_string())))
    }

    pub fn get_attribute(&self, txn: &Transaction<'_>, key: &str) -> Option<String> {
        match map_get(txn.store, self.branch, key) {
            Some(Value::String(s)) => Some(s),
            Some(other) => Some(other.to_string()),
            None => None,
        }
    }

    pub fn remove_attribute(&self, txn: &mut Transaction<'_>, key: &str) {
        map_delete(txn, self.branch, key)
    }

    pub fn attributes(&self, txn: &Transaction<'_>) -> Vec<(String, String)> {
        map_keys(txn.store, self.branch)
            .into_iter()
            .filter_map(|k| self.get_attribute(txn, &k).map(|v| (k, v)))
            .collect()
    }

    pub fn insert<I, V>(&self, txn: &mut Transaction<'_>, index: u32, values: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = V>,
        V: Into<In>,
    {
        let values: Vec<In> = values.into_iter().map(Into::into).collect();
        list_insert(txn, self.branch, index, values)
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

    pub fn children(&self, txn: &Transaction<'_>) -> Vec<Value> {
        list_slice(txn.store, self.branch, 0, self.len(txn))
    }
}

/// Handle to text inside an XML tree; same semantics as [`TextRef`].
///
/// [`TextRef`]: super::TextRef
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlTextRef {
    pub(crate) branch: BranchRef,
}

impl XmlTextRef {
    pub fn from_ref(txn: &Transaction<'_>, branch: BranchRef) -> Option<Self> {
        matches!(txn.store.branch(branch).kind, BranchKind::XmlText).then_some(Self { branch })
    }

    pub fn insert(
        &self,
        txn: &mut Transaction<'_>,
        index: u32,
        text: &str,
    ) -> Result<(), EngineError> {
        text_insert(txn, self.branch, index, text)
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

    pub fn get_string(&self, txn: &Transaction<'_>) -> String {
        text_string(txn.store, self.branch)
    }
}

/// Handle to an XML hook: a named map bridging to an external widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmlHookRef {
    pub(crate) branch: BranchRef,
}

impl XmlHookRef {
    pub fn from_ref(txn: &Transaction<'_>, branch: BranchRef) -> Option<Self> {
        matches!(txn.store.branch(branch).kind, BranchKind::XmlHook).then_some(Self { branch })
    }

    pub fn hook_name(&self, txn: &Transaction<'_>) -> String {
        txn.store.branch(self.branch).name.clone().unwrap_or_default()
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
}

impl From<XmlFragmentRef> for BranchRef {
    fn from(r: XmlFragmentRef) -> Self {
        r.branch
    }
}

impl From<XmlElementRef> for BranchRef {
    fn from(r: XmlElementRef) -> Self {
        r.branch
    }
}

impl From<XmlTextRef> for BranchRef {
    fn from(r: XmlTextRef) -> Self {
        r.branch
    }
}

impl From<XmlHookRef> for BranchRef {
    fn from(r: XmlHookRef) -> Self {
        r.branch
    }
}

//! Value-based observer events.
//!
//! Events are change summaries computed at dispatch time: a sequence
//! delta and per-key actions, plus the path from the root container to
//! the changed one. Listeners receive data, not live handles, so they
//! can never observe a half-cleaned document.

use std::collections::HashMap;

use serde_json::Value;

use crate::branch::BranchKind;
use crate::id::StateVector;

/// One step on the path from a root container to an event target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Map key (or XML attribute name).
    Key(String),
    /// Position among countable, undeleted sequence content.
    Index(u32),
}

/// How a map key changed within one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryChange {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyChange {
    pub action: EntryChange,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// One run of a sequence change summary.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOp {
    Retain(u32),
    Insert(Vec<Value>),
    Delete(u32),
}

/// Change summary for one container in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerEvent {
    /// Name of the root container the target lives under.
    pub root: String,
    /// Path from that root to the target; empty when the target is the
    /// root itself.
    pub path: Vec<PathSegment>,
    pub kind: BranchKind,
    /// Per-key changes of the map part.
    pub keys: HashMap<String, KeyChange>,
    /// Sequence changes, in document order.
    pub delta: Vec<DeltaOp>,
    pub origin: Option<Value>,
    pub local: bool,
}

/// Payload of the transaction lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub origin: Option<Value>,
    pub local: bool,
    pub before_state: StateVector,
    pub after_state: StateVector,
}

/// Payload of the `update` / `update_v2` events.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub update: Vec<u8>,
    pub origin: Option<Value>,
    pub local: bool,
}

/// Sub-document lifecycle diff of one transaction, by guid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubdocsEvent {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub loaded: Vec<String>,
}

/// Token returned by every subscription; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

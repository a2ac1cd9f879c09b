//! Sequence CRDT engine.
//!
//! Eventually-consistent shared lists, maps, text and XML containers
//! over an unreliable, partially ordered channel. Every peer mutates
//! locally without coordination; binary updates exchanged in any order
//! converge to the same state, with missing causality buffered rather
//! than rejected.

mod branch;
mod codec;
mod content;
mod delete_set;
mod doc;
mod error;
mod event;
mod id;
mod item;
mod marker;
mod store;
mod transaction;
mod types;
mod update;

pub use branch::{BranchKind, BranchRef};
pub use delete_set::{DeleteRange, DeleteSet};
pub use doc::{Doc, DocOptions};
pub use error::{CodecError, EngineError};
pub use event::{
    ContainerEvent, DeltaOp, EntryChange, KeyChange, PathSegment, SubdocsEvent, SubscriptionId,
    TransactionEvent, UpdateEvent,
};
pub use id::{Id, StateVector};
pub use store::GcFilter;
pub use transaction::Transaction;
pub use types::{
    ArrayRef, In, MapRef, TextRef, XmlElementRef, XmlFragmentRef, XmlHookRef, XmlTextRef,
};
pub use update::{
    diff_update_v1, diff_update_v2, encode_state_vector_from_update_v1,
    encode_state_vector_from_update_v2, merge_updates_v1, merge_updates_v2,
};

use rand::Rng;

/// Client ids below this are reserved for tooling and tests that need
/// predictable ordering.
pub const MIN_CLIENT_ID: u32 = 16;

/// Generates the random 32-bit client id a fresh document writes
/// under.
pub fn generate_client_id() -> u32 {
    let mut rng = rand::thread_rng();
    rng.gen_range(MIN_CLIENT_ID..=u32::MAX)
}

/// Generates a random document guid.
pub fn generate_guid() -> String {
    let mut rng = rand::thread_rng();
    let a: u64 = rng.gen();
    let b: u64 = rng.gen();
    format!("{a:016x}{b:016x}")
}

/// Returns the crate version at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

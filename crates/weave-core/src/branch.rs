//! Container state shared by every concrete container kind.

use std::collections::HashMap;

use crate::marker::SearchMarker;
use crate::store::StructRef;

/// Stable handle into the document's branch arena. Handles never move
/// or get invalidated for the lifetime of the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchRef(pub(crate) u32);

/// Concrete container kind. `Abstract` is the unspecialized form a
/// root takes when it is referenced by a decoded update before the
/// application fetched it under a concrete kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    Abstract,
    Array,
    Map,
    Text,
    XmlElement,
    XmlFragment,
    XmlHook,
    XmlText,
}

impl BranchKind {
    pub(crate) fn type_ref(self) -> u8 {
        match self {
            // Abstract roots are never nested, so they never reach the
            // wire as a content payload.
            BranchKind::Abstract => u8::MAX,
            BranchKind::Array => 0,
            BranchKind::Map => 1,
            BranchKind::Text => 2,
            BranchKind::XmlElement => 3,
            BranchKind::XmlFragment => 4,
            BranchKind::XmlHook => 5,
            BranchKind::XmlText => 6,
        }
    }

    pub(crate) fn from_type_ref(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => BranchKind::Array,
            1 => BranchKind::Map,
            2 => BranchKind::Text,
            3 => BranchKind::XmlElement,
            4 => BranchKind::XmlFragment,
            5 => BranchKind::XmlHook,
            6 => BranchKind::XmlText,
            _ => return None,
        })
    }

    pub(crate) fn name(self) -> &'static str {
        match self {
            BranchKind::Abstract => "abstract",
            BranchKind::Array => "array",
            BranchKind::Map => "map",
            BranchKind::Text => "text",
            BranchKind::XmlElement => "xml-element",
            BranchKind::XmlFragment => "xml-fragment",
            BranchKind::XmlHook => "xml-hook",
            BranchKind::XmlText => "xml-text",
        }
    }

    /// Sequence kinds keep a search-marker cache; pure map kinds have
    /// no positional index to accelerate.
    pub(crate) fn uses_markers(self) -> bool {
        matches!(
            self,
            BranchKind::Array
                | BranchKind::Text
                | BranchKind::XmlElement
                | BranchKind::XmlFragment
                | BranchKind::XmlText
        )
    }
}

/// One container instance.
pub(crate) struct Branch {
    /// Head of the document-order list; `None` when the sequence part
    /// is empty.
    pub start: Option<StructRef>,
    /// Map key to the most recently integrated item for that key. The
    /// item with `right == None`; older versions hang off `.left`.
    pub map: HashMap<String, StructRef>,
    /// Sum of countable lengths of undeleted sequence items.
    pub content_len: u32,
    /// The item embedding this container; `None` for roots.
    pub item: Option<StructRef>,
    pub kind: BranchKind,
    /// Root key for roots, node name for XML elements, hook name for
    /// hooks.
    pub name: Option<String>,
    pub markers: Vec<SearchMarker>,
}

impl Branch {
    pub(crate) fn new(kind: BranchKind, name: Option<String>) -> Self {
        Self {
            start: None,
            map: HashMap::new(),
            content_len: 0,
            item: None,
            kind,
            name,
            markers: Vec::new(),
        }
    }
}

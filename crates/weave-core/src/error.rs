use thiserror::Error;

/// Faults surfaced by the engine.
///
/// `MissingCausality` is intentionally absent: updates whose
/// dependencies have not arrived yet are buffered and retried, never
/// rejected.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Internal bookkeeping no longer holds; the document must be
    /// considered corrupt.
    #[error("struct store invariant violated: {0}")]
    BrokenInvariant(&'static str),
    /// A clock lookup addressed a range no struct covers.
    #[error("no struct covers the requested clock")]
    NotPresent,
    /// A positional operation addressed past the container's length.
    #[error("index {index} out of range for container of length {len}")]
    LengthExceeded { index: u32, len: u32 },
    /// An insert value has no shared-container representation.
    #[error("value cannot be stored in a shared container")]
    UnexpectedContent,
    /// A root was fetched as one container kind but already exists as
    /// an incompatible one.
    #[error("root {name:?} already instantiated as {actual}")]
    TypeMismatch { name: String, actual: &'static str },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Faults raised while encoding or decoding the wire format.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Buffer(#[from] weave_buffers::BufferError),
    #[error("unknown content ref {0}")]
    UnknownContentRef(u8),
    #[error("unknown container type ref {0}")]
    UnknownTypeRef(u8),
    #[error("invalid embedded payload")]
    InvalidPayload,
    #[error("unsupported update format version {0}")]
    UnsupportedVersion(u8),
}

//! Binary cursor primitives for the weave wire format.
//!
//! Every weave frame is a sequence of variable-length integers,
//! length-prefixed buffers and strings. `Writer` and `Reader` keep the
//! cursor bookkeeping in one place so the codecs above never touch raw
//! slice offsets.

mod reader;
mod writer;

pub use reader::Reader;
pub use writer::Writer;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("variable-length integer exceeds {0} bits")]
    VarIntTooLarge(u32),
    #[error("length-prefixed string is not valid utf-8")]
    InvalidUtf8,
}

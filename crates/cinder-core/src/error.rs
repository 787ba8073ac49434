//! Error types for record and command stream decoding.

use thiserror::Error;

/// Errors raised while decoding binary records or a command stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The stream contains an opcode this layer does not know.
    #[error("Unknown opcode: {0:#x}")]
    UnknownOpcode(u32),

    /// A record ended before all of its fields were read.
    #[error("Truncated record: {0}")]
    Truncated(&'static str),

    /// A field holds a value outside its enumeration.
    #[error("Invalid value {raw:#x} for {what}")]
    InvalidValue { what: &'static str, raw: u32 },

    /// A record carries more payload than its fields consume.
    #[error("Record has {0} unread payload words")]
    TrailingData(usize),

    /// A record payload does not fit in a single instruction.
    #[error("Record payload too large: {0} words")]
    PayloadTooLarge(usize),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

//! Crate-wide error type.
//!
//! Follows the three-way split from the transfer engine's error model:
//! programming-error/fatal conditions abort the process (they indicate a
//! broken caller contract and are rendered as `panic!` at the call site,
//! not as `Error` variants), driver errors are fatal but reported back to
//! the caller as `Error::Driver` so the surrounding runtime can turn them
//! into an operational failure, and transient conditions (stream
//! saturation, deadline expiry) are plain booleans handled inline by
//! `progress` — they never reach this type.

use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A driver call returned a non-success status. The engine never
    /// retries; this is surfaced for the caller to treat as an
    /// operational failure.
    Driver(String),
    /// A stream operation was attempted against a link that does not
    /// exist (e.g. a missing peer-to-peer stream). `select_stream`
    /// returns this as a `Result` rather than panicking directly, since
    /// it has no business deciding how fatal a missing link is; its
    /// caller in the copy engine treats it as a precondition violation
    /// and panics immediately.
    MissingStream { from: u32, to: u32 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Driver(msg) => write!(f, "driver call failed: {msg}"),
            Error::MissingStream { from, to } => {
                write!(f, "no peer-to-peer stream from GPU {from} to GPU {to}")
            }
        }
    }
}

impl std::error::Error for Error {}

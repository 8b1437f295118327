//! Name-service status codes and directory result code mapping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome reported across every boundary call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The record was produced.
    Success,
    /// The query ran and nothing matched. Not an error to the caller.
    NotFound,
    /// No server reachable, bad local configuration, or local resource exhaustion.
    Unavailable,
    /// Transient failure; for buffer exhaustion the caller retries with more space.
    TryAgain,
    /// Stop enumerating: there is no more data.
    Return,
}

impl Status {
    /// Returns true for [`Status::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Collapses a result into its boundary status.
    #[must_use]
    pub fn of<T>(result: &crate::Result<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) => err.status(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Success => "success",
            Self::NotFound => "notfound",
            Self::Unavailable => "unavail",
            Self::TryAgain => "tryagain",
            Self::Return => "return",
        };
        f.write_str(label)
    }
}

/// Directory protocol result codes (RFC 4511 plus client-side codes).
pub mod result_code {
    /// Operation completed.
    pub const SUCCESS: u32 = 0;
    /// Server-side operations error.
    pub const OPERATIONS_ERROR: u32 = 1;
    /// Protocol violation.
    pub const PROTOCOL_ERROR: u32 = 2;
    /// Time limit reached; partial results are usable.
    pub const TIMELIMIT_EXCEEDED: u32 = 3;
    /// Size limit reached; partial results are usable.
    pub const SIZELIMIT_EXCEEDED: u32 = 4;
    /// Attribute not present.
    pub const NO_SUCH_ATTRIBUTE: u32 = 16;
    /// Unknown attribute type.
    pub const UNDEFINED_TYPE: u32 = 17;
    /// Matching rule not applicable.
    pub const INAPPROPRIATE_MATCHING: u32 = 18;
    /// Constraint violated.
    pub const CONSTRAINT_VIOLATION: u32 = 19;
    /// Value already present.
    pub const TYPE_OR_VALUE_EXISTS: u32 = 20;
    /// Value syntax invalid.
    pub const INVALID_SYNTAX: u32 = 21;
    /// Base object missing.
    pub const NO_SUCH_OBJECT: u32 = 32;
    /// Alias problem.
    pub const ALIAS_PROBLEM: u32 = 33;
    /// Malformed DN.
    pub const INVALID_DN_SYNTAX: u32 = 34;
    /// Entry is a leaf.
    pub const IS_LEAF: u32 = 35;
    /// Alias could not be dereferenced.
    pub const ALIAS_DEREF_PROBLEM: u32 = 36;
    /// Credentials rejected.
    pub const INVALID_CREDENTIALS: u32 = 49;
    /// Server busy.
    pub const BUSY: u32 = 51;
    /// Server unavailable.
    pub const UNAVAILABLE: u32 = 52;
    /// Connection to the server was lost.
    pub const SERVER_DOWN: u32 = 81;
    /// Client-side failure.
    pub const LOCAL_ERROR: u32 = 82;
    /// Client-side timeout.
    pub const TIMEOUT: u32 = 85;
    /// Filter could not be encoded.
    pub const FILTER_ERROR: u32 = 87;
    /// Connection could not be established.
    pub const CONNECT_ERROR: u32 = 91;
}

/// Maps a directory result code into the status taxonomy.
///
/// Success-like codes become [`Status::Success`], schema, name and filter problems become
/// [`Status::NotFound`], and everything else, connectivity and credentials included, is
/// [`Status::Unavailable`].
#[must_use]
pub const fn status_for_result_code(code: u32) -> Status {
    use result_code::*;

    match code {
        SUCCESS | SIZELIMIT_EXCEEDED | TIMELIMIT_EXCEEDED => Status::Success,
        NO_SUCH_ATTRIBUTE
        | UNDEFINED_TYPE
        | INAPPROPRIATE_MATCHING
        | CONSTRAINT_VIOLATION
        | TYPE_OR_VALUE_EXISTS
        | INVALID_SYNTAX
        | NO_SUCH_OBJECT
        | ALIAS_PROBLEM
        | INVALID_DN_SYNTAX
        | IS_LEAF
        | ALIAS_DEREF_PROBLEM
        | FILTER_ERROR => Status::NotFound,
        _ => Status::Unavailable,
    }
}

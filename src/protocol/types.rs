//! RESP2 value types
//!
//! Defines the values exchanged with monitors and store nodes

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// RESP2 value types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple strings: +OK\r\n
    SimpleString(String),

    /// Errors: -Error message\r\n
    Error(String),

    /// Integers: :1000\r\n
    Integer(i64),

    /// Bulk strings: $6\r\nfoobar\r\n
    BulkString(Bytes),

    /// Null bulk string or null array: $-1\r\n / *-1\r\n
    Null,

    /// Arrays: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Create a simple string
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Create an error
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Create a bulk string from bytes
    pub fn bulk_string(b: impl Into<Bytes>) -> Self {
        RespValue::BulkString(b.into())
    }

    /// Build a command array from its words, e.g. `["SENTINEL", "replicas", "mymaster"]`
    ///
    /// Commands are always sent as arrays of bulk strings.
    pub fn command<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        RespValue::Array(
            words
                .into_iter()
                .map(|w| RespValue::BulkString(Bytes::copy_from_slice(w.as_ref().as_bytes())))
                .collect(),
        )
    }

    /// Try to extract array elements
    pub fn as_array(&self) -> Option<&Vec<RespValue>> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Textual content of a simple or bulk string
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) => Some(s.clone()),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok().map(str::to_string),
            _ => None,
        }
    }

    /// Whether this is a null reply
    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "SimpleString({})", s),
            RespValue::Error(e) => write!(f, "Error({})", e),
            RespValue::Integer(i) => write!(f, "Integer({})", i),
            RespValue::BulkString(b) => write!(f, "BulkString({} bytes)", b.len()),
            RespValue::Null => write!(f, "Null"),
            RespValue::Array(arr) => write!(f, "Array({} elements)", arr.len()),
        }
    }
}

/// RESP parsing errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RespError {
    /// Invalid protocol format
    #[error("Invalid protocol: {0}")]
    InvalidProtocol(String),

    /// Invalid UTF-8 in a line that must be text
    #[error("Invalid UTF-8")]
    InvalidUtf8,

    /// Integer that does not fit an i64
    #[error("Integer overflow")]
    IntegerOverflow,
}

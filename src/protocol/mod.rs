//! RESP2 protocol implementation
//!
//! This module handles parsing and encoding of the store's wire protocol.
//! It is used by the client connections and by nothing else.

mod types;
mod resp;

pub use types::{RespValue, RespError};
pub use resp::{RespParser, RespEncoder};

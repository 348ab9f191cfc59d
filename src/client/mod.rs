//! Client module
//!
//! Outbound RESP connections to monitors and store nodes.

mod connection;

pub use connection::RespConnection;

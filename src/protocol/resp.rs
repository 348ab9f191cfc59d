//! RESP2 parser and encoder
//!
//! Parsing is incremental: a reply split across several TCP reads is left in
//! the buffer untouched until it is complete.

use super::types::{RespError, RespValue};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";

/// Deepest array nesting accepted from a peer
const MAX_DEPTH: usize = 32;

/// RESP2 Parser
pub struct RespParser;

impl RespParser {
    /// Parse one RESP value from the front of `buf`
    ///
    /// Returns Ok(Some(value)) and consumes its bytes when a complete value is
    /// present, Ok(None) without consuming anything when more data is needed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespError> {
        match Self::scan(&buf[..], 0, 0)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Decode the value starting at `pos`, returning it with the position just past it
    fn scan(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(RespValue, usize)>, RespError> {
        if pos >= buf.len() {
            return Ok(None);
        }

        let (line, next) = match Self::line_at(buf, pos) {
            Some(found) => found,
            None => return Ok(None),
        };
        if line.is_empty() {
            return Err(RespError::InvalidProtocol("Empty line".to_string()));
        }
        let body = &line[1..];

        match line[0] {
            b'+' => Ok(Some((RespValue::SimpleString(Self::text(body)?), next))),
            b'-' => Ok(Some((RespValue::Error(Self::text(body)?), next))),
            b':' => Ok(Some((RespValue::Integer(Self::number(body)?), next))),
            b'$' => {
                let len = Self::number(body)?;
                if len == -1 {
                    return Ok(Some((RespValue::Null, next)));
                }
                if len < 0 {
                    return Err(RespError::InvalidProtocol(format!(
                        "Invalid bulk string length: {}",
                        len
                    )));
                }

                let end = next + len as usize;
                if buf.len() < end + 2 {
                    return Ok(None);
                }
                if &buf[end..end + 2] != CRLF {
                    return Err(RespError::InvalidProtocol(
                        "Missing CRLF after bulk string data".to_string(),
                    ));
                }

                let data = Bytes::copy_from_slice(&buf[next..end]);
                Ok(Some((RespValue::BulkString(data), end + 2)))
            }
            b'*' => {
                let count = Self::number(body)?;
                if count == -1 {
                    return Ok(Some((RespValue::Null, next)));
                }
                if count < 0 {
                    return Err(RespError::InvalidProtocol(format!(
                        "Invalid array count: {}",
                        count
                    )));
                }

                if depth >= MAX_DEPTH {
                    return Err(RespError::InvalidProtocol(format!(
                        "Arrays nested deeper than {}",
                        MAX_DEPTH
                    )));
                }

                // Elements are decoded by position, nothing is consumed until
                // the whole array is present.
                let mut elements = Vec::with_capacity((count as usize).min(1024));
                let mut cursor = next;
                for _ in 0..count {
                    match Self::scan(buf, cursor, depth + 1)? {
                        Some((value, after)) => {
                            elements.push(value);
                            cursor = after;
                        }
                        None => return Ok(None),
                    }
                }

                Ok(Some((RespValue::Array(elements), cursor)))
            }
            other => Err(RespError::InvalidProtocol(format!(
                "Unknown type prefix: {}",
                other as char
            ))),
        }
    }

    /// Find the CRLF-terminated line starting at `pos`
    fn line_at(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
        buf[pos..]
            .windows(2)
            .position(|w| w == CRLF)
            .map(|i| (&buf[pos..pos + i], pos + i + 2))
    }

    fn text(body: &[u8]) -> Result<String, RespError> {
        String::from_utf8(body.to_vec()).map_err(|_| RespError::InvalidUtf8)
    }

    fn number(body: &[u8]) -> Result<i64, RespError> {
        let s = std::str::from_utf8(body).map_err(|_| RespError::InvalidUtf8)?;
        s.parse::<i64>().map_err(|_| RespError::IntegerOverflow)
    }
}

/// RESP2 Encoder
pub struct RespEncoder;

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_to(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_to(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(bytes) => {
                buf.put_u8(b'$');
                buf.put_slice(bytes.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(bytes);
                buf.put_slice(CRLF);
            }
            RespValue::Null => {
                buf.put_slice(b"$-1\r\n");
            }
            RespValue::Array(arr) => {
                buf.put_u8(b'*');
                buf.put_slice(arr.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                for elem in arr {
                    Self::encode_to(buf, elem);
                }
            }
        }
    }
}

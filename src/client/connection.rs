//! Client connection
//!
//! One TCP connection to a monitor or store node. Sends RESP commands and
//! reads replies, with every exchange bounded by a timeout.

use crate::address::NodeAddress;
use crate::error::{Error, Result};
use crate::protocol::{RespEncoder, RespParser, RespValue};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// A single RESP connection
pub struct RespConnection {
    /// Peer address
    address: NodeAddress,

    /// TCP stream
    stream: TcpStream,

    /// Read buffer
    read_buffer: BytesMut,

    /// Write buffer
    write_buffer: BytesMut,

    /// Bound on each request/reply exchange
    io_timeout: Duration,
}

impl RespConnection {
    /// Open a TCP connection, failing after `connect_timeout`
    pub async fn connect(
        address: &NodeAddress,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(address.to_socket_string())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(Error::broken(address, e)),
            Err(_) => {
                return Err(Error::broken(
                    address,
                    format!("connect timed out after {:?}", connect_timeout),
                ))
            }
        };

        stream.set_nodelay(true).map_err(|e| Error::broken(address, e))?;
        debug!("Connected to {}", address);

        Ok(RespConnection {
            address: address.clone(),
            stream,
            read_buffer: BytesMut::with_capacity(4096),
            write_buffer: BytesMut::with_capacity(1024),
            io_timeout,
        })
    }

    /// Peer address
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    /// Send a command and wait for its reply
    ///
    /// Error replies come back as `Ok(RespValue::Error(..))`; only transport
    /// and protocol failures are `Err`.
    pub async fn request(&mut self, command: &RespValue) -> Result<RespValue> {
        let io_timeout = self.io_timeout;
        match timeout(io_timeout, self.exchange(command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::broken(
                &self.address,
                format!("no reply within {:?}", io_timeout),
            )),
        }
    }

    /// Send a command whose error reply should become `Error::Upstream`
    pub async fn call(&mut self, command: &RespValue) -> Result<RespValue> {
        match self.request(command).await? {
            RespValue::Error(msg) => Err(Error::Upstream(msg)),
            reply => Ok(reply),
        }
    }

    /// AUTH (when a password is set), SELECT (when db != 0) and PING
    pub async fn handshake(&mut self, password: Option<&str>, db: i64) -> Result<()> {
        if let Some(password) = password {
            self.call(&RespValue::command(["AUTH", password])).await?;
        }

        if db != 0 {
            self.call(&RespValue::command(["SELECT".to_string(), db.to_string()]))
                .await?;
        }

        self.ping().await
    }

    /// PING and expect PONG
    pub async fn ping(&mut self) -> Result<()> {
        match self.call(&RespValue::command(["PING"])).await? {
            RespValue::SimpleString(s) if s.eq_ignore_ascii_case("PONG") => Ok(()),
            other => Err(Error::Protocol(format!("unexpected PING reply: {}", other))),
        }
    }

    async fn exchange(&mut self, command: &RespValue) -> Result<RespValue> {
        // Encode and send the command
        self.write_buffer.clear();
        RespEncoder::encode_to(&mut self.write_buffer, command);
        self.stream
            .write_all(&self.write_buffer)
            .await
            .map_err(|e| Error::broken(&self.address, e))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::broken(&self.address, e))?;

        trace!("Sent {} to {}", command, self.address);

        // Read until one complete reply is buffered
        loop {
            if let Some(reply) = RespParser::parse(&mut self.read_buffer)? {
                trace!("Reply from {}: {}", self.address, reply);
                return Ok(reply);
            }

            let n = self
                .stream
                .read_buf(&mut self.read_buffer)
                .await
                .map_err(|e| Error::broken(&self.address, e))?;

            if n == 0 {
                return Err(Error::broken(&self.address, "connection closed by peer"));
            }
        }
    }
}

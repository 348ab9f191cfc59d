//! Test fakes
//!
//! Scriptable monitors and store nodes speaking RESP over loopback TCP.

use crate::address::NodeAddress;
use crate::config::SentinelConfig;
use crate::protocol::{RespEncoder, RespParser, RespValue};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

type Handler = Arc<dyn Fn(&[String]) -> RespValue + Send + Sync>;

/// Configuration with short timeouts pointing at the given monitors
pub(crate) fn test_config(monitors: &[NodeAddress]) -> SentinelConfig {
    SentinelConfig {
        sentinels: monitors.iter().map(|m| m.to_string()).collect(),
        socket_timeout_ms: 500,
        socket_connect_timeout_ms: 500,
        max_retries: 3,
        retry_delay_ms: 10,
        max_connections: 8,
        ..SentinelConfig::default()
    }
}

/// An address nothing listens on
pub(crate) async fn dead_address() -> NodeAddress {
    dead_addresses(1).await.remove(0)
}

/// `n` distinct addresses nothing listens on
pub(crate) async fn dead_addresses(n: usize) -> Vec<NodeAddress> {
    // Hold every listener until all ports are known so none is handed out twice
    let mut listeners = Vec::with_capacity(n);
    for _ in 0..n {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.unwrap());
    }
    listeners
        .iter()
        .map(|l| NodeAddress::new("127.0.0.1", l.local_addr().unwrap().port()).unwrap())
        .collect()
}

/// Accept loop plus one task per connection
struct FakeServer {
    address: NodeAddress,
    accept: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accepted: Arc<AtomicUsize>,
    delay: Arc<Mutex<Duration>>,
}

impl FakeServer {
    async fn start(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let delay = Arc::new(Mutex::new(Duration::ZERO));

        let accept = {
            let connections = connections.clone();
            let accepted = accepted.clone();
            let delay = delay.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let task = tokio::spawn(serve(socket, handler.clone(), delay.clone()));
                    connections.lock().push(task);
                }
            })
        };

        FakeServer {
            address: NodeAddress::new("127.0.0.1", port).unwrap(),
            accept,
            connections,
            accepted,
            delay,
        }
    }

    /// Close every open client socket, keep accepting new ones
    fn drop_connections(&self) {
        for task in self.connections.lock().drain(..) {
            task.abort();
        }
    }

    /// Stop listening and drop every open connection
    fn kill(&self) {
        self.accept.abort();
        self.drop_connections();
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn serve(mut socket: TcpStream, handler: Handler, delay: Arc<Mutex<Duration>>) {
    let mut read_buffer = BytesMut::with_capacity(1024);
    let mut write_buffer = BytesMut::with_capacity(1024);

    loop {
        match socket.read_buf(&mut read_buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        while let Ok(Some(command)) = RespParser::parse(&mut read_buffer) {
            let words: Vec<String> = command
                .as_array()
                .map(|parts| parts.iter().filter_map(RespValue::as_text).collect())
                .unwrap_or_default();

            let reply = (*handler)(&words);

            let pause = *delay.lock();
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            write_buffer.clear();
            RespEncoder::encode_to(&mut write_buffer, &reply);
            if socket.write_all(&write_buffer).await.is_err() {
                return;
            }
        }
    }
}

fn bulk(s: impl Into<String>) -> RespValue {
    RespValue::bulk_string(s.into())
}

struct SentinelScript {
    master: Option<NodeAddress>,
    replicas: Vec<NodeAddress>,
    queries: usize,
}

/// A monitor whose answers can be changed mid-test
pub(crate) struct FakeSentinel {
    server: FakeServer,
    script: Arc<Mutex<SentinelScript>>,
}

impl FakeSentinel {
    pub(crate) async fn start(master: Option<&NodeAddress>, replicas: &[&NodeAddress]) -> Self {
        let script = Arc::new(Mutex::new(SentinelScript {
            master: master.cloned(),
            replicas: replicas.iter().map(|r| (*r).clone()).collect(),
            queries: 0,
        }));

        let handler: Handler = {
            let script = script.clone();
            Arc::new(move |words: &[String]| {
                let command = words.first().map(|w| w.to_ascii_uppercase()).unwrap_or_default();
                let sub = words.get(1).map(|w| w.to_ascii_lowercase()).unwrap_or_default();

                match (command.as_str(), sub.as_str()) {
                    ("PING", _) => RespValue::simple_string("PONG"),
                    ("AUTH", _) => RespValue::simple_string("OK"),
                    ("SENTINEL", "get-master-addr-by-name") => {
                        let mut script = script.lock();
                        script.queries += 1;
                        match &script.master {
                            Some(m) => RespValue::Array(vec![bulk(m.host.clone()), bulk(m.port.to_string())]),
                            None => RespValue::Null,
                        }
                    }
                    ("SENTINEL", "replicas") | ("SENTINEL", "slaves") => {
                        let script = script.lock();
                        RespValue::Array(
                            script
                                .replicas
                                .iter()
                                .map(|r| {
                                    RespValue::Array(vec![
                                        bulk("ip"),
                                        bulk(r.host.clone()),
                                        bulk("port"),
                                        bulk(r.port.to_string()),
                                        bulk("flags"),
                                        bulk("slave"),
                                    ])
                                })
                                .collect(),
                        )
                    }
                    _ => RespValue::error(format!("ERR unknown command '{}'", command)),
                }
            })
        };

        FakeSentinel {
            server: FakeServer::start(handler).await,
            script,
        }
    }

    pub(crate) fn address(&self) -> NodeAddress {
        self.server.address.clone()
    }

    pub(crate) fn set_master(&self, master: Option<&NodeAddress>) {
        self.script.lock().master = master.cloned();
    }

    pub(crate) fn set_replicas(&self, replicas: &[&NodeAddress]) {
        self.script.lock().replicas = replicas.iter().map(|r| (*r).clone()).collect();
    }

    /// Primary lookups served so far
    pub(crate) fn queries(&self) -> usize {
        self.script.lock().queries
    }
}

/// A store node that accepts SET/GET and records every command
pub(crate) struct FakeNode {
    server: FakeServer,
    commands: Arc<Mutex<Vec<String>>>,
    readonly: Arc<AtomicBool>,
}

impl FakeNode {
    pub(crate) async fn start() -> Self {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let readonly = Arc::new(AtomicBool::new(false));

        let handler: Handler = {
            let commands = commands.clone();
            let readonly = readonly.clone();
            Arc::new(move |words: &[String]| {
                commands.lock().push(words.join(" "));
                let command = words.first().map(|w| w.to_ascii_uppercase()).unwrap_or_default();

                match command.as_str() {
                    "PING" => RespValue::simple_string("PONG"),
                    "AUTH" | "SELECT" => RespValue::simple_string("OK"),
                    "SET" if readonly.load(Ordering::SeqCst) => {
                        RespValue::error("READONLY You can't write against a read only replica.")
                    }
                    "SET" => RespValue::simple_string("OK"),
                    "GET" => RespValue::Null,
                    _ => RespValue::error(format!(
                        "ERR unknown command '{}'",
                        words.first().cloned().unwrap_or_default()
                    )),
                }
            })
        };

        FakeNode {
            server: FakeServer::start(handler).await,
            commands,
            readonly,
        }
    }

    pub(crate) fn address(&self) -> NodeAddress {
        self.server.address.clone()
    }

    /// TCP connections accepted so far
    pub(crate) fn connections(&self) -> usize {
        self.server.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub(crate) fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::SeqCst);
    }

    /// Delay every reply
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.server.delay.lock() = delay;
    }

    /// Same address, fresh process: existing sockets are closed
    pub(crate) fn restart(&self) {
        self.server.drop_connections();
    }

    pub(crate) fn kill(&self) {
        self.server.kill();
    }
}

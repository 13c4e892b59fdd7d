//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use connfactory::config::ServerConfig;
use connfactory::{handler_factory, ConnectionHandler, ConnectionManager, Received, SendMessage};
use tokio::net::{TcpListener, TcpStream};

/// Hook counters shared by every handler built from one factory
#[derive(Default)]
pub struct Hooks {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub reasons: Mutex<Vec<String>>,
}

impl Hooks {
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().unwrap().clone()
    }
}

/// Echoes newline-terminated lines; panics on `panic`.
pub struct RecordingHandler {
    hooks: Arc<Hooks>,
    target: String,
}

impl ConnectionHandler for RecordingHandler {
    fn on_connect(&mut self, _stream: &TcpStream) {
        self.hooks.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&mut self, reason: &str) {
        self.hooks.disconnects.fetch_add(1, Ordering::SeqCst);
        self.hooks.reasons.lock().unwrap().push(reason.to_string());
    }

    fn on_receive(&mut self, data: &[u8]) -> Received {
        let mut received = Received::default();
        while let Some(end) = data[received.consumed..].iter().position(|&b| b == b'\n') {
            let line = &data[received.consumed..received.consumed + end + 1];
            if line == b"panic\n" {
                panic!("handler exploded");
            }
            if let Some(name) = line.strip_prefix(b"NAME ") {
                self.target = String::from_utf8_lossy(name).trim().to_string();
            }
            received.replies.push(SendMessage::new(line.to_vec()));
            received.consumed += end + 1;
        }
        received
    }

    fn matches_target(&self, target: &str) -> bool {
        self.target == target
    }

    fn report_status(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({ "target": self.target }))
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        read_timeout: Duration::from_secs(10),
        write_timeout: Duration::from_secs(5),
        keepalive_interval: Duration::from_secs(30),
        queue_capacity: 16,
        pool_size: 4,
        ..ServerConfig::default()
    }
}

/// Start a manager on an ephemeral loopback port
pub async fn start_server(
    config: ServerConfig,
    greeting: Vec<SendMessage>,
) -> (Arc<ConnectionManager>, SocketAddr, Arc<Hooks>) {
    let hooks = Arc::new(Hooks::default());
    let factory = {
        let hooks = Arc::clone(&hooks);
        handler_factory(move || RecordingHandler {
            hooks: Arc::clone(&hooks),
            target: "default".to_string(),
        })
    };

    let manager = Arc::new(
        ConnectionManager::new(config, factory)
            .unwrap()
            .with_greeting(greeting),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.serve(listener).await });
    }

    (manager, addr, hooks)
}

/// Poll `check` every 10ms for up to two seconds
pub async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

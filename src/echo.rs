//! Line Echo Handler
//!
//! Newline-delimited demo protocol served by the `connfactory` binary.
//! Every line is echoed back; `ID <name>` binds the connection to a target
//! name so it can be addressed by [`ConnectionManager::write_to`](crate::ConnectionManager::write_to)
//! and marks it as registered for health sweeps.

use serde_json::json;
use tokio::net::TcpStream;
use tracing::debug;

use crate::connection::{ConnectionHandler, Received, SendMessage};

const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct LineEchoHandler {
    id: Option<String>,
    lines: u64,
}

impl LineEchoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_line(&mut self, line: &str) -> SendMessage {
        self.lines += 1;
        match line.strip_prefix("ID ") {
            Some(id) if !id.trim().is_empty() => {
                let id = id.trim().to_string();
                let reply = SendMessage::new(format!("OK {}\n", id));
                self.id = Some(id);
                reply
            }
            _ => SendMessage::new(format!("{}\n", line)),
        }
    }
}

impl ConnectionHandler for LineEchoHandler {
    fn on_connect(&mut self, stream: &TcpStream) {
        debug!("echo session opened for {:?}", stream.peer_addr().ok());
    }

    fn on_receive(&mut self, data: &[u8]) -> Received {
        let mut received = Received::default();

        while let Some(end) = data[received.consumed..].iter().position(|&b| b == b'\n') {
            let line = &data[received.consumed..received.consumed + end];
            let line = String::from_utf8_lossy(line);
            let reply = self.handle_line(line.trim_end_matches('\r'));
            received.replies.push(reply);
            received.consumed += end + 1;
        }

        // A line that never ends is dropped rather than buffered forever
        if data.len() - received.consumed > MAX_LINE {
            received.consumed = data.len();
        }

        received
    }

    fn matches_target(&self, target: &str) -> bool {
        self.id.as_deref() == Some(target)
    }

    fn report_status(&self) -> Option<serde_json::Value> {
        let id = self.id.as_ref()?;
        Some(json!({ "id": id, "lines": self.lines }))
    }
}

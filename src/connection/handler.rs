//! Connection Handler Contract
//!
//! Framing and business logic are supplied by the caller. The manager builds
//! one handler per accepted connection through a [`HandlerFactory`], so state
//! kept inside a handler never leaks into the next connection served by the
//! same pool slot.

use std::sync::Arc;

use tokio::net::TcpStream;

use super::types::Received;

/// Per-connection protocol hooks.
///
/// Every hook is called synchronously from the connection's tasks and must
/// return promptly.
pub trait ConnectionHandler: Send + 'static {
    /// Called once, right after the socket is accepted and bound.
    fn on_connect(&mut self, _stream: &TcpStream) {}

    /// Called exactly once when the connection is torn down.
    fn on_disconnect(&mut self, _reason: &str) {}

    /// Parse as many frames as possible out of `data`.
    fn on_receive(&mut self, data: &[u8]) -> Received;

    /// Render a payload for the logs.
    fn format_for_log(&self, data: &[u8]) -> String {
        String::from_utf8_lossy(data).trim_end().to_string()
    }

    /// Whether this connection owns the business-level `target` id.
    fn matches_target(&self, _target: &str) -> bool {
        false
    }

    /// Status for health polling; `None` means the connection has not
    /// registered itself yet.
    fn report_status(&self) -> Option<serde_json::Value> {
        Some(serde_json::Value::Null)
    }
}

/// Builds a fresh handler for every accepted connection.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn ConnectionHandler> + Send + Sync>;

/// Wrap a closure into a [`HandlerFactory`].
pub fn handler_factory<H, F>(make: F) -> HandlerFactory
where
    H: ConnectionHandler,
    F: Fn() -> H + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn ConnectionHandler>)
}

//! OpenAI Realtime transport for the mentor session orchestrator.
//!
//! Owns the WebSocket, translates agent descriptors into `session.update`
//! events, executes tool calls and reports readiness, handoffs and audio back
//! through the orchestrator's `TransportNotifier`.

pub mod audio;
pub mod protocol;
mod transport;

pub use transport::{
    DEFAULT_REALTIME_MODEL, DEFAULT_REALTIME_URL, OpenAiRealtimeTransport, RealtimeConfig,
};

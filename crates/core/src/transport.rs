//! The realtime transport capability contract.
//!
//! The orchestrator never negotiates media itself. It drives an external
//! transport through `RealtimeTransport` and learns about connection changes,
//! readiness, remote audio and handoffs through the `TransportNotifier` it
//! hands over at connect time.

use crate::agents::AgentDescriptor;
use crate::session::audio::{AudioSink, RemoteStream};
use crate::session::{SessionEvent, SessionStatus};
use crate::transcript::Transcript;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("{0}")]
    Other(String),
}

/// Everything a transport needs to establish one connection.
pub struct ConnectOptions {
    /// The key fetched for this attempt.
    pub credential: SecretString,
    /// The agent set, root agent first.
    pub initial_agents: Vec<AgentDescriptor>,
    pub audio: Arc<dyn AudioSink>,
    /// Company name for the output moderation guardrail.
    pub guardrail_company: String,
    /// Extra context made available to tools; tools write breadcrumbs through it.
    pub transcript: Arc<dyn Transcript>,
    pub tools: Option<Arc<dyn ToolExecutor>>,
    pub notifier: TransportNotifier,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> Result<(), TransportError>;
    fn disconnect(&self) -> Result<(), TransportError>;
    fn send_user_text(&self, text: &str) -> Result<(), TransportError>;
    fn send_event(&self, event: Value) -> Result<(), TransportError>;
    /// Cancels any in-progress agent utterance.
    fn interrupt(&self) -> Result<(), TransportError>;
    /// Server-side output mute.
    fn mute(&self, muted: bool) -> Result<(), TransportError>;
    /// True once media/session negotiation has completed and sends are safe.
    fn is_ready(&self) -> bool;
}

/// Facts reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    ConnectionChanged(SessionStatus),
    ReadinessChanged(bool),
    RemoteStream(Option<RemoteStream>),
    AgentHandoff(String),
}

/// Inbound channel from the transport to the orchestrator, scoped to one
/// connect attempt so late notifications from an older connection are ignored.
#[derive(Clone, Debug)]
pub struct TransportNotifier {
    attempt: u64,
    tx: UnboundedSender<SessionEvent>,
}

impl TransportNotifier {
    pub fn new(attempt: u64, tx: UnboundedSender<SessionEvent>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn connection_changed(&self, status: SessionStatus) {
        self.emit(TransportEvent::ConnectionChanged(status));
    }

    pub fn readiness_changed(&self, ready: bool) {
        self.emit(TransportEvent::ReadinessChanged(ready));
    }

    pub fn remote_stream(&self, stream: Option<RemoteStream>) {
        self.emit(TransportEvent::RemoteStream(stream));
    }

    pub fn agent_handoff(&self, agent_name: impl Into<String>) {
        self.emit(TransportEvent::AgentHandoff(agent_name.into()));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(SessionEvent::Transport {
            attempt: self.attempt,
            event,
        });
    }
}

/// A function tool an agent may call.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Executes agent tool calls on behalf of the transport.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn definitions(&self) -> anyhow::Result<Vec<ToolDefinition>>;
    /// Runs a tool. Failures are returned as a JSON error object, never raised.
    async fn call(&self, name: &str, arguments: Value) -> Value;
}

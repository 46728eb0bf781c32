//! Realtime Session Orchestration
//!
//! The orchestrator is a single-owner state machine driven by `SessionEvent`s.
//! Intents from the UI (through `SessionHandle`) and facts from the transport
//! (through `TransportNotifier`) enter through the same channel and are handled
//! one at a time, so no handler ever observes a half-applied transition.
//!
//! - `connection`: session status, the transition table and the attempt guard.
//! - `dispatcher`: the pending greeting slot and the outbound text queue.
//! - `handoff`: the selected agent and the connect ordering.
//! - `audio`: push-to-talk, playback mute and recording.
//! - `client_events`: the realtime client events the orchestrator emits.

pub mod audio;
pub mod client_events;
pub mod connection;
pub mod dispatcher;
pub mod handoff;
mod orchestrator;

pub use orchestrator::{Collaborators, Orchestrator, SessionConfigTrigger};

use crate::credentials::CredentialError;
use crate::transport::{TransportError, TransportEvent};
use crate::upload::{EncodedImage, ImageFile, UploadError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, watch};

/// The single source of truth gating every user-facing action.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Disconnected => write!(f, "DISCONNECTED"),
            SessionStatus::Connecting => write!(f, "CONNECTING"),
            SessionStatus::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Why a connect attempt failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectFailure {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Everything the orchestrator reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    // --- Intents ---
    /// Connects when disconnected, disconnects otherwise.
    ToggleConnection,
    Connect,
    Disconnect,
    SelectAgent(String),
    SendText(String),
    PushToTalkDown,
    PushToTalkUp,
    SetPushToTalk(bool),
    SetPlaybackEnabled(bool),
    SetLogsExpanded(bool),
    UploadImage(ImageFile),
    Shutdown,

    // --- Facts ---
    Transport {
        attempt: u64,
        event: TransportEvent,
    },
    ConnectFinished {
        attempt: u64,
        outcome: Result<(), ConnectFailure>,
    },
    QueuedSendDue {
        attempt: u64,
        text: String,
    },
    UploadRead {
        name: String,
        outcome: Result<EncodedImage, UploadError>,
    },
}

impl SessionEvent {
    /// Short name for logging; some payloads (data URLs) are too large to print.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::ToggleConnection => "toggle_connection",
            SessionEvent::Connect => "connect",
            SessionEvent::Disconnect => "disconnect",
            SessionEvent::SelectAgent(_) => "select_agent",
            SessionEvent::SendText(_) => "send_text",
            SessionEvent::PushToTalkDown => "push_to_talk_down",
            SessionEvent::PushToTalkUp => "push_to_talk_up",
            SessionEvent::SetPushToTalk(_) => "set_push_to_talk",
            SessionEvent::SetPlaybackEnabled(_) => "set_playback_enabled",
            SessionEvent::SetLogsExpanded(_) => "set_logs_expanded",
            SessionEvent::UploadImage(_) => "upload_image",
            SessionEvent::Shutdown => "shutdown",
            SessionEvent::Transport { .. } => "transport",
            SessionEvent::ConnectFinished { .. } => "connect_finished",
            SessionEvent::QueuedSendDue { .. } => "queued_send_due",
            SessionEvent::UploadRead { .. } => "upload_read",
        }
    }
}

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Delay multiplied by queue position when flushing queued messages.
    pub stagger: Duration,
    /// Synthetic user utterance sent after every genuinely new connection.
    pub greeting: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stagger: Duration::from_millis(100),
            greeting: "hi".to_string(),
        }
    }
}

/// Cloneable front door for the UI layer.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: UnboundedSender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub(crate) fn new(tx: UnboundedSender<SessionEvent>, status: watch::Receiver<SessionStatus>) -> Self {
        Self { tx, status }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// A receiver that observes every status transition.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn toggle_connection(&self) {
        self.send(SessionEvent::ToggleConnection);
    }

    pub fn connect(&self) {
        self.send(SessionEvent::Connect);
    }

    pub fn disconnect(&self) {
        self.send(SessionEvent::Disconnect);
    }

    pub fn select_agent(&self, name: impl Into<String>) {
        self.send(SessionEvent::SelectAgent(name.into()));
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.send(SessionEvent::SendText(text.into()));
    }

    pub fn push_to_talk_down(&self) {
        self.send(SessionEvent::PushToTalkDown);
    }

    pub fn push_to_talk_up(&self) {
        self.send(SessionEvent::PushToTalkUp);
    }

    pub fn set_push_to_talk(&self, enabled: bool) {
        self.send(SessionEvent::SetPushToTalk(enabled));
    }

    pub fn set_playback_enabled(&self, enabled: bool) {
        self.send(SessionEvent::SetPlaybackEnabled(enabled));
    }

    pub fn set_logs_expanded(&self, expanded: bool) {
        self.send(SessionEvent::SetLogsExpanded(expanded));
    }

    pub fn upload_image(&self, file: ImageFile) {
        self.send(SessionEvent::UploadImage(file));
    }

    pub fn shutdown(&self) {
        self.send(SessionEvent::Shutdown);
    }

    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Session orchestrator has stopped; dropping intent");
        }
    }
}

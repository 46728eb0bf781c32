//! Outbound text: the pending greeting slot and the FIFO message queue.
//!
//! Nothing is sent unless the session is ready. Flushing empties the queue
//! before the staggered sends are scheduled, so a failed send is never
//! re-queued. Teardown aborts every scheduled send.

use super::SessionEvent;
use super::client_events::{new_item_id, response_create, simulated_user_message};
use crate::transcript::{MessageRole, Transcript};
use crate::transport::{RealtimeTransport, TransportError};
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Queued,
    /// Sent path was taken but the transport rejected the text.
    Failed,
}

pub struct MessageDispatcher {
    stagger: Duration,
    pending_greeting: Option<String>,
    queue: VecDeque<String>,
    scheduled: Vec<JoinHandle<()>>,
}

impl MessageDispatcher {
    pub fn new(stagger: Duration) -> Self {
        Self {
            stagger,
            pending_greeting: None,
            queue: VecDeque::new(),
            scheduled: Vec::new(),
        }
    }

    pub fn pending_greeting(&self) -> Option<&str> {
        self.pending_greeting.as_deref()
    }

    pub fn queued(&self) -> Vec<String> {
        self.queue.iter().cloned().collect()
    }

    /// Places the greeting in the single pending slot, replacing any earlier one.
    pub fn stage_greeting(&mut self, text: &str) {
        self.pending_greeting = Some(text.to_string());
    }

    /// Sends `text` right away when ready, otherwise appends it to the queue.
    pub fn enqueue_or_send(
        &mut self,
        text: &str,
        ready: bool,
        transport: &dyn RealtimeTransport,
        transcript: &dyn Transcript,
    ) -> DispatchOutcome {
        if !ready {
            debug!(queued = self.queue.len() + 1, "Session not ready; queueing message");
            self.queue.push_back(text.to_string());
            return DispatchOutcome::Queued;
        }

        if let Err(e) = transport.interrupt() {
            warn!(error = %e, "Failed to interrupt agent before sending text");
        }
        match send_text(text, transport) {
            Ok(()) => DispatchOutcome::Sent,
            Err(e) => {
                error!(error = %e, "Failed to send message");
                transcript.add_breadcrumb(
                    "Failed to send message",
                    Some(json!({ "error": e.to_string() })),
                );
                DispatchOutcome::Failed
            }
        }
    }

    /// Sends the pending greeting, then schedules the queued messages with
    /// a stagger of `index * stagger`. Each scheduled send comes back as a
    /// `QueuedSendDue` event tagged with `attempt`.
    pub fn flush(
        &mut self,
        ready: bool,
        attempt: u64,
        transport: &dyn RealtimeTransport,
        transcript: &dyn Transcript,
        events: &UnboundedSender<SessionEvent>,
    ) {
        if !ready {
            warn!("Cannot flush messages: session not ready");
            return;
        }

        if let Some(greeting) = self.pending_greeting.take() {
            let id = new_item_id();
            transcript.add_message(&id, MessageRole::User, &greeting);
            let sent = transport
                .send_event(simulated_user_message(&id, &greeting))
                .and_then(|_| transport.send_event(response_create()));
            if let Err(e) = sent {
                error!(error = %e, "Failed to flush pending greeting");
                transcript.add_breadcrumb(
                    "Failed to send greeting",
                    Some(json!({ "error": e.to_string() })),
                );
            }
        }

        self.scheduled.retain(|task| !task.is_finished());
        let drained: Vec<String> = self.queue.drain(..).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "Flushing queued messages");
        }
        for (index, text) in drained.into_iter().enumerate() {
            let delay = self.stagger * index as u32;
            let events = events.clone();
            self.scheduled.push(tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = events.send(SessionEvent::QueuedSendDue { attempt, text });
            }));
        }
    }

    /// Delivers one staggered message. Dropped unless it still belongs to the
    /// live connection and the session is ready.
    pub fn deliver(
        &mut self,
        text: &str,
        current: bool,
        ready: bool,
        transport: &dyn RealtimeTransport,
        transcript: &dyn Transcript,
    ) {
        if !current || !ready {
            debug!("Dropping queued message scheduled for a previous connection");
            return;
        }
        if let Err(e) = send_text(text, transport) {
            error!(error = %e, "Failed to flush queued message");
            transcript.add_breadcrumb(
                "Failed to send queued message",
                Some(json!({ "error": e.to_string() })),
            );
        }
    }

    /// Sends `text` without interrupting the agent. Used by flows that have
    /// already checked readiness themselves.
    pub fn send_direct(
        &self,
        text: &str,
        transport: &dyn RealtimeTransport,
    ) -> Result<(), TransportError> {
        send_text(text, transport)
    }

    /// Drops the pending slot, the queue and every scheduled send.
    pub fn clear(&mut self) {
        for task in self.scheduled.drain(..) {
            task.abort();
        }
        self.pending_greeting = None;
        self.queue.clear();
    }
}

fn send_text(text: &str, transport: &dyn RealtimeTransport) -> Result<(), TransportError> {
    transport.send_user_text(text)
}

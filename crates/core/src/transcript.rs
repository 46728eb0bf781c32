//! Transcript collaborator.
//!
//! The orchestrator only ever writes here: breadcrumbs for notable
//! orchestration events and the synthetic user messages it injects.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Mutex, PoisonError};

/// An immutable, timestamped diagnostic record.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Breadcrumb {
    pub label: String,
    pub payload: Option<Value>,
    pub at: DateTime<Utc>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Breadcrumb(Breadcrumb),
    Message {
        id: String,
        role: MessageRole,
        text: String,
        at: DateTime<Utc>,
    },
}

/// Append-only sink owned by the UI layer.
pub trait Transcript: Send + Sync {
    fn add_breadcrumb(&self, label: &str, payload: Option<Value>);
    fn add_message(&self, id: &str, role: MessageRole, text: &str);
}

/// An in-memory transcript, used by tests and as a building block for front ends.
#[derive(Default)]
pub struct TranscriptLog {
    entries: Mutex<Vec<TranscriptEntry>>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn breadcrumbs(&self) -> Vec<Breadcrumb> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                TranscriptEntry::Breadcrumb(b) => Some(b),
                TranscriptEntry::Message { .. } => None,
            })
            .collect()
    }

    pub fn labels(&self) -> Vec<String> {
        self.breadcrumbs().into_iter().map(|b| b.label).collect()
    }

    fn push(&self, entry: TranscriptEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

impl Transcript for TranscriptLog {
    fn add_breadcrumb(&self, label: &str, payload: Option<Value>) {
        self.push(TranscriptEntry::Breadcrumb(Breadcrumb {
            label: label.to_string(),
            payload,
            at: Utc::now(),
        }));
    }

    fn add_message(&self, id: &str, role: MessageRole, text: &str) {
        self.push(TranscriptEntry::Message {
            id: id.to_string(),
            role,
            text: text.to_string(),
            at: Utc::now(),
        });
    }
}

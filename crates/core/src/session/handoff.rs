//! Tracks the selected agent.
//!
//! A user selection changes the root agent of the next connection, which
//! means a reconnect. A transport-reported handoff only updates the
//! selection, since the transport has already switched agents in-session.

use crate::agents::{AgentDescriptor, AgentSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// The name is not part of the active set.
    Unknown,
    Unchanged,
    Changed { previous: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffOutcome {
    Unknown,
    Unchanged,
    Switched { previous: Option<String> },
}

#[derive(Debug, Default)]
pub struct HandoffCoordinator {
    selected: Option<String>,
}

impl HandoffCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// A user-initiated selection.
    pub fn select(&mut self, set: &AgentSet, name: &str) -> Selection {
        if !set.contains(name) {
            return Selection::Unknown;
        }
        if self.selected.as_deref() == Some(name) {
            return Selection::Unchanged;
        }
        let previous = self.selected.replace(name.to_string());
        Selection::Changed { previous }
    }

    /// A handoff the transport already performed.
    pub fn accept_handoff(&mut self, set: &AgentSet, name: &str) -> HandoffOutcome {
        match self.select(set, name) {
            Selection::Unknown => HandoffOutcome::Unknown,
            Selection::Unchanged => HandoffOutcome::Unchanged,
            Selection::Changed { previous } => HandoffOutcome::Switched { previous },
        }
    }

    /// The agents for the next connection, with the selected agent (or the
    /// set head when nothing is selected) as root.
    pub fn connect_ordering(&self, set: &AgentSet) -> Vec<AgentDescriptor> {
        let root = self
            .selected
            .as_deref()
            .unwrap_or_else(|| set.head().name.as_str());
        set.ordered_with_root(root)
    }
}

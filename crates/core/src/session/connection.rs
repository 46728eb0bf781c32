//! Session status, the connection transition table and the attempt guard.

use super::SessionStatus;
use tokio::task::JoinHandle;

/// Named inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTrigger {
    /// Agent selected, user toggle, or a message queued while disconnected.
    Requested,
    Succeeded,
    /// Credential fetch or transport connect failed.
    Failed,
    /// Explicit disconnect or a transport-reported drop.
    Dropped,
}

/// The transition table. `None` means the trigger is not valid in `current`.
pub fn next_status(current: SessionStatus, trigger: ConnectionTrigger) -> Option<SessionStatus> {
    use ConnectionTrigger::*;
    use SessionStatus::*;
    match (current, trigger) {
        (Disconnected, Requested) => Some(Connecting),
        (Connecting, Succeeded) => Some(Connected),
        (Connecting, Failed) => Some(Disconnected),
        (Connecting | Connected, Dropped) => Some(Disconnected),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResolution {
    Connected,
    Failed,
    /// The outcome belongs to an attempt that is no longer in flight.
    Stale,
}

struct InFlightAttempt {
    attempt: u64,
    task: Option<JoinHandle<()>>,
}

/// Owns `SessionStatus` and the connection attempt guard.
pub struct ConnectionManager {
    status: SessionStatus,
    next_attempt: u64,
    in_flight: Option<InFlightAttempt>,
    established: Option<u64>,
    reconnect_pending: bool,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            next_attempt: 1,
            in_flight: None,
            established: None,
            reconnect_pending: false,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// The guard: true while a connect sequence is running.
    pub fn attempt_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether `attempt` is the in-flight attempt or the established connection.
    pub fn is_current(&self, attempt: u64) -> bool {
        self.in_flight.as_ref().map(|f| f.attempt) == Some(attempt)
            || self.established == Some(attempt)
    }

    /// The attempt that produced the live connection, if any.
    pub fn established(&self) -> Option<u64> {
        self.established
    }

    /// Starts a new attempt. Returns `None` when the guard or the current
    /// status forbids it.
    pub fn begin_attempt(&mut self) -> Option<u64> {
        if self.in_flight.is_some() {
            return None;
        }
        let next = next_status(self.status, ConnectionTrigger::Requested)?;
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.status = next;
        self.in_flight = Some(InFlightAttempt {
            attempt,
            task: None,
        });
        Some(attempt)
    }

    /// Records the task running `attempt` so a disconnect can abort it.
    pub fn track_task(&mut self, attempt: u64, task: JoinHandle<()>) {
        match self.in_flight.as_mut() {
            Some(in_flight) if in_flight.attempt == attempt => in_flight.task = Some(task),
            _ => task.abort(),
        }
    }

    /// Applies the outcome of `attempt`, clearing the guard.
    pub fn resolve_attempt(&mut self, attempt: u64, succeeded: bool) -> AttemptResolution {
        let is_in_flight = self.in_flight.as_ref().map(|f| f.attempt) == Some(attempt);
        if !is_in_flight || self.status != SessionStatus::Connecting {
            return AttemptResolution::Stale;
        }
        self.in_flight = None;
        if succeeded {
            self.status = SessionStatus::Connected;
            self.established = Some(attempt);
            AttemptResolution::Connected
        } else {
            self.status = SessionStatus::Disconnected;
            AttemptResolution::Failed
        }
    }

    /// Moves to DISCONNECTED from any state, aborting an in-flight attempt.
    /// Returns true if the status changed.
    pub fn drop_connection(&mut self) -> bool {
        if let Some(in_flight) = self.in_flight.take() {
            if let Some(task) = in_flight.task {
                task.abort();
            }
        }
        self.established = None;
        match next_status(self.status, ConnectionTrigger::Dropped) {
            Some(next) => {
                self.status = next;
                true
            }
            None => false,
        }
    }

    /// Asks for a reconnect once the in-flight attempt settles.
    pub fn request_reconnect(&mut self) {
        self.reconnect_pending = true;
    }

    pub fn cancel_reconnect(&mut self) {
        self.reconnect_pending = false;
    }

    pub fn take_reconnect(&mut self) -> bool {
        std::mem::take(&mut self.reconnect_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionTrigger::*;
    use SessionStatus::*;

    #[test]
    fn transition_table() {
        let cases = [
            (Disconnected, Requested, Some(Connecting)),
            (Disconnected, Succeeded, None),
            (Disconnected, Failed, None),
            (Disconnected, Dropped, None),
            (Connecting, Requested, None),
            (Connecting, Succeeded, Some(Connected)),
            (Connecting, Failed, Some(Disconnected)),
            (Connecting, Dropped, Some(Disconnected)),
            (Connected, Requested, None),
            (Connected, Succeeded, None),
            (Connected, Failed, None),
            (Connected, Dropped, Some(Disconnected)),
        ];
        for (from, trigger, expected) in cases {
            assert_eq!(next_status(from, trigger), expected, "{from:?} + {trigger:?}");
        }
    }

    #[test]
    fn guard_rejects_second_attempt() {
        let mut manager = ConnectionManager::new();
        assert_eq!(manager.begin_attempt(), Some(1));
        assert!(manager.attempt_in_flight());
        assert_eq!(manager.begin_attempt(), None);

        assert_eq!(manager.resolve_attempt(1, true), AttemptResolution::Connected);
        assert!(!manager.attempt_in_flight());
        assert_eq!(manager.status(), Connected);
        assert_eq!(manager.begin_attempt(), None);
    }

    #[test]
    fn failure_clears_guard() {
        let mut manager = ConnectionManager::new();
        let attempt = manager.begin_attempt().unwrap();
        assert_eq!(manager.resolve_attempt(attempt, false), AttemptResolution::Failed);
        assert_eq!(manager.status(), Disconnected);
        assert_eq!(manager.begin_attempt(), Some(attempt + 1));
    }

    #[test]
    fn outcome_after_drop_is_stale() {
        let mut manager = ConnectionManager::new();
        let attempt = manager.begin_attempt().unwrap();
        assert!(manager.drop_connection());
        assert_eq!(manager.resolve_attempt(attempt, true), AttemptResolution::Stale);
        assert_eq!(manager.status(), Disconnected);
        assert!(!manager.is_current(attempt));
    }

    #[test]
    fn drop_from_disconnected_is_a_no_op() {
        let mut manager = ConnectionManager::new();
        assert!(!manager.drop_connection());
        assert_eq!(manager.status(), Disconnected);
    }

    #[test]
    fn reconnect_flag_is_one_shot() {
        let mut manager = ConnectionManager::new();
        manager.request_reconnect();
        assert!(manager.take_reconnect());
        assert!(!manager.take_reconnect());
    }
}

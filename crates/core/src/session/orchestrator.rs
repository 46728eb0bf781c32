use super::audio::{AudioController, AudioSink, StreamRecorder};
use super::client_events::session_update;
use super::connection::{AttemptResolution, ConnectionManager};
use super::dispatcher::{DispatchOutcome, MessageDispatcher};
use super::handoff::{HandoffCoordinator, HandoffOutcome, Selection};
use super::{ConnectFailure, OrchestratorSettings, SessionEvent, SessionHandle, SessionStatus};
use crate::agents::AgentSet;
use crate::credentials::CredentialProvider;
use crate::preferences::{
    AUDIO_PLAYBACK_KEY, AudioPreferences, LOGS_EXPANDED_KEY, PUSH_TO_TALK_KEY, PreferenceStore,
    save_bool,
};
use crate::transcript::Transcript;
use crate::transport::{
    ConnectOptions, RealtimeTransport, ToolExecutor, TransportEvent, TransportNotifier,
};
use crate::upload::{self, EncodedImage, ImageFile, UploadError};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// Why the session is being (re)configured. Only a genuinely new connection
/// gets the synthetic greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionConfigTrigger {
    Connected,
    Handoff,
    PushToTalkChanged,
}

/// External collaborators the orchestrator drives.
pub struct Collaborators {
    pub transport: Arc<dyn RealtimeTransport>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub transcript: Arc<dyn Transcript>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub audio_sink: Arc<dyn AudioSink>,
    pub recorder: Arc<dyn StreamRecorder>,
    pub tools: Option<Arc<dyn ToolExecutor>>,
}

pub struct Orchestrator {
    agent_set: AgentSet,
    settings: OrchestratorSettings,

    transport: Arc<dyn RealtimeTransport>,
    credentials: Arc<dyn CredentialProvider>,
    transcript: Arc<dyn Transcript>,
    preference_store: Arc<dyn PreferenceStore>,
    tools: Option<Arc<dyn ToolExecutor>>,

    connection: ConnectionManager,
    dispatcher: MessageDispatcher,
    handoff: HandoffCoordinator,
    audio: AudioController,
    preferences: AudioPreferences,
    /// The established attempt whose session has been configured.
    configured: Option<u64>,

    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    status_tx: watch::Sender<SessionStatus>,
}

impl Orchestrator {
    pub fn new(
        agent_set: AgentSet,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> (Self, SessionHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Disconnected);
        let preferences = AudioPreferences::load(collaborators.preferences.as_ref());
        let audio = AudioController::new(
            collaborators.audio_sink,
            collaborators.recorder,
            preferences.playback_enabled,
        );
        let handle = SessionHandle::new(events_tx.clone(), status_rx);

        let orchestrator = Self {
            agent_set,
            dispatcher: MessageDispatcher::new(settings.stagger),
            settings,
            transport: collaborators.transport,
            credentials: collaborators.credentials,
            transcript: collaborators.transcript,
            preference_store: collaborators.preferences,
            tools: collaborators.tools,
            connection: ConnectionManager::new(),
            handoff: HandoffCoordinator::new(),
            audio,
            preferences,
            configured: None,
            events_tx,
            events_rx,
            status_tx,
        };
        (orchestrator, handle)
    }

    pub fn status(&self) -> SessionStatus {
        self.connection.status()
    }

    pub fn selected_agent(&self) -> Option<&str> {
        self.handoff.selected()
    }

    pub fn preferences(&self) -> AudioPreferences {
        self.preferences
    }

    pub fn agent_set(&self) -> &AgentSet {
        &self.agent_set
    }

    /// Connected, configured and reported ready by the transport.
    pub fn is_ready(&self) -> bool {
        self.connection.status() == SessionStatus::Connected
            && self.configured.is_some()
            && self.configured == self.connection.established()
            && self.transport.is_ready()
    }

    /// Selects the head of the agent set, which starts the first connection,
    /// then processes events until shutdown.
    pub async fn run(mut self) {
        info!(agent_set = %self.agent_set.key(), "Session orchestrator started");
        self.activate_default_agent();
        while let Some(event) = self.events_rx.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        info!("Session orchestrator stopped");
    }

    pub fn activate_default_agent(&mut self) {
        let head = self.agent_set.head().name.clone();
        self.select_agent(&head);
    }

    /// Applies one event. Returns false once the orchestrator should stop.
    #[instrument(level = "debug", skip_all, fields(event = event.kind()))]
    pub fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::ToggleConnection => {
                if self.connection.status() == SessionStatus::Disconnected {
                    self.request_connect();
                } else {
                    self.disconnect();
                }
            }
            SessionEvent::Connect => self.request_connect(),
            SessionEvent::Disconnect => self.disconnect(),
            SessionEvent::SelectAgent(name) => self.select_agent(&name),
            SessionEvent::SendText(text) => self.enqueue_or_send(&text),
            SessionEvent::PushToTalkDown => {
                let ready = self.is_ready();
                self.audio
                    .push_to_talk_down(ready, self.transport.as_ref(), self.transcript.as_ref());
            }
            SessionEvent::PushToTalkUp => {
                let ready = self.is_ready();
                self.audio
                    .push_to_talk_up(ready, self.transport.as_ref(), self.transcript.as_ref());
            }
            SessionEvent::SetPushToTalk(enabled) => self.set_push_to_talk(enabled),
            SessionEvent::SetPlaybackEnabled(enabled) => self.set_playback(enabled),
            SessionEvent::SetLogsExpanded(expanded) => self.set_logs_expanded(expanded),
            SessionEvent::UploadImage(file) => self.begin_upload(file),
            SessionEvent::Shutdown => {
                self.disconnect();
                return false;
            }
            SessionEvent::Transport { attempt, event } => self.on_transport_event(attempt, event),
            SessionEvent::ConnectFinished { attempt, outcome } => {
                self.on_connect_finished(attempt, outcome)
            }
            SessionEvent::QueuedSendDue { attempt, text } => {
                let current = self.connection.established() == Some(attempt);
                let ready = self.is_ready();
                self.dispatcher.deliver(
                    &text,
                    current,
                    ready,
                    self.transport.as_ref(),
                    self.transcript.as_ref(),
                );
            }
            SessionEvent::UploadRead { name, outcome } => self.finish_upload(&name, outcome),
        }
        true
    }

    // --- Connection ---

    fn request_connect(&mut self) {
        let Some(attempt) = self.connection.begin_attempt() else {
            warn!(
                status = %self.connection.status(),
                "Connect ignored: a connection is already in progress or established"
            );
            return;
        };
        self.publish_status();
        self.audio.on_status_changed(SessionStatus::Connecting);
        self.breadcrumb("Connecting to realtime session...", None);

        let initial_agents = self.handoff.connect_ordering(&self.agent_set);
        info!(
            attempt,
            root = initial_agents.first().map(|a| a.name.as_str()).unwrap_or_default(),
            "Starting connection attempt"
        );

        let credentials = Arc::clone(&self.credentials);
        let transport = Arc::clone(&self.transport);
        let options = PendingConnect {
            initial_agents,
            audio: self.audio.sink(),
            guardrail_company: self.agent_set.company_name().to_string(),
            transcript: Arc::clone(&self.transcript),
            tools: self.tools.clone(),
            notifier: TransportNotifier::new(attempt, self.events_tx.clone()),
        };
        let events = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let outcome = async {
                let credential = credentials.fetch_key().await?;
                transport.connect(options.with_credential(credential)).await?;
                Ok::<(), ConnectFailure>(())
            }
            .await;
            let _ = events.send(SessionEvent::ConnectFinished { attempt, outcome });
        });
        self.connection.track_task(attempt, task);
    }

    fn on_connect_finished(&mut self, attempt: u64, outcome: Result<(), ConnectFailure>) {
        match self.connection.resolve_attempt(attempt, outcome.is_ok()) {
            AttemptResolution::Stale => {
                debug!(attempt, "Ignoring outcome of a stale connection attempt");
                // A connect that raced a disconnect may have opened a socket.
                if outcome.is_ok()
                    && self.connection.established().is_none()
                    && !self.connection.attempt_in_flight()
                {
                    self.close_transport();
                }
            }
            AttemptResolution::Connected => {
                info!(attempt, "Realtime session connected");
                self.publish_status();
                self.breadcrumb("Connected successfully", None);
                self.audio
                    .reapply_mute(self.transport.as_ref(), self.transcript.as_ref());
                self.audio.on_status_changed(SessionStatus::Connected);

                if self.connection.take_reconnect() {
                    info!("Agent changed while connecting; reconnecting with the new root agent");
                    self.reconnect();
                    return;
                }
                if self.transport.is_ready() {
                    self.on_ready();
                }
            }
            AttemptResolution::Failed => {
                self.publish_status();
                self.audio.on_status_changed(SessionStatus::Disconnected);
                self.audio.reset_speaking();
                if let Err(failure) = outcome {
                    error!(attempt, error = %failure, "Connection attempt failed");
                    match failure {
                        ConnectFailure::Credential(_) => {
                            self.warn_breadcrumb("Connection failed: No ephemeral key", None)
                        }
                        ConnectFailure::Transport(e) => self.warn_breadcrumb(
                            "Connection failed",
                            Some(json!({ "error": e.to_string() })),
                        ),
                    }
                }
                if self.connection.take_reconnect() {
                    self.request_connect();
                }
            }
        }
    }

    fn disconnect(&mut self) {
        self.connection.cancel_reconnect();
        if self.connection.status() == SessionStatus::Disconnected
            && !self.connection.attempt_in_flight()
        {
            debug!("Disconnect ignored: already disconnected");
            return;
        }
        self.close_transport();
        self.teardown();
        self.breadcrumb("Disconnected from realtime session", None);
    }

    fn reconnect(&mut self) {
        self.close_transport();
        self.teardown();
        self.request_connect();
    }

    fn close_transport(&self) {
        if let Err(e) = self.transport.disconnect() {
            warn!(error = %e, "Transport disconnect failed");
        }
    }

    /// Returns to DISCONNECTED and drops everything tied to the old connection.
    fn teardown(&mut self) {
        self.connection.drop_connection();
        self.dispatcher.clear();
        self.audio.reset_speaking();
        self.configured = None;
        self.publish_status();
        self.audio.on_status_changed(SessionStatus::Disconnected);
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.connection.status());
    }

    // --- Transport facts ---

    fn on_transport_event(&mut self, attempt: u64, event: TransportEvent) {
        if !self.connection.is_current(attempt) {
            debug!(attempt, "Ignoring notification from a previous connection");
            return;
        }
        match event {
            TransportEvent::ConnectionChanged(SessionStatus::Disconnected) => {
                // While connecting, the attempt outcome decides.
                if self.connection.status() == SessionStatus::Connected {
                    warn!(attempt, "Transport reported the connection dropped");
                    self.teardown();
                    self.warn_breadcrumb("Connection lost", None);
                }
            }
            TransportEvent::ConnectionChanged(status) => {
                debug!(%status, "Transport connection status");
            }
            TransportEvent::ReadinessChanged(true) => {
                if self.connection.status() == SessionStatus::Connected {
                    self.on_ready();
                }
            }
            TransportEvent::ReadinessChanged(false) => {
                debug!(attempt, "Transport no longer ready");
            }
            TransportEvent::RemoteStream(stream) => {
                let status = self.connection.status();
                self.audio.on_remote_stream(stream, status);
            }
            TransportEvent::AgentHandoff(name) => self.on_agent_handoff(&name),
        }
    }

    fn on_ready(&mut self) {
        let Some(attempt) = self.connection.established() else {
            return;
        };
        if self.configured != Some(attempt) {
            self.configured = Some(attempt);
            self.configure_session(SessionConfigTrigger::Connected);
        }
        let ready = self.is_ready();
        self.dispatcher.flush(
            ready,
            attempt,
            self.transport.as_ref(),
            self.transcript.as_ref(),
            &self.events_tx,
        );
    }

    fn configure_session(&mut self, trigger: SessionConfigTrigger) {
        // The initial configuration runs before `configured` is recorded.
        let usable = match trigger {
            SessionConfigTrigger::Connected => {
                self.connection.status() == SessionStatus::Connected && self.transport.is_ready()
            }
            SessionConfigTrigger::Handoff | SessionConfigTrigger::PushToTalkChanged => {
                self.is_ready()
            }
        };
        if !usable {
            warn!(?trigger, "Session update skipped: session not ready");
            return;
        }
        let push_to_talk = self.preferences.push_to_talk_enabled;
        debug!(?trigger, push_to_talk, "Updating session");
        if let Err(e) = self.transport.send_event(session_update(push_to_talk)) {
            self.warn_breadcrumb(
                "Failed to update session",
                Some(json!({ "error": e.to_string() })),
            );
        }
        match trigger {
            SessionConfigTrigger::Connected => {
                self.announce_agent();
                self.dispatcher.stage_greeting(&self.settings.greeting);
            }
            SessionConfigTrigger::Handoff => self.announce_agent(),
            SessionConfigTrigger::PushToTalkChanged => {}
        }
    }

    fn announce_agent(&self) {
        if let Some(name) = self.handoff.selected() {
            let capabilities = self.agent_set.get(name).map(|a| a.capabilities.clone());
            self.breadcrumb(&format!("Agent: {name}"), capabilities);
        }
    }

    // --- Agents ---

    fn select_agent(&mut self, name: &str) {
        match self.handoff.select(&self.agent_set, name) {
            Selection::Unknown => {
                self.warn_breadcrumb("Unknown agent selected", Some(json!({ "agent": name })));
            }
            Selection::Unchanged => debug!(agent = name, "Agent already selected"),
            Selection::Changed { previous } => {
                info!(agent = name, previous = ?previous, "Agent selected");
                match self.connection.status() {
                    SessionStatus::Disconnected => self.request_connect(),
                    SessionStatus::Connecting => self.connection.request_reconnect(),
                    SessionStatus::Connected => self.reconnect(),
                }
            }
        }
    }

    fn on_agent_handoff(&mut self, name: &str) {
        match self.handoff.accept_handoff(&self.agent_set, name) {
            HandoffOutcome::Unknown => {
                self.warn_breadcrumb(
                    "Handoff to unknown agent ignored",
                    Some(json!({ "agent": name })),
                );
            }
            HandoffOutcome::Unchanged => debug!(agent = name, "Handoff to the active agent"),
            HandoffOutcome::Switched { previous } => {
                info!(agent = name, previous = ?previous, "Agent handoff");
                self.configure_session(SessionConfigTrigger::Handoff);
            }
        }
    }

    // --- Messages and preferences ---

    fn enqueue_or_send(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let ready = self.is_ready();
        let outcome = self.dispatcher.enqueue_or_send(
            text,
            ready,
            self.transport.as_ref(),
            self.transcript.as_ref(),
        );
        if outcome == DispatchOutcome::Queued
            && self.connection.status() == SessionStatus::Disconnected
        {
            self.request_connect();
        }
    }

    fn set_push_to_talk(&mut self, enabled: bool) {
        if self.preferences.push_to_talk_enabled == enabled {
            return;
        }
        self.preferences.push_to_talk_enabled = enabled;
        save_bool(self.preference_store.as_ref(), PUSH_TO_TALK_KEY, enabled);
        if !enabled {
            self.audio.reset_speaking();
        }
        self.configure_session(SessionConfigTrigger::PushToTalkChanged);
    }

    fn set_playback(&mut self, enabled: bool) {
        let status = self.connection.status();
        let changed = self.audio.set_playback_enabled(
            enabled,
            status,
            self.transport.as_ref(),
            self.transcript.as_ref(),
        );
        if changed {
            self.preferences.playback_enabled = enabled;
            save_bool(self.preference_store.as_ref(), AUDIO_PLAYBACK_KEY, enabled);
        }
    }

    fn set_logs_expanded(&mut self, expanded: bool) {
        if self.preferences.logs_expanded != expanded {
            self.preferences.logs_expanded = expanded;
            save_bool(self.preference_store.as_ref(), LOGS_EXPANDED_KEY, expanded);
        }
    }

    // --- Upload ---

    fn begin_upload(&mut self, file: ImageFile) {
        if !self.is_ready() {
            self.warn_breadcrumb("Upload blocked: Connection not ready", None);
            return;
        }
        if let Err(e) = upload::validate_image(&file) {
            warn!(error = %e, "Rejected upload");
            self.warn_breadcrumb(
                "Upload failed: Invalid file type",
                Some(json!({ "type": file.mime_type })),
            );
            return;
        }
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = upload::read_data_url(&file).await;
            let _ = events.send(SessionEvent::UploadRead {
                name: file.name,
                outcome,
            });
        });
    }

    fn finish_upload(&mut self, name: &str, outcome: Result<EncodedImage, UploadError>) {
        let image = match outcome {
            Ok(image) => image,
            Err(e) => {
                error!(file = name, error = %e, "Failed to read upload");
                self.warn_breadcrumb("Upload failed: Could not read file", None);
                return;
            }
        };
        self.breadcrumb(
            "Map uploaded",
            Some(json!({ "name": image.name, "size": image.size })),
        );
        // The read is asynchronous, so readiness is checked again.
        if !self.is_ready() {
            self.warn_breadcrumb("Upload failed: Session not ready", None);
            return;
        }
        let ask = upload::analysis_request(&image.data_url);
        match self.dispatcher.send_direct(&ask, self.transport.as_ref()) {
            Ok(()) => self.breadcrumb("Analysis request sent", None),
            Err(e) => {
                error!(error = %e, "Failed to send analysis request");
                self.warn_breadcrumb(
                    "Failed to send analysis request",
                    Some(json!({ "error": e.to_string() })),
                );
            }
        }
    }

    // --- Breadcrumbs ---

    fn breadcrumb(&self, label: &str, payload: Option<Value>) {
        info!(breadcrumb = label);
        self.transcript.add_breadcrumb(label, payload);
    }

    fn warn_breadcrumb(&self, label: &str, payload: Option<Value>) {
        warn!(breadcrumb = label);
        self.transcript.add_breadcrumb(label, payload);
    }
}

/// Connect options captured before the credential is known.
struct PendingConnect {
    initial_agents: Vec<crate::agents::AgentDescriptor>,
    audio: Arc<dyn AudioSink>,
    guardrail_company: String,
    transcript: Arc<dyn Transcript>,
    tools: Option<Arc<dyn ToolExecutor>>,
    notifier: TransportNotifier,
}

impl PendingConnect {
    fn with_credential(self, credential: secrecy::SecretString) -> ConnectOptions {
        ConnectOptions {
            credential,
            initial_agents: self.initial_agents,
            audio: self.audio,
            guardrail_company: self.guardrail_company,
            transcript: self.transcript,
            tools: self.tools,
            notifier: self.notifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentDescriptor;
    use crate::credentials::{CredentialError, MockCredentialProvider};
    use crate::preferences::MemoryPreferenceStore;
    use crate::session::audio::{AudioError, RemoteStream};
    use crate::transcript::{TranscriptEntry, TranscriptLog};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Connect(Vec<String>),
        Disconnect,
        Text(String),
        Event(Value),
        Interrupt,
        Mute(bool),
    }

    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<(Instant, Call)>>,
        ready: AtomicBool,
        fail_connect: AtomicBool,
        hold: Mutex<Option<Arc<Notify>>>,
        notifier: Mutex<Option<TransportNotifier>>,
        established: AtomicUsize,
    }

    impl FakeTransport {
        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push((Instant::now(), call));
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
        }

        fn clear_calls(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| matches(c)).count()
        }

        fn texts(&self) -> Vec<String> {
            self.timed_texts().into_iter().map(|(_, t)| t).collect()
        }

        fn timed_texts(&self) -> Vec<(Instant, String)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(at, c)| match c {
                    Call::Text(t) => Some((*at, t.clone())),
                    _ => None,
                })
                .collect()
        }

        fn events_of_type(&self, kind: &str) -> Vec<Value> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Event(v) if v["type"] == kind => Some(v),
                    _ => None,
                })
                .collect()
        }

        fn connects(&self) -> Vec<Vec<String>> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Connect(names) => Some(names),
                    _ => None,
                })
                .collect()
        }

        fn notifier(&self) -> TransportNotifier {
            self.notifier.lock().unwrap().clone().expect("transport connected")
        }

        fn become_ready(&self) {
            self.ready.store(true, Ordering::SeqCst);
            self.notifier().readiness_changed(true);
        }
    }

    #[async_trait]
    impl RealtimeTransport for FakeTransport {
        async fn connect(&self, options: ConnectOptions) -> Result<(), TransportError> {
            self.record(Call::Connect(
                options.initial_agents.iter().map(|a| a.name.clone()).collect(),
            ));
            let hold = self.hold.lock().unwrap().clone();
            if let Some(gate) = hold {
                gate.notified().await;
            }
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(TransportError::Connect("handshake refused".into()));
            }
            self.established.fetch_add(1, Ordering::SeqCst);
            *self.notifier.lock().unwrap() = Some(options.notifier);
            Ok(())
        }

        fn disconnect(&self) -> Result<(), TransportError> {
            self.record(Call::Disconnect);
            self.ready.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn send_user_text(&self, text: &str) -> Result<(), TransportError> {
            self.record(Call::Text(text.to_string()));
            Ok(())
        }

        fn send_event(&self, event: Value) -> Result<(), TransportError> {
            self.record(Call::Event(event));
            Ok(())
        }

        fn interrupt(&self) -> Result<(), TransportError> {
            self.record(Call::Interrupt);
            Ok(())
        }

        fn mute(&self, muted: bool) -> Result<(), TransportError> {
            self.record(Call::Mute(muted));
            Ok(())
        }

        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FakeSink {
        calls: Mutex<Vec<String>>,
    }

    impl AudioSink for FakeSink {
        fn set_muted(&self, muted: bool) {
            self.calls.lock().unwrap().push(format!("muted:{muted}"));
        }
        fn play(&self) -> Result<(), AudioError> {
            self.calls.lock().unwrap().push("play".into());
            Ok(())
        }
        fn pause(&self) {
            self.calls.lock().unwrap().push("pause".into());
        }
    }

    #[derive(Default)]
    struct FakeRecorder {
        calls: Mutex<Vec<String>>,
    }

    impl StreamRecorder for FakeRecorder {
        fn start(&self, stream: &RemoteStream) {
            self.calls.lock().unwrap().push(format!("start:{}", stream.id));
        }
        fn stop(&self) {
            self.calls.lock().unwrap().push("stop".into());
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        handle: SessionHandle,
        transport: Arc<FakeTransport>,
        transcript: Arc<TranscriptLog>,
        preferences: Arc<MemoryPreferenceStore>,
        sink: Arc<FakeSink>,
        recorder: Arc<FakeRecorder>,
    }

    fn abc() -> AgentSet {
        AgentSet::new(
            "test",
            "Acme",
            ["A", "B", "C"]
                .into_iter()
                .map(|n| AgentDescriptor::new(n, json!({ "instructions": format!("I am {n}") })))
                .collect(),
        )
        .unwrap()
    }

    fn ok_credentials() -> MockCredentialProvider {
        let mut mock = MockCredentialProvider::new();
        mock.expect_fetch_key()
            .returning(|| Ok(SecretString::from("ek_test".to_string())));
        mock
    }

    fn harness() -> Harness {
        harness_with(ok_credentials(), MemoryPreferenceStore::new())
    }

    fn harness_with(credentials: MockCredentialProvider, preferences: MemoryPreferenceStore) -> Harness {
        let transport = Arc::new(FakeTransport::default());
        let transcript = Arc::new(TranscriptLog::new());
        let preferences = Arc::new(preferences);
        let sink = Arc::new(FakeSink::default());
        let recorder = Arc::new(FakeRecorder::default());
        let (orchestrator, handle) = Orchestrator::new(
            abc(),
            Collaborators {
                transport: transport.clone(),
                credentials: Arc::new(credentials),
                transcript: transcript.clone(),
                preferences: preferences.clone(),
                audio_sink: sink.clone(),
                recorder: recorder.clone(),
                tools: None,
            },
            OrchestratorSettings::default(),
        );
        Harness {
            orchestrator,
            handle,
            transport,
            transcript,
            preferences,
            sink,
            recorder,
        }
    }

    impl Harness {
        /// Lets spawned tasks run and handles every event they produce.
        async fn settle(&mut self) {
            loop {
                for _ in 0..16 {
                    tokio::task::yield_now().await;
                }
                match self.orchestrator.events_rx.try_recv() {
                    Ok(event) => {
                        self.orchestrator.handle(event);
                    }
                    Err(_) => break,
                }
            }
        }

        async fn send(&mut self, event: SessionEvent) {
            self.orchestrator.handle(event);
            self.settle().await;
        }

        /// Connects with the head agent and completes readiness.
        async fn connect_ready(&mut self) {
            self.orchestrator.activate_default_agent();
            self.settle().await;
            self.transport.become_ready();
            self.settle().await;
            assert!(self.orchestrator.is_ready());
        }

        fn labels(&self) -> Vec<String> {
            self.transcript.labels()
        }
    }

    #[tokio::test]
    async fn concurrent_connect_requests_establish_one_connection() {
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_fetch_key()
            .times(1)
            .returning(|| Ok(SecretString::from("ek_test".to_string())));
        let mut h = harness_with(credentials, MemoryPreferenceStore::new());
        let gate = Arc::new(Notify::new());
        *h.transport.hold.lock().unwrap() = Some(gate.clone());

        h.orchestrator.activate_default_agent();
        h.settle().await;
        assert_eq!(h.orchestrator.status(), SessionStatus::Connecting);

        h.send(SessionEvent::Connect).await;
        h.send(SessionEvent::Connect).await;
        h.send(SessionEvent::SendText("queued".into())).await;
        assert_eq!(h.transport.connects().len(), 1);

        gate.notify_one();
        h.settle().await;
        assert_eq!(h.orchestrator.status(), SessionStatus::Connected);
        assert_eq!(h.handle.status(), SessionStatus::Connected);

        h.send(SessionEvent::Connect).await;
        assert_eq!(h.transport.established.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.connects().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_messages_follow_greeting_in_fifo_order() {
        let mut h = harness();
        h.orchestrator.activate_default_agent();
        h.send(SessionEvent::SendText("hi".into())).await;
        h.send(SessionEvent::SendText("map?".into())).await;
        assert_eq!(h.orchestrator.status(), SessionStatus::Connected);
        assert_eq!(h.orchestrator.dispatcher.queued(), ["hi", "map?"]);
        assert!(h.transport.texts().is_empty());

        h.transport.become_ready();
        h.settle().await;
        assert_eq!(h.transport.texts(), ["hi"]);
        assert!(h.orchestrator.dispatcher.queued().is_empty());

        tokio::time::advance(Duration::from_millis(100)).await;
        h.settle().await;
        let sent = h.transport.timed_texts();
        assert_eq!(
            sent.iter().map(|(_, t)| t.as_str()).collect::<Vec<_>>(),
            ["hi", "map?"]
        );
        assert!(sent[1].0 - sent[0].0 >= Duration::from_millis(100));

        let calls = h.transport.calls();
        let greeting = calls
            .iter()
            .position(|c| matches!(c, Call::Event(v) if v["type"] == "conversation.item.create"))
            .expect("greeting sent");
        let first_text = calls
            .iter()
            .position(|c| matches!(c, Call::Text(_)))
            .unwrap();
        assert!(greeting < first_text);
        assert!(h.transcript.entries().iter().any(|e| matches!(
            e,
            TranscriptEntry::Message { text, .. } if text == "hi"
        )));
    }

    #[tokio::test]
    async fn disconnect_clears_queue_and_pending_greeting() {
        let mut h = harness();
        h.orchestrator.activate_default_agent();
        h.settle().await;
        h.send(SessionEvent::SendText("one".into())).await;
        h.send(SessionEvent::SendText("two".into())).await;
        h.orchestrator.dispatcher.stage_greeting("hi");

        h.send(SessionEvent::Disconnect).await;
        assert_eq!(h.orchestrator.status(), SessionStatus::Disconnected);
        assert!(h.orchestrator.dispatcher.queued().is_empty());
        assert_eq!(h.orchestrator.dispatcher.pending_greeting(), None);
        assert_eq!(h.transport.count(|c| *c == Call::Disconnect), 1);
        assert!(h.labels().contains(&"Disconnected from realtime session".to_string()));
    }

    #[tokio::test]
    async fn outcome_arriving_after_disconnect_is_ignored() {
        let mut h = harness();
        *h.transport.hold.lock().unwrap() = Some(Arc::new(Notify::new()));
        h.orchestrator.activate_default_agent();
        h.settle().await;
        h.send(SessionEvent::Disconnect).await;

        h.send(SessionEvent::ConnectFinished {
            attempt: 1,
            outcome: Ok(()),
        })
        .await;
        h.send(SessionEvent::Transport {
            attempt: 1,
            event: TransportEvent::ReadinessChanged(true),
        })
        .await;

        assert_eq!(h.orchestrator.status(), SessionStatus::Disconnected);
        assert!(!h.labels().contains(&"Connected successfully".to_string()));
        assert!(h.orchestrator.dispatcher.pending_greeting().is_none());
    }

    #[tokio::test]
    async fn disconnect_while_connecting_drops_queued_texts() {
        let mut h = harness();
        let gate = Arc::new(Notify::new());
        *h.transport.hold.lock().unwrap() = Some(gate.clone());
        h.orchestrator.activate_default_agent();
        h.settle().await;
        assert_eq!(h.orchestrator.status(), SessionStatus::Connecting);

        h.send(SessionEvent::SendText("one".into())).await;
        h.send(SessionEvent::SendText("two".into())).await;
        h.orchestrator.dispatcher.stage_greeting("hi");
        assert_eq!(h.orchestrator.dispatcher.queued(), ["one", "two"]);

        h.send(SessionEvent::Disconnect).await;
        assert_eq!(h.orchestrator.status(), SessionStatus::Disconnected);
        assert!(h.orchestrator.dispatcher.queued().is_empty());
        assert_eq!(h.orchestrator.dispatcher.pending_greeting(), None);

        *h.transport.hold.lock().unwrap() = None;
        gate.notify_one();
        h.settle().await;
        assert_eq!(h.orchestrator.status(), SessionStatus::Disconnected);
        assert_eq!(h.transport.established.load(Ordering::SeqCst), 0);
        assert!(h.transport.texts().is_empty());
    }

    #[tokio::test]
    async fn stale_success_closes_the_transport() {
        let mut h = harness();
        *h.transport.hold.lock().unwrap() = Some(Arc::new(Notify::new()));
        h.orchestrator.activate_default_agent();
        h.settle().await;
        h.send(SessionEvent::Disconnect).await;
        assert_eq!(h.transport.count(|c| *c == Call::Disconnect), 1);

        h.send(SessionEvent::ConnectFinished {
            attempt: 1,
            outcome: Err(TransportError::Connect("late".into()).into()),
        })
        .await;
        assert_eq!(h.transport.count(|c| *c == Call::Disconnect), 1);

        h.send(SessionEvent::ConnectFinished {
            attempt: 1,
            outcome: Ok(()),
        })
        .await;
        assert_eq!(h.transport.count(|c| *c == Call::Disconnect), 2);
        assert_eq!(h.orchestrator.status(), SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn session_update_waits_for_readiness() {
        let mut h = harness();
        h.orchestrator.activate_default_agent();
        h.settle().await;
        assert_eq!(h.orchestrator.status(), SessionStatus::Connected);
        assert!(!h.orchestrator.is_ready());

        h.send(SessionEvent::SetPushToTalk(true)).await;
        h.transport.notifier().agent_handoff("B");
        h.settle().await;
        assert!(h.transport.events_of_type("session.update").is_empty());
        assert_eq!(h.orchestrator.selected_agent(), Some("B"));
        assert_eq!(h.preferences.load(PUSH_TO_TALK_KEY).as_deref(), Some("true"));

        h.transport.become_ready();
        h.settle().await;
        let updates = h.transport.events_of_type("session.update");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["session"]["turn_detection"], Value::Null);
        assert!(h.labels().contains(&"Agent: B".to_string()));
    }

    #[tokio::test]
    async fn playback_toggle_mutes_transport_once() {
        let mut h = harness();
        h.connect_ready().await;
        h.transport.clear_calls();
        h.sink.calls.lock().unwrap().clear();

        h.send(SessionEvent::SetPlaybackEnabled(false)).await;
        h.send(SessionEvent::SetPlaybackEnabled(false)).await;

        assert_eq!(h.transport.count(|c| *c == Call::Mute(true)), 1);
        assert_eq!(*h.sink.calls.lock().unwrap(), ["muted:true", "pause"]);
        assert_eq!(h.preferences.load(AUDIO_PLAYBACK_KEY).as_deref(), Some("false"));
        assert!(!h.orchestrator.preferences().playback_enabled);
    }

    #[tokio::test]
    async fn mute_is_reapplied_after_connect() {
        let preferences = MemoryPreferenceStore::new();
        preferences.save(AUDIO_PLAYBACK_KEY, "false").unwrap();
        let mut h = harness_with(ok_credentials(), preferences);
        h.connect_ready().await;
        assert_eq!(h.transport.count(|c| *c == Call::Mute(true)), 1);
    }

    #[tokio::test]
    async fn selecting_agent_while_connected_reconnects_with_new_root() {
        let mut h = harness();
        h.connect_ready().await;
        h.transport.clear_calls();

        h.send(SessionEvent::SelectAgent("A".into())).await;
        assert!(h.transport.calls().is_empty());

        h.send(SessionEvent::SelectAgent("C".into())).await;
        assert_eq!(h.transport.connects(), [["C", "A", "B"]]);
        assert_eq!(h.transport.count(|c| *c == Call::Disconnect), 1);
        let calls = h.transport.calls();
        assert_eq!(calls[0], Call::Disconnect);
        assert_eq!(h.orchestrator.status(), SessionStatus::Connected);
        assert_eq!(h.orchestrator.selected_agent(), Some("C"));
    }

    #[tokio::test]
    async fn handoff_neither_reconnects_nor_greets() {
        let mut h = harness();
        h.connect_ready().await;
        h.transport.clear_calls();

        h.transport.notifier().agent_handoff("B");
        h.settle().await;

        assert_eq!(h.orchestrator.selected_agent(), Some("B"));
        assert_eq!(h.transport.count(|c| *c == Call::Disconnect), 0);
        assert!(h.transport.connects().is_empty());
        assert!(h.transport.events_of_type("conversation.item.create").is_empty());
        assert_eq!(h.transport.events_of_type("session.update").len(), 1);
        assert!(h.labels().contains(&"Agent: B".to_string()));
    }

    #[tokio::test]
    async fn handoff_to_unknown_agent_leaves_a_warning() {
        let mut h = harness();
        h.connect_ready().await;
        h.transport.notifier().agent_handoff("Nobody");
        h.settle().await;
        assert_eq!(h.orchestrator.selected_agent(), Some("A"));
        assert!(h.labels().contains(&"Handoff to unknown agent ignored".to_string()));
    }

    #[tokio::test]
    async fn non_image_upload_is_rejected() {
        let mut h = harness();
        let file = ImageFile::new("notes.txt", "text/plain", "notes.txt");
        h.send(SessionEvent::UploadImage(file.clone())).await;
        assert_eq!(h.labels(), ["Upload blocked: Connection not ready"]);

        h.connect_ready().await;
        h.transport.clear_calls();
        h.send(SessionEvent::UploadImage(file)).await;
        assert!(h.labels().contains(&"Upload failed: Invalid file type".to_string()));
        assert!(h.transport.texts().is_empty());
    }

    #[tokio::test]
    async fn image_upload_sends_analysis_request() {
        use std::io::Write;
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&[0x89, b'P', b'N', b'G']).unwrap();

        let mut h = harness();
        h.connect_ready().await;
        h.transport.clear_calls();

        h.orchestrator.handle(SessionEvent::UploadImage(ImageFile::new(
            "map.png",
            "image/png",
            image.path(),
        )));
        let event = tokio::time::timeout(Duration::from_secs(5), h.orchestrator.events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SessionEvent::UploadRead { .. }));
        h.orchestrator.handle(event);

        let texts = h.transport.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("sensemaker_vision_read with image_url=\"data:image/png;base64,"));
        let labels = h.labels();
        assert!(labels.contains(&"Map uploaded".to_string()));
        assert!(labels.contains(&"Analysis request sent".to_string()));
    }

    #[tokio::test]
    async fn push_to_talk_while_disconnected_only_leaves_breadcrumb() {
        let mut h = harness();
        h.send(SessionEvent::PushToTalkDown).await;
        h.send(SessionEvent::PushToTalkUp).await;
        assert!(h.transport.calls().is_empty());
        assert_eq!(h.labels(), ["Push-to-talk blocked: Connection not ready"]);
    }

    #[tokio::test]
    async fn push_to_talk_commits_and_requests_response() {
        let mut h = harness();
        h.connect_ready().await;
        h.transport.clear_calls();

        h.send(SessionEvent::PushToTalkDown).await;
        assert!(h.orchestrator.audio.user_speaking());
        assert_eq!(
            h.transport.calls(),
            [Call::Interrupt, Call::Event(json!({ "type": "input_audio_buffer.clear" }))]
        );

        h.transport.clear_calls();
        h.send(SessionEvent::PushToTalkUp).await;
        h.send(SessionEvent::PushToTalkUp).await;
        assert!(!h.orchestrator.audio.user_speaking());
        assert_eq!(
            h.transport.calls(),
            [
                Call::Event(json!({ "type": "input_audio_buffer.commit" })),
                Call::Event(json!({ "type": "response.create" })),
            ]
        );
    }

    #[tokio::test]
    async fn push_to_talk_preference_controls_turn_detection() {
        let preferences = MemoryPreferenceStore::new();
        preferences.save(PUSH_TO_TALK_KEY, "true").unwrap();
        let mut h = harness_with(ok_credentials(), preferences);
        h.connect_ready().await;

        let updates = h.transport.events_of_type("session.update");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0]["session"]["turn_detection"], Value::Null);

        h.send(SessionEvent::SetPushToTalk(false)).await;
        let updates = h.transport.events_of_type("session.update");
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1]["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(h.preferences.load(PUSH_TO_TALK_KEY).as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn credential_failure_returns_to_disconnected() {
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_fetch_key()
            .times(1)
            .returning(|| Err(CredentialError::MissingKey));
        let mut h = harness_with(credentials, MemoryPreferenceStore::new());

        h.orchestrator.activate_default_agent();
        h.settle().await;

        assert_eq!(h.orchestrator.status(), SessionStatus::Disconnected);
        assert!(h.transport.connects().is_empty());
        assert!(h.labels().contains(&"Connection failed: No ephemeral key".to_string()));
    }

    #[tokio::test]
    async fn transport_failure_clears_the_guard() {
        let mut h = harness();
        h.transport.fail_connect.store(true, Ordering::SeqCst);
        h.send(SessionEvent::SendText("kept".into())).await;

        assert_eq!(h.orchestrator.status(), SessionStatus::Disconnected);
        let failure = h
            .transcript
            .breadcrumbs()
            .into_iter()
            .find(|b| b.label == "Connection failed")
            .expect("failure breadcrumb");
        assert!(failure.payload.unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("handshake refused"));
        // A failed attempt does not drop queued text.
        assert_eq!(h.orchestrator.dispatcher.queued(), ["kept"]);

        h.transport.fail_connect.store(false, Ordering::SeqCst);
        h.send(SessionEvent::Connect).await;
        assert_eq!(h.transport.connects().len(), 2);
        assert_eq!(h.orchestrator.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn agent_switch_while_connecting_reconnects_once_settled() {
        let mut h = harness();
        let gate = Arc::new(Notify::new());
        *h.transport.hold.lock().unwrap() = Some(gate.clone());
        h.orchestrator.activate_default_agent();
        h.settle().await;

        h.send(SessionEvent::SelectAgent("C".into())).await;
        assert_eq!(h.transport.connects().len(), 1);

        *h.transport.hold.lock().unwrap() = None;
        gate.notify_one();
        h.settle().await;

        assert_eq!(h.transport.connects(), [vec!["A", "B", "C"], vec!["C", "A", "B"]]);
        assert_eq!(h.transport.count(|c| *c == Call::Disconnect), 1);
        assert_eq!(h.orchestrator.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn immediate_send_interrupts_first() {
        let mut h = harness();
        h.connect_ready().await;
        h.transport.clear_calls();

        h.send(SessionEvent::SendText("   ".into())).await;
        assert!(h.transport.calls().is_empty());

        h.send(SessionEvent::SendText("  hello  ".into())).await;
        assert_eq!(
            h.transport.calls(),
            [Call::Interrupt, Call::Text("hello".into())]
        );
    }

    #[tokio::test]
    async fn transport_drop_tears_down_session() {
        let mut h = harness();
        h.connect_ready().await;
        h.send(SessionEvent::PushToTalkDown).await;
        let notifier = h.transport.notifier();

        notifier.connection_changed(SessionStatus::Disconnected);
        h.settle().await;

        assert_eq!(h.orchestrator.status(), SessionStatus::Disconnected);
        assert!(!h.orchestrator.audio.user_speaking());
        assert!(h.labels().contains(&"Connection lost".to_string()));

        // Late notifications from the dropped connection are ignored.
        notifier.agent_handoff("B");
        h.settle().await;
        assert_eq!(h.orchestrator.selected_agent(), Some("A"));
    }

    #[tokio::test(start_paused = true)]
    async fn staggered_sends_are_cancelled_on_disconnect() {
        let mut h = harness();
        h.orchestrator.activate_default_agent();
        for text in ["one", "two", "three"] {
            h.send(SessionEvent::SendText(text.into())).await;
        }
        h.transport.become_ready();
        h.settle().await;
        assert_eq!(h.transport.texts(), ["one"]);

        h.send(SessionEvent::Disconnect).await;
        tokio::time::advance(Duration::from_millis(300)).await;
        h.settle().await;
        assert_eq!(h.transport.texts(), ["one"]);
    }

    #[tokio::test]
    async fn recording_follows_remote_stream_and_status() {
        let mut h = harness();
        h.orchestrator.activate_default_agent();
        h.settle().await;

        h.transport
            .notifier()
            .remote_stream(Some(RemoteStream::new("s1")));
        h.settle().await;
        assert!(h.orchestrator.audio.recording());

        h.send(SessionEvent::Disconnect).await;
        assert!(!h.orchestrator.audio.recording());
        assert_eq!(*h.recorder.calls.lock().unwrap(), ["start:s1", "stop"]);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let mut h = harness();
        h.connect_ready().await;
        assert!(!h.orchestrator.handle(SessionEvent::Shutdown));
        assert_eq!(h.orchestrator.status(), SessionStatus::Disconnected);
        assert_eq!(*h.handle.watch_status().borrow(), SessionStatus::Disconnected);
    }
}

//! `RealtimeTransport` over the OpenAI Realtime WebSocket API.

use crate::audio;
use crate::protocol::{self, AgentRoster, ServerEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mentor_core::session::SessionStatus;
use mentor_core::session::audio::{AudioSink, RemoteStream};
use mentor_core::transcript::{MessageRole, Transcript};
use mentor_core::transport::{
    ConnectOptions, RealtimeTransport, ToolExecutor, TransportError, TransportNotifier,
};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview-2025-06-03";

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: String,
    pub model: String,
}

impl RealtimeConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            model: model.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REALTIME_MODEL)
    }
}

enum Outbound {
    Event(Value),
    Close,
}

struct Connection {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
    /// Set once the server reports `session.created` on this socket.
    ready: Arc<AtomicBool>,
}

/// One WebSocket per connection; `connect` replaces any previous one.
pub struct OpenAiRealtimeTransport {
    config: RealtimeConfig,
    connection: Mutex<Option<Connection>>,
    muted: Arc<AtomicBool>,
}

impl OpenAiRealtimeTransport {
    pub fn new(config: RealtimeConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn outbound(&self) -> Result<mpsc::UnboundedSender<Outbound>, TransportError> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|c| c.outbound.clone())
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl RealtimeTransport for OpenAiRealtimeTransport {
    async fn connect(&self, options: ConnectOptions) -> Result<(), TransportError> {
        let endpoint = self.config.endpoint();
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!(
            "Bearer {}",
            options.credential.expose_secret()
        ))
        .map_err(|_| TransportError::Connect("Invalid credential".to_string()))?;
        request.headers_mut().insert("Authorization", bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let tools = match &options.tools {
            Some(executor) => executor.definitions().await.unwrap_or_else(|e| {
                warn!(error = %e, "Failed to list tools; continuing without them");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(
            endpoint = %endpoint,
            guardrail_company = %options.guardrail_company,
            "Connected to OpenAI Realtime API."
        );

        let roster = AgentRoster::new(options.initial_agents, tools);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let _ = outbound_tx.send(Outbound::Event(roster.session_update(true)));

        let ready = Arc::new(AtomicBool::new(false));
        let session = SessionLoop {
            roster,
            notifier: options.notifier.clone(),
            audio: options.audio,
            transcript: options.transcript,
            tools: options.tools,
            outbound: outbound_tx.clone(),
            ready: Arc::clone(&ready),
            muted: Arc::clone(&self.muted),
        };
        let task = tokio::spawn(session.run(ws_stream, outbound_rx));

        let previous = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Connection {
                outbound: outbound_tx,
                task,
                ready,
            });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        options.notifier.connection_changed(SessionStatus::Connected);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            connection.ready.store(false, Ordering::SeqCst);
            if connection.outbound.send(Outbound::Close).is_err() {
                connection.task.abort();
            }
        }
        Ok(())
    }

    fn send_user_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_ready() {
            return Err(TransportError::NotConnected);
        }
        self.send_event(protocol::user_message(text))?;
        self.send_event(protocol::response_create())
    }

    fn send_event(&self, event: Value) -> Result<(), TransportError> {
        self.outbound()?
            .send(Outbound::Event(event))
            .map_err(|_| TransportError::Send("Realtime connection closed".to_string()))
    }

    fn interrupt(&self) -> Result<(), TransportError> {
        self.send_event(protocol::response_cancel())
    }

    fn mute(&self, muted: bool) -> Result<(), TransportError> {
        debug!(muted, "Setting output mute");
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|c| c.ready.load(Ordering::SeqCst))
    }
}

/// State owned by the socket task of one connection. `ready` is that
/// connection's own flag, so a loop that ends late cannot clear a newer one.
struct SessionLoop {
    roster: AgentRoster,
    notifier: TransportNotifier,
    audio: Arc<dyn AudioSink>,
    transcript: Arc<dyn Transcript>,
    tools: Option<Arc<dyn ToolExecutor>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    ready: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
}

impl SessionLoop {
    async fn run<S>(mut self, ws_stream: S, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>)
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
            + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        loop {
            tokio::select! {
                biased;
                Some(outbound) = outbound_rx.recv() => {
                    match outbound {
                        Outbound::Event(event) => {
                            if let Err(e) = ws_tx.send(WsMessage::Text(event.to_string().into())).await {
                                error!(error = %e, "Failed to send realtime event");
                                break;
                            }
                        }
                        Outbound::Close => {
                            let _ = ws_tx.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
                message = ws_rx.next() => {
                    match message {
                        Some(Ok(WsMessage::Text(text))) => self.handle_text(&text),
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "Realtime socket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "Realtime socket error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        self.ready.store(false, Ordering::SeqCst);
        self.notifier.readiness_changed(false);
        self.notifier.remote_stream(None);
        self.notifier.connection_changed(SessionStatus::Disconnected);
    }

    fn handle_text(&mut self, text: &str) {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Ignoring unparsable server event");
                return;
            }
        };
        match event {
            ServerEvent::SessionCreated => {
                info!("Realtime session created");
                self.ready.store(true, Ordering::SeqCst);
                self.notifier.readiness_changed(true);
                self.notifier.remote_stream(Some(RemoteStream::new(format!(
                    "openai-realtime-{}",
                    self.notifier.attempt()
                ))));
            }
            ServerEvent::AudioDelta { delta } => {
                if self.muted.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(pcm) = audio::decode_pcm16(&delta) {
                    self.audio.write_pcm16(&pcm);
                }
            }
            ServerEvent::FunctionCallDone {
                call_id,
                name,
                arguments,
            } => self.on_function_call(call_id, name, arguments),
            ServerEvent::InputTranscript {
                item_id,
                transcript,
            } => self
                .transcript
                .add_message(&item_id, MessageRole::User, transcript.trim()),
            ServerEvent::OutputTranscript {
                item_id,
                transcript,
            } => self
                .transcript
                .add_message(&item_id, MessageRole::Assistant, &transcript),
            ServerEvent::Error { error } => {
                warn!(message = %error.message, "Realtime API error");
                self.transcript
                    .add_breadcrumb("Realtime error", Some(json!({ "message": error.message })));
            }
            ServerEvent::Other => {}
        }
    }

    fn on_function_call(&mut self, call_id: String, name: String, arguments: String) {
        if let Some(target) = self.roster.transfer_target(&name).map(|a| a.name.clone()) {
            info!(agent = %target, "Agent handoff requested");
            self.roster.switch_to(&target);
            self.emit(protocol::function_call_output(
                &call_id,
                &json!({ "assistant": target }),
            ));
            self.emit(self.roster.session_update(false));
            self.emit(protocol::response_create());
            self.notifier.agent_handoff(target);
            return;
        }

        let tools = match (&self.tools, self.roster.allows_tool(&name)) {
            (Some(tools), true) => Arc::clone(tools),
            _ => {
                warn!(tool = %name, "Agent called an unavailable tool");
                self.emit(protocol::function_call_output(
                    &call_id,
                    &json!({ "error": "unknown_tool" }),
                ));
                self.emit(protocol::response_create());
                return;
            }
        };
        let arguments: Value =
            serde_json::from_str(&arguments).unwrap_or_else(|_| Value::Object(Default::default()));
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            let output = tools.call(&name, arguments).await;
            let _ = outbound.send(Outbound::Event(protocol::function_call_output(
                &call_id, &output,
            )));
            let _ = outbound.send(Outbound::Event(protocol::response_create()));
        });
    }

    fn emit(&self, event: Value) {
        let _ = self.outbound.send(Outbound::Event(event));
    }
}

//! Push-to-talk, playback mute and remote stream recording.

use super::SessionStatus;
use super::client_events::{input_audio_buffer_clear, input_audio_buffer_commit, response_create};
use crate::transcript::Transcript;
use crate::transport::RealtimeTransport;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum AudioError {
    #[error("Playback blocked: {0}")]
    PlaybackBlocked(String),
    #[error("Audio device error: {0}")]
    Device(String),
}

/// Identifies a remote audio stream delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// The local playback element.
pub trait AudioSink: Send + Sync {
    fn set_muted(&self, muted: bool);
    fn play(&self) -> Result<(), AudioError>;
    fn pause(&self);
    /// Raw 24 kHz mono PCM16 from the agent.
    fn write_pcm16(&self, _pcm: &[u8]) {}
}

/// Captures the remote stream while the session is connected.
pub trait StreamRecorder: Send + Sync {
    fn start(&self, stream: &RemoteStream);
    fn stop(&self);
}

/// A recorder that does nothing, for front ends without capture.
pub struct NoopRecorder;

impl StreamRecorder for NoopRecorder {
    fn start(&self, _stream: &RemoteStream) {}
    fn stop(&self) {}
}

pub struct AudioController {
    sink: Arc<dyn AudioSink>,
    recorder: Arc<dyn StreamRecorder>,
    playback_enabled: bool,
    user_speaking: bool,
    stream: Option<RemoteStream>,
    recording: bool,
}

impl AudioController {
    pub fn new(
        sink: Arc<dyn AudioSink>,
        recorder: Arc<dyn StreamRecorder>,
        playback_enabled: bool,
    ) -> Self {
        Self {
            sink,
            recorder,
            playback_enabled,
            user_speaking: false,
            stream: None,
            recording: false,
        }
    }

    pub fn sink(&self) -> Arc<dyn AudioSink> {
        Arc::clone(&self.sink)
    }

    pub fn playback_enabled(&self) -> bool {
        self.playback_enabled
    }

    pub fn user_speaking(&self) -> bool {
        self.user_speaking
    }

    pub fn recording(&self) -> bool {
        self.recording
    }

    pub fn push_to_talk_down(
        &mut self,
        ready: bool,
        transport: &dyn RealtimeTransport,
        transcript: &dyn Transcript,
    ) {
        if !ready {
            warn!("Push-to-talk ignored: session not ready");
            transcript.add_breadcrumb("Push-to-talk blocked: Connection not ready", None);
            return;
        }
        if let Err(e) = transport.interrupt() {
            warn!(error = %e, "Failed to interrupt agent on push-to-talk");
        }
        self.user_speaking = true;
        if let Err(e) = transport.send_event(input_audio_buffer_clear()) {
            warn!(error = %e, "Failed to clear input audio buffer");
            transcript.add_breadcrumb(
                "Failed to clear input audio buffer",
                Some(json!({ "error": e.to_string() })),
            );
        }
    }

    pub fn push_to_talk_up(
        &mut self,
        ready: bool,
        transport: &dyn RealtimeTransport,
        transcript: &dyn Transcript,
    ) {
        let was_speaking = std::mem::take(&mut self.user_speaking);
        if !ready || !was_speaking {
            debug!(ready, was_speaking, "Push-to-talk release ignored");
            return;
        }
        let sent = transport
            .send_event(input_audio_buffer_commit())
            .and_then(|_| transport.send_event(response_create()));
        if let Err(e) = sent {
            warn!(error = %e, "Failed to commit push-to-talk audio");
            transcript.add_breadcrumb(
                "Failed to commit audio",
                Some(json!({ "error": e.to_string() })),
            );
        }
    }

    pub fn reset_speaking(&mut self) {
        self.user_speaking = false;
    }

    /// Applies a playback toggle locally and, while connected, on the server.
    /// Returns false when the value did not change.
    pub fn set_playback_enabled(
        &mut self,
        enabled: bool,
        status: SessionStatus,
        transport: &dyn RealtimeTransport,
        transcript: &dyn Transcript,
    ) -> bool {
        if self.playback_enabled == enabled {
            return false;
        }
        self.playback_enabled = enabled;
        self.apply_local();
        if status == SessionStatus::Connected {
            self.apply_remote(transport, transcript);
        }
        true
    }

    /// Re-applies the mute state after a connect, since the transport resets it.
    pub fn reapply_mute(&self, transport: &dyn RealtimeTransport, transcript: &dyn Transcript) {
        self.apply_local();
        self.apply_remote(transport, transcript);
    }

    /// Stops any recording, then starts one if the session is connected and
    /// a remote stream is known.
    pub fn on_status_changed(&mut self, status: SessionStatus) {
        self.stop_recording();
        if status == SessionStatus::Connected {
            self.start_recording();
        }
    }

    pub fn on_remote_stream(&mut self, stream: Option<RemoteStream>, status: SessionStatus) {
        self.stop_recording();
        self.stream = stream;
        if status == SessionStatus::Connected {
            self.start_recording();
        }
    }

    fn start_recording(&mut self) {
        if let Some(stream) = &self.stream {
            info!(stream = %stream.id, "Recording remote audio");
            self.recorder.start(stream);
            self.recording = true;
        }
    }

    fn stop_recording(&mut self) {
        if self.recording {
            self.recorder.stop();
            self.recording = false;
        }
    }

    fn apply_local(&self) {
        self.sink.set_muted(!self.playback_enabled);
        if self.playback_enabled {
            if let Err(e) = self.sink.play() {
                warn!(error = %e, "Autoplay may be blocked by the audio device");
            }
        } else {
            self.sink.pause();
        }
    }

    fn apply_remote(&self, transport: &dyn RealtimeTransport, transcript: &dyn Transcript) {
        if let Err(e) = transport.mute(!self.playback_enabled) {
            warn!(error = %e, "Failed to mute/unmute transport");
            transcript.add_breadcrumb(
                "Failed to apply playback mute",
                Some(json!({ "error": e.to_string() })),
            );
        }
    }
}

//! Terminal rendering of the transcript and a headless audio sink.

use mentor_core::session::audio::{AudioError, AudioSink};
use mentor_core::transcript::{MessageRole, Transcript, TranscriptLog};
use serde_json::Value;
use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

/// Echoes transcript entries to a writer (stdout in the binary). Breadcrumbs
/// are only shown while logs are expanded; everything is kept in the log.
pub struct ConsoleTranscript<W: Write + Send> {
    log: TranscriptLog,
    out: Mutex<W>,
    logs_expanded: AtomicBool,
}

impl<W: Write + Send> ConsoleTranscript<W> {
    pub fn new(out: W, logs_expanded: bool) -> Self {
        Self {
            log: TranscriptLog::new(),
            out: Mutex::new(out),
            logs_expanded: AtomicBool::new(logs_expanded),
        }
    }

    pub fn set_logs_expanded(&self, expanded: bool) {
        self.logs_expanded.store(expanded, Ordering::SeqCst);
    }

    pub fn logs_expanded(&self) -> bool {
        self.logs_expanded.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> &TranscriptLog {
        &self.log
    }

    fn print(&self, line: &str) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

impl<W: Write + Send> Transcript for ConsoleTranscript<W> {
    fn add_breadcrumb(&self, label: &str, payload: Option<Value>) {
        if self.logs_expanded() {
            match &payload {
                Some(payload) => self.print(&format!("  · {label} {payload}")),
                None => self.print(&format!("  · {label}")),
            }
        }
        self.log.add_breadcrumb(label, payload);
    }

    fn add_message(&self, id: &str, role: MessageRole, text: &str) {
        let speaker = match role {
            MessageRole::User => "you",
            MessageRole::Assistant => "mentor",
        };
        self.print(&format!("{speaker}> {text}"));
        self.log.add_message(id, role, text);
    }
}

/// Accepts agent audio without an output device.
#[derive(Default)]
pub struct HeadlessSink {
    muted: AtomicBool,
    bytes: AtomicUsize,
}

impl HeadlessSink {
    pub fn bytes_received(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }
}

impl AudioSink for HeadlessSink {
    fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    fn play(&self) -> Result<(), AudioError> {
        Ok(())
    }

    fn pause(&self) {}

    fn write_pcm16(&self, pcm: &[u8]) {
        if self.muted.load(Ordering::SeqCst) {
            return;
        }
        let total = self.bytes.fetch_add(pcm.len(), Ordering::SeqCst) + pcm.len();
        debug!(bytes = pcm.len(), total, "Agent audio received");
    }
}

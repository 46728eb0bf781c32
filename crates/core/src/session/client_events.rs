//! Realtime client events emitted by the orchestrator.

use serde_json::{Value, json};
use uuid::Uuid;

pub const VAD_THRESHOLD: f64 = 0.9;
pub const VAD_PREFIX_PADDING_MS: u64 = 300;
pub const VAD_SILENCE_DURATION_MS: u64 = 500;

/// Turn detection policy: disabled under push-to-talk, server VAD otherwise.
pub fn turn_detection(push_to_talk: bool) -> Value {
    if push_to_talk {
        Value::Null
    } else {
        json!({
            "type": "server_vad",
            "threshold": VAD_THRESHOLD,
            "prefix_padding_ms": VAD_PREFIX_PADDING_MS,
            "silence_duration_ms": VAD_SILENCE_DURATION_MS,
            "create_response": true,
        })
    }
}

pub fn session_update(push_to_talk: bool) -> Value {
    json!({
        "type": "session.update",
        "session": { "turn_detection": turn_detection(push_to_talk) },
    })
}

/// A 32-character conversation item id.
pub fn new_item_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A user message injected as if typed, without going through `sendUserText`.
pub fn simulated_user_message(id: &str, text: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "id": id,
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": text }],
        },
    })
}

pub fn response_create() -> Value {
    json!({ "type": "response.create" })
}

pub fn input_audio_buffer_clear() -> Value {
    json!({ "type": "input_audio_buffer.clear" })
}

pub fn input_audio_buffer_commit() -> Value {
    json!({ "type": "input_audio_buffer.commit" })
}

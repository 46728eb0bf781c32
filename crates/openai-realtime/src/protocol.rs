//! Realtime API wire events.

use mentor_core::agents::AgentDescriptor;
use mentor_core::transport::ToolDefinition;
use serde::Deserialize;
use serde_json::{Value, json};

/// Server events the transport acts on. Everything else is ignored.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscript { item_id: String, transcript: String },
    #[serde(rename = "response.audio_transcript.done")]
    OutputTranscript { item_id: String, transcript: String },
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(other)]
    Other,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
}

/// Name of the function that hands the conversation to `agent`.
pub fn transfer_tool_name(agent: &str) -> String {
    let slug: String = agent
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("transfer_to_{slug}")
}

/// The agents of one connection and which of them is speaking.
#[derive(Debug, Clone)]
pub struct AgentRoster {
    agents: Vec<AgentDescriptor>,
    active: usize,
    tools: Vec<ToolDefinition>,
}

impl AgentRoster {
    /// The first agent is the root.
    pub fn new(agents: Vec<AgentDescriptor>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            agents,
            active: 0,
            tools,
        }
    }

    pub fn active(&self) -> Option<&AgentDescriptor> {
        self.agents.get(self.active)
    }

    /// Resolves a transfer function called by the active agent.
    pub fn transfer_target(&self, function_name: &str) -> Option<&AgentDescriptor> {
        let active = self.active()?;
        active
            .handoff_targets()
            .iter()
            .filter(|target| transfer_tool_name(target) == function_name)
            .find_map(|target| self.agents.iter().find(|a| &a.name == target))
    }

    pub fn switch_to(&mut self, name: &str) -> bool {
        match self.agents.iter().position(|a| a.name == name) {
            Some(idx) => {
                self.active = idx;
                true
            }
            None => false,
        }
    }

    pub fn allows_tool(&self, name: &str) -> bool {
        self.active()
            .is_some_and(|a| a.tool_names().iter().any(|t| t == name))
    }

    /// A `session.update` configuring the active agent. The voice can only be
    /// set before the first audio response, so it is sent on connect only.
    pub fn session_update(&self, include_voice: bool) -> Value {
        let Some(agent) = self.active() else {
            return json!({ "type": "session.update", "session": {} });
        };
        let allowed = agent.tool_names();
        let mut functions: Vec<Value> = self
            .tools
            .iter()
            .filter(|t| allowed.contains(&t.name))
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
        for target in agent.handoff_targets() {
            let Some(target_agent) = self.agents.iter().find(|a| a.name == target) else {
                continue;
            };
            let description = target_agent
                .capabilities
                .get("handoffDescription")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Transfer the conversation to {target}."));
            functions.push(json!({
                "type": "function",
                "name": transfer_tool_name(&target),
                "description": description,
                "parameters": { "type": "object", "properties": {}, "additionalProperties": false },
            }));
        }

        let mut session = json!({
            "instructions": agent.instructions().unwrap_or_default(),
            "modalities": ["text", "audio"],
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "input_audio_transcription": { "model": "whisper-1" },
            "tools": functions,
            "tool_choice": "auto",
        });
        if include_voice {
            if let Some(voice) = agent.voice() {
                session["voice"] = json!(voice);
            }
        }
        json!({ "type": "session.update", "session": session })
    }
}

pub fn user_message(text: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": text }],
        },
    })
}

pub fn function_call_output(call_id: &str, output: &Value) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output.to_string(),
        },
    })
}

pub fn response_create() -> Value {
    json!({ "type": "response.create" })
}

pub fn response_cancel() -> Value {
    json!({ "type": "response.cancel" })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> AgentRoster {
        AgentRoster::new(
            vec![
                AgentDescriptor::new(
                    "MethodologyMentor",
                    json!({
                        "instructions": "Drive the process.",
                        "voice": "sage",
                        "tools": ["sensemaker_note"],
                        "handoffs": ["TheoryMentor"],
                    }),
                ),
                AgentDescriptor::new(
                    "TheoryMentor",
                    json!({
                        "instructions": "Teach theory.",
                        "handoffDescription": "Expert in theory.",
                        "handoffs": ["MethodologyMentor"],
                    }),
                ),
            ],
            vec![
                ToolDefinition {
                    name: "sensemaker_note".into(),
                    description: "Normalize notes.".into(),
                    parameters: json!({ "type": "object" }),
                },
                ToolDefinition {
                    name: "reference_read".into(),
                    description: "Read a reference.".into(),
                    parameters: json!({ "type": "object" }),
                },
            ],
        )
    }

    #[test]
    fn server_events_parse_by_type() {
        let created: ServerEvent =
            serde_json::from_str(r#"{"type":"session.created","session":{"id":"s"}}"#).unwrap();
        assert_eq!(created, ServerEvent::SessionCreated);

        let call: ServerEvent = serde_json::from_str(
            r#"{"type":"response.function_call_arguments.done","call_id":"c1","name":"n","arguments":"{}","item_id":"i"}"#,
        )
        .unwrap();
        assert!(matches!(call, ServerEvent::FunctionCallDone { ref call_id, .. } if call_id == "c1"));

        let other: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert_eq!(other, ServerEvent::Other);
    }

    #[test]
    fn session_update_exposes_allowed_tools_and_transfers() {
        let update = roster().session_update(true);
        let session = &update["session"];
        assert_eq!(session["instructions"], "Drive the process.");
        assert_eq!(session["voice"], "sage");
        let names: Vec<&str> = session["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["sensemaker_note", "transfer_to_theorymentor"]);
        assert_eq!(session["tools"][1]["description"], "Expert in theory.");
    }

    #[test]
    fn transfer_resolves_only_declared_handoffs() {
        let mut roster = roster();
        assert_eq!(
            roster.transfer_target("transfer_to_theorymentor").map(|a| a.name.as_str()),
            Some("TheoryMentor")
        );
        assert!(roster.transfer_target("transfer_to_methodologymentor").is_none());

        assert!(roster.switch_to("TheoryMentor"));
        assert!(!roster.allows_tool("sensemaker_note"));
        assert!(roster.session_update(false)["session"].get("voice").is_none());
    }
}

//! Maps stdin lines to session intents.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Plain text for the active agent.
    Say(String),
    Connect,
    Disconnect,
    SelectAgent(String),
    ListAgents,
    PushToTalk(bool),
    TalkStart,
    TalkSend,
    Mute,
    Unmute,
    ToggleLogs,
    Upload(PathBuf),
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command: /{0} (try /help)")]
    Unknown(String),
    #[error("/{0} needs an argument: {1}")]
    MissingArgument(&'static str, &'static str),
    #[error("Invalid argument for /{0}: {1}")]
    InvalidArgument(&'static str, String),
}

pub const HELP: &str = "\
Commands:
  <text>            send a message to the active agent
  /connect          connect to the realtime session
  /disconnect       end the realtime session
  /agents           list the agents of the current set
  /agent <name>     switch to another agent
  /ptt on|off       enable or disable push-to-talk
  /talk, /send      start and finish a push-to-talk turn
  /mute, /unmute    toggle agent audio playback
  /logs             show or hide session logs
  /upload <path>    send a Sensemaker map screenshot for analysis
  /quit             leave";

/// Parses one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match name {
        "connect" => Command::Connect,
        "disconnect" => Command::Disconnect,
        "agents" => Command::ListAgents,
        "agent" if arg.is_empty() => {
            return Err(CommandError::MissingArgument("agent", "<name>"));
        }
        "agent" => Command::SelectAgent(arg.to_string()),
        "ptt" => match arg {
            "on" => Command::PushToTalk(true),
            "off" => Command::PushToTalk(false),
            "" => return Err(CommandError::MissingArgument("ptt", "on|off")),
            other => return Err(CommandError::InvalidArgument("ptt", other.to_string())),
        },
        "talk" => Command::TalkStart,
        "send" => Command::TalkSend,
        "mute" => Command::Mute,
        "unmute" => Command::Unmute,
        "logs" => Command::ToggleLogs,
        "upload" if arg.is_empty() => {
            return Err(CommandError::MissingArgument("upload", "<path>"));
        }
        "upload" => Command::Upload(PathBuf::from(arg)),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// MIME type guessed from the file extension.
pub fn guess_mime(path: &std::path::Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

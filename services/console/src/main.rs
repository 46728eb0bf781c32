//! Mentor Console
//!
//! A terminal front end for the realtime mentor session. Lines typed on stdin
//! become session intents; transcript messages and breadcrumbs are echoed to
//! stdout, diagnostics go to stderr through `tracing`.

mod commands;
mod config;
mod output;

use anyhow::Context;
use clap::Parser;
use commands::{Command, HELP};
use config::{Cli, Config};
use mentor_core::agents::{AgentSet, AgentSetRegistry};
use mentor_core::credentials::HttpCredentialProvider;
use mentor_core::preferences::{AudioPreferences, JsonFilePreferenceStore};
use mentor_core::session::audio::NoopRecorder;
use mentor_core::tools::{McpToolExecutor, MentorToolConfig, MentorToolService};
use mentor_core::transport::ToolExecutor;
use mentor_core::upload::ImageFile;
use mentor_core::{Collaborators, Orchestrator, OrchestratorSettings, SessionHandle};
use openai_realtime::{OpenAiRealtimeTransport, RealtimeConfig};
use output::{ConsoleTranscript, HeadlessSink};
use std::io::Stdout;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()
        .context("Failed to load configuration")?
        .with_cli(&cli);

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let registry = AgentSetRegistry::builtin().context("Failed to load the built-in agent sets")?;
    let agent_set = registry.resolve(config.agent_config.as_deref()).clone();

    let preference_store = Arc::new(
        JsonFilePreferenceStore::open(&config.preferences_path).with_context(|| {
            format!(
                "Failed to open preferences at {}",
                config.preferences_path.display()
            )
        })?,
    );
    let preferences = AudioPreferences::load(preference_store.as_ref());

    let tool_config = MentorToolConfig::new(&config.api_url, &config.refs_dir);
    let tools: Option<Arc<dyn ToolExecutor>> =
        match McpToolExecutor::start(MentorToolService::new(tool_config)).await {
            Ok(executor) => Some(Arc::new(executor)),
            Err(e) => {
                warn!(error = %e, "Mentor tools unavailable; continuing without them");
                None
            }
        };

    let transcript = Arc::new(ConsoleTranscript::new(
        std::io::stdout(),
        preferences.logs_expanded,
    ));
    let audio_sink = Arc::new(HeadlessSink::default());
    let collaborators = Collaborators {
        transport: Arc::new(OpenAiRealtimeTransport::new(RealtimeConfig::new(
            config.realtime_model.clone(),
        ))),
        credentials: Arc::new(HttpCredentialProvider::new(&config.api_url)),
        transcript: transcript.clone(),
        preferences: preference_store,
        audio_sink: audio_sink.clone(),
        recorder: Arc::new(NoopRecorder),
        tools,
    };

    info!(
        agent_set = %agent_set.key(),
        api_url = %config.api_url,
        model = %config.realtime_model,
        "Starting mentor console"
    );
    let (orchestrator, handle) =
        Orchestrator::new(agent_set.clone(), collaborators, OrchestratorSettings::default());
    let session = tokio::spawn(orchestrator.run());

    let mut status = handle.watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            println!("[{current}]");
        }
    });

    println!(
        "Mentor console ({}) - type /help for commands.",
        agent_set.key()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match commands::parse(&line) {
            Ok(Some(command)) => {
                let flow = apply(command, &handle, &transcript, &agent_set);
                if flow.is_break() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => println!("{e}"),
        }
    }

    handle.shutdown();
    session.await.context("Session orchestrator panicked")?;
    info!(
        transcript_entries = transcript.log().entries().len(),
        audio_bytes = audio_sink.bytes_received(),
        "Mentor console closed"
    );
    Ok(())
}

fn apply(
    command: Command,
    handle: &SessionHandle,
    transcript: &ConsoleTranscript<Stdout>,
    agent_set: &AgentSet,
) -> ControlFlow<()> {
    match command {
        Command::Say(text) => handle.send_text(text),
        Command::Connect => handle.connect(),
        Command::Disconnect => handle.disconnect(),
        Command::SelectAgent(name) => handle.select_agent(name),
        Command::ListAgents => {
            for agent in agent_set.agents() {
                println!("  {}", agent.name);
            }
        }
        Command::PushToTalk(enabled) => handle.set_push_to_talk(enabled),
        Command::TalkStart => handle.push_to_talk_down(),
        Command::TalkSend => handle.push_to_talk_up(),
        Command::Mute => handle.set_playback_enabled(false),
        Command::Unmute => handle.set_playback_enabled(true),
        Command::ToggleLogs => {
            let expanded = !transcript.logs_expanded();
            transcript.set_logs_expanded(expanded);
            handle.set_logs_expanded(expanded);
        }
        Command::Upload(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let mime_type = commands::guess_mime(&path);
            handle.upload_image(ImageFile::new(name, mime_type, path));
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return ControlFlow::Break(()),
    }
    ControlFlow::Continue(())
}

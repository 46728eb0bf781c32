use clap::Parser;
use openai_realtime::DEFAULT_REALTIME_MODEL;
use std::path::PathBuf;
use tracing::Level;

pub const DEFAULT_API_URL: &str = "http://localhost:3000";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Command line flags. Each one overrides its environment variable.
#[derive(Parser, Debug)]
#[command(name = "mentor")]
#[command(version, about = "Talk to the Atchalta mentors from the terminal", long_about = None)]
pub struct Cli {
    /// Agent set to load (overrides AGENT_CONFIG)
    #[arg(long)]
    pub agent_config: Option<String>,
    /// Backend origin serving /api/session and /api/responses (overrides MENTOR_API_URL)
    #[arg(long)]
    pub api_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: String,
    pub agent_config: Option<String>,
    pub preferences_path: PathBuf,
    pub refs_dir: PathBuf,
    pub realtime_model: String,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let api_url = std::env::var("MENTOR_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(
                "MENTOR_API_URL".to_string(),
                format!("'{}' is not an http(s) URL", api_url),
            ));
        }

        let agent_config = std::env::var("AGENT_CONFIG")
            .ok()
            .filter(|key| !key.trim().is_empty());

        let preferences_path = std::env::var("PREFERENCES_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./mentor-preferences.json"));

        let refs_dir = std::env::var("REFS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./refs"));

        let realtime_model =
            std::env::var("REALTIME_MODEL").unwrap_or_else(|_| DEFAULT_REALTIME_MODEL.to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "WARN".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            api_url,
            agent_config,
            preferences_path,
            refs_dir,
            realtime_model,
            log_level,
        })
    }

    pub fn with_cli(mut self, cli: &Cli) -> Self {
        if let Some(key) = &cli.agent_config {
            self.agent_config = Some(key.clone());
        }
        if let Some(url) = &cli.api_url {
            self.api_url = url.trim_end_matches('/').to_string();
        }
        self
    }
}

//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the configuration
//! and the HTTP client used to reach the OpenAI API.

use crate::config::Config;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn upstream_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.openai_api_base, path.trim_start_matches('/'))
    }
}

//! Mentor API Library Crate
//!
//! The backend the mentor clients talk to: it mints ephemeral realtime keys
//! and proxies Responses API calls so the server API key never leaves this
//! process. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;

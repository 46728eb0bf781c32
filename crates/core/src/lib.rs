//! Mentor Core
//!
//! The client-side realtime session orchestrator. It owns the lifecycle of a
//! live audio+event connection to a voice-agent backend and mediates every
//! user action (typed text, push-to-talk, uploads, mute toggles, agent
//! switches) against the connection's readiness.
//!
//! - `session`: the orchestrator and its four components.
//! - `transport`: the capability contract a realtime transport must satisfy.
//! - `credentials`: ephemeral key acquisition for a single connect attempt.
//! - `agents`: agent descriptors, agent sets and the scenario registry.
//! - `transcript`: the breadcrumb sink the orchestrator writes diagnostics to.
//! - `preferences`: persisted audio/UI preferences.
//! - `upload`: image intake for map analysis requests.
//! - `tools`: the MCP tool service backing the mentor agents.

pub mod agents;
pub mod credentials;
pub mod preferences;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod transport;
pub mod upload;

pub use session::{
    Collaborators, Orchestrator, OrchestratorSettings, SessionEvent, SessionHandle, SessionStatus,
};

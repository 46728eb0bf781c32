//! Agent descriptors, agent sets and the scenario registry.
//!
//! An `AgentSet` is loaded once per configuration and never mutated. The only
//! derived view is the connect ordering, where the chosen root agent is moved
//! to the front while everything else keeps its relative position.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Agent sets shipped with the crate.
const BUILTIN_SETS: &str = include_str!("../agents/builtin.json");

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AgentSetError {
    #[error("Agent set '{0}' contains no agents")]
    Empty(String),
    #[error("Agent set '{set}' contains agent '{agent}' more than once")]
    DuplicateAgent { set: String, agent: String },
    #[error("Default agent set '{0}' is not registered")]
    UnknownDefault(String),
    #[error("Failed to parse agent sets: {0}")]
    Parse(String),
}

/// One persona in an agent set. `capabilities` is opaque to the orchestrator
/// and only interpreted by the transport (instructions, tools, handoffs, voice).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentDescriptor {
    pub name: String,
    #[serde(default)]
    pub capabilities: Value,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, capabilities: Value) -> Self {
        Self {
            name: name.into(),
            capabilities,
        }
    }

    /// Names of the agents this one may hand off to.
    pub fn handoff_targets(&self) -> Vec<String> {
        self.string_list("handoffs")
    }

    /// Names of the tools this agent may call.
    pub fn tool_names(&self) -> Vec<String> {
        self.string_list("tools")
    }

    pub fn instructions(&self) -> Option<&str> {
        self.capabilities.get("instructions").and_then(Value::as_str)
    }

    pub fn voice(&self) -> Option<&str> {
        self.capabilities.get("voice").and_then(Value::as_str)
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        self.capabilities
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A non-empty, ordered, immutable sequence of agents.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSet {
    key: String,
    company_name: String,
    agents: Vec<AgentDescriptor>,
}

impl AgentSet {
    pub fn new(
        key: impl Into<String>,
        company_name: impl Into<String>,
        agents: Vec<AgentDescriptor>,
    ) -> Result<Self, AgentSetError> {
        let key = key.into();
        if agents.is_empty() {
            return Err(AgentSetError::Empty(key));
        }
        for (i, agent) in agents.iter().enumerate() {
            if agents[..i].iter().any(|a| a.name == agent.name) {
                return Err(AgentSetError::DuplicateAgent {
                    set: key,
                    agent: agent.name.clone(),
                });
            }
        }
        Ok(Self {
            key,
            company_name: company_name.into(),
            agents,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Company name handed to the transport's output guardrail.
    pub fn company_name(&self) -> &str {
        &self.company_name
    }

    pub fn agents(&self) -> &[AgentDescriptor] {
        &self.agents
    }

    pub fn head(&self) -> &AgentDescriptor {
        &self.agents[0]
    }

    pub fn get(&self, name: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns the agents with `root` moved to the front (stable move-to-front).
    /// An unknown root leaves the ordering untouched.
    pub fn ordered_with_root(&self, root: &str) -> Vec<AgentDescriptor> {
        let mut ordered = self.agents.clone();
        if let Some(idx) = ordered.iter().position(|a| a.name == root) {
            if idx > 0 {
                let agent = ordered.remove(idx);
                ordered.insert(0, agent);
            }
        }
        ordered
    }
}

#[derive(Deserialize)]
struct RegistryFile {
    default: String,
    sets: BTreeMap<String, SetFile>,
}

#[derive(Deserialize)]
struct SetFile {
    company_name: String,
    agents: Vec<AgentDescriptor>,
}

/// Named agent sets (scenarios) with a default used for unknown keys.
#[derive(Debug, Clone)]
pub struct AgentSetRegistry {
    default_key: String,
    sets: BTreeMap<String, AgentSet>,
}

impl AgentSetRegistry {
    pub fn new(default_key: impl Into<String>, sets: Vec<AgentSet>) -> Result<Self, AgentSetError> {
        let default_key = default_key.into();
        let sets: BTreeMap<String, AgentSet> = sets
            .into_iter()
            .map(|set| (set.key().to_string(), set))
            .collect();
        if !sets.contains_key(&default_key) {
            return Err(AgentSetError::UnknownDefault(default_key));
        }
        Ok(Self { default_key, sets })
    }

    /// Parses a registry document: `{ "default": key, "sets": { key: { company_name, agents } } }`.
    pub fn from_json(json: &str) -> Result<Self, AgentSetError> {
        let file: RegistryFile =
            serde_json::from_str(json).map_err(|e| AgentSetError::Parse(e.to_string()))?;
        let sets = file
            .sets
            .into_iter()
            .map(|(key, set)| AgentSet::new(key, set.company_name, set.agents))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(file.default, sets)
    }

    /// The agent sets compiled into the crate.
    pub fn builtin() -> Result<Self, AgentSetError> {
        Self::from_json(BUILTIN_SETS)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sets.keys().map(String::as_str)
    }

    pub fn default_key(&self) -> &str {
        &self.default_key
    }

    /// Returns the requested set, falling back to the default set when the key
    /// is absent or unknown.
    pub fn resolve(&self, key: Option<&str>) -> &AgentSet {
        match key.and_then(|k| self.sets.get(k)) {
            Some(set) => set,
            None => {
                if let Some(k) = key {
                    tracing::warn!(requested = %k, fallback = %self.default_key, "Unknown agent set, using default");
                }
                &self.sets[&self.default_key]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn abc() -> AgentSet {
        AgentSet::new(
            "test",
            "Acme",
            vec![
                AgentDescriptor::new("A", json!({})),
                AgentDescriptor::new("B", json!({})),
                AgentDescriptor::new("C", json!({})),
            ],
        )
        .unwrap()
    }

    fn names(agents: &[AgentDescriptor]) -> Vec<&str> {
        agents.iter().map(|a| a.name.as_str()).collect()
    }

    #[test]
    fn move_to_front_keeps_relative_order() {
        let set = abc();
        assert_eq!(names(&set.ordered_with_root("C")), ["C", "A", "B"]);
        assert_eq!(names(&set.ordered_with_root("B")), ["B", "A", "C"]);
        assert_eq!(names(&set.ordered_with_root("A")), ["A", "B", "C"]);
        // The set itself is never reordered.
        assert_eq!(names(set.agents()), ["A", "B", "C"]);
    }

    #[test]
    fn unknown_root_keeps_ordering() {
        assert_eq!(names(&abc().ordered_with_root("Z")), ["A", "B", "C"]);
    }

    #[test]
    fn empty_and_duplicate_sets_are_rejected() {
        assert_eq!(
            AgentSet::new("none", "Acme", vec![]).unwrap_err(),
            AgentSetError::Empty("none".into())
        );
        let dup = AgentSet::new(
            "dup",
            "Acme",
            vec![
                AgentDescriptor::new("A", json!({})),
                AgentDescriptor::new("A", json!({})),
            ],
        );
        assert!(matches!(dup, Err(AgentSetError::DuplicateAgent { .. })));
    }

    #[test]
    fn capabilities_accessors() {
        let agent = AgentDescriptor::new(
            "Mentor",
            json!({
                "instructions": "Be brief.",
                "voice": "sage",
                "tools": ["reference_read", 3],
                "handoffs": ["Other"]
            }),
        );
        assert_eq!(agent.instructions(), Some("Be brief."));
        assert_eq!(agent.voice(), Some("sage"));
        assert_eq!(agent.tool_names(), vec!["reference_read".to_string()]);
        assert_eq!(agent.handoff_targets(), vec!["Other".to_string()]);
        assert!(AgentDescriptor::new("Bare", Value::Null).tool_names().is_empty());
    }

    #[test]
    fn builtin_registry_resolves_with_fallback() {
        let registry = AgentSetRegistry::builtin().expect("builtin sets parse");
        assert_eq!(registry.default_key(), "atchalta");

        let set = registry.resolve(Some("atchalta"));
        assert_eq!(set.head().name, "AtchaltaMethodologyMentor");
        assert_eq!(set.company_name(), "Atchalta");

        assert_eq!(registry.resolve(Some("no-such-set")).key(), "atchalta");
        assert_eq!(registry.resolve(None).key(), "atchalta");
    }

    #[test]
    fn registry_requires_known_default() {
        let err = AgentSetRegistry::new("missing", vec![abc()]).unwrap_err();
        assert_eq!(err, AgentSetError::UnknownDefault("missing".into()));
    }
}

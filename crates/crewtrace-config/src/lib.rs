//! Configuration for the crewtrace server and the coordination detector.
//!
//! Values come from an optional JSON file, then environment overrides. Every
//! section has defaults so an empty file (or no file) is a valid config.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crewtrace_core::{Severity, SpanType};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "CREWTRACE_CONFIG";

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub broadcaster: BroadcasterConfig,
    pub analysis: AnalysisConfig,
    pub replay: ReplayConfig,
    pub policy: DetectorPolicy,
}

impl EngineConfig {
    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Builds the config from `CREWTRACE_CONFIG` (if set) and environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies `BIND_ADDR`, `DATABASE_PATH`, `CORS_ORIGINS`, `REPLAY_WEBHOOK_URL`
    /// and `BROADCAST_QUEUE_CAPACITY` from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            self.server.database_path = path;
        }
        if let Some(origins) = lookup("CORS_ORIGINS") {
            self.server.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(url) = lookup("REPLAY_WEBHOOK_URL").filter(|u| !u.is_empty()) {
            self.replay.webhook_url = Some(url);
        }
        if let Some(capacity) = lookup("BROADCAST_QUEUE_CAPACITY").and_then(|c| c.parse().ok()) {
            self.broadcaster.queue_capacity = capacity;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broadcaster.queue_capacity == 0 {
            return Err(ConfigError::Invalid("broadcaster.queue_capacity must be at least 1".into()));
        }
        if self.analysis.cache_capacity == 0 {
            return Err(ConfigError::Invalid("analysis.cache_capacity must be at least 1".into()));
        }
        self.policy.validate()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_path: String,
    /// Allowed CORS origins; `*` allows any.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".into(),
            database_path: "data/crewtrace.db".into(),
            cors_origins: vec!["*".into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Per-subscriber queue length before the oldest message is dropped.
    pub queue_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Runs whose trace and report stay cached; the least recently read is evicted.
    pub cache_capacity: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self { cache_capacity: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Collaborator endpoint that re-executes a step. Replays are only
    /// acknowledged when unset.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 5,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Detector Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Health score deductions per failure, by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityWeights {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            high: 15,
            medium: 7,
            low: 3,
        }
    }
}

impl SeverityWeights {
    pub fn weight(&self, severity: Severity) -> u32 {
        match severity {
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }
}

/// Subtype assigned to an unmatched claim when no span on its ancestor chain
/// declares available tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UndeclaredToolsSubtype {
    #[default]
    ClaimedWithoutAction,
    ToolNotAvailable,
}

/// A field a span of some type must carry once terminal.
///
/// Written in config as `tokens`, `cost`, `output`, `end_time` or
/// `metadata.<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldRequirement {
    Tokens,
    Cost,
    Output,
    EndTime,
    Metadata(String),
}

impl TryFrom<String> for FieldRequirement {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "tokens" => Ok(FieldRequirement::Tokens),
            "cost" => Ok(FieldRequirement::Cost),
            "output" => Ok(FieldRequirement::Output),
            "end_time" => Ok(FieldRequirement::EndTime),
            other => match other.strip_prefix("metadata.") {
                Some(key) if !key.is_empty() => Ok(FieldRequirement::Metadata(key.to_string())),
                _ => Err(format!("unknown field requirement '{other}'")),
            },
        }
    }
}

impl From<FieldRequirement> for String {
    fn from(value: FieldRequirement) -> Self {
        value.to_string()
    }
}

impl fmt::Display for FieldRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRequirement::Tokens => write!(f, "tokens"),
            FieldRequirement::Cost => write!(f, "cost"),
            FieldRequirement::Output => write!(f, "output"),
            FieldRequirement::EndTime => write!(f, "end_time"),
            FieldRequirement::Metadata(key) => write!(f, "metadata.{key}"),
        }
    }
}

/// Per-agent coordination contract, keyed by agent name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentContract {
    pub max_duration_ms: Option<u64>,
    /// Agent name the span's parent must have.
    pub expected_parent: Option<String>,
    /// Keys the span's JSON output must contain.
    pub required_output_keys: Vec<String>,
    /// The agent must start before every other agent span in the trace.
    pub must_run_first: bool,
    /// Agents that must have finished before this one starts.
    pub must_run_after: Vec<String>,
}

/// Tunable heuristics of the coordination detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorPolicy {
    pub weights: SeverityWeights,
    /// Metadata key holding a span's declared available tools.
    pub available_tools_key: String,
    pub undeclared_tools_subtype: UndeclaredToolsSubtype,
    /// Models spans may claim in `metadata.model`. Empty disables the check.
    pub known_models: Vec<String>,
    /// Phrases that affirm success in free-text output.
    pub success_phrases: Vec<String>,
    /// Phrases that claim finished work. An agent or tool span using one with
    /// no recorded action is a hallucination. Empty disables the check.
    pub completion_phrases: Vec<String>,
    /// Path prefixes of API endpoints that exist. `/api/...` references in
    /// output matching none of them are invented. Empty disables the check.
    pub known_api_prefixes: Vec<String>,
    /// Metadata key listing the parent fields a span consumes.
    pub required_context_key: String,
    pub span_requirements: BTreeMap<SpanType, Vec<FieldRequirement>>,
    pub agent_contracts: BTreeMap<String, AgentContract>,
}

impl Default for DetectorPolicy {
    fn default() -> Self {
        Self {
            weights: SeverityWeights::default(),
            available_tools_key: "available_tools".into(),
            undeclared_tools_subtype: UndeclaredToolsSubtype::default(),
            known_models: Vec::new(),
            success_phrases: [
                "successfully",
                "completed",
                "succeeded",
                "task finished",
                "all validations passed",
                "done",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            completion_phrases: ["done", "completed", "updated", "task finished", "successfully"]
                .into_iter()
                .map(String::from)
                .collect(),
            known_api_prefixes: Vec::new(),
            required_context_key: "required_context".into(),
            span_requirements: default_span_requirements(),
            agent_contracts: BTreeMap::new(),
        }
    }
}

fn default_span_requirements() -> BTreeMap<SpanType, Vec<FieldRequirement>> {
    let meta = |key: &str| FieldRequirement::Metadata(key.to_string());
    BTreeMap::from([
        (SpanType::LlmCall, vec![FieldRequirement::Tokens, meta("model")]),
        (SpanType::ApiCall, vec![meta("http_method"), meta("http_url")]),
        (SpanType::Database, vec![meta("db_operation"), meta("db_collection")]),
        (SpanType::Tool, vec![meta("tool_name")]),
    ])
}

impl DetectorPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let w = &self.weights;
        if !(w.high > w.medium && w.medium > w.low) {
            return Err(ConfigError::Invalid(format!(
                "severity weights must satisfy high > medium > low (got {}/{}/{})",
                w.high, w.medium, w.low
            )));
        }
        let blank = |phrases: &[String]| phrases.iter().any(|p| p.trim().is_empty());
        if blank(&self.success_phrases) || blank(&self.completion_phrases) {
            return Err(ConfigError::Invalid("success and completion phrases must not be blank".into()));
        }
        for (agent, contract) in &self.agent_contracts {
            if contract.must_run_after.iter().any(|a| a == agent) {
                return Err(ConfigError::Invalid(format!("agent '{agent}' cannot be required to run after itself")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.policy.weights, SeverityWeights { high: 15, medium: 7, low: 3 });
        assert_eq!(config.broadcaster.queue_capacity, 64);
    }

    #[test]
    fn test_partial_policy_override() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "policy": {
                    "weights": {"high": 20, "medium": 10, "low": 1},
                    "undeclared_tools_subtype": "TOOL_NOT_AVAILABLE",
                    "span_requirements": {"retrieval": ["output", "metadata.index"]},
                    "agent_contracts": {"reporter": {"max_duration_ms": 3000}}
                }
            }"#,
        )
        .unwrap();
        let policy = &config.policy;
        assert_eq!(policy.weights.high, 20);
        assert_eq!(policy.undeclared_tools_subtype, UndeclaredToolsSubtype::ToolNotAvailable);
        assert_eq!(
            policy.span_requirements[&SpanType::Retrieval],
            vec![FieldRequirement::Output, FieldRequirement::Metadata("index".into())]
        );
        assert_eq!(policy.agent_contracts["reporter"].max_duration_ms, Some(3000));
        assert_eq!(policy.available_tools_key, "available_tools");
    }

    #[test]
    fn test_unknown_field_requirement_rejected() {
        let result: Result<DetectorPolicy, _> =
            serde_json::from_str(r#"{"span_requirements": {"tool": ["metadata."]}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_weights_must_be_ordered() {
        let mut config = EngineConfig::default();
        config.policy.weights = SeverityWeights { high: 1, medium: 5, low: 0 };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.policy.weights = SeverityWeights { high: 7, medium: 7, low: 3 };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.policy.weights = SeverityWeights { high: 10, medium: 1, low: 0 };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_weights_fill_from_defaults() {
        let policy: DetectorPolicy = serde_json::from_str(r#"{"weights": {"high": 20}}"#).unwrap();
        assert_eq!(policy.weights, SeverityWeights { high: 20, medium: 7, low: 3 });
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_ordering_contract_fields() {
        let policy: DetectorPolicy = serde_json::from_str(
            r#"{"agent_contracts": {
                "analyzer": {"must_run_first": true},
                "reporter": {"must_run_after": ["analyzer", "data_collector"]}
            }}"#,
        )
        .unwrap();
        assert!(policy.agent_contracts["analyzer"].must_run_first);
        assert_eq!(policy.agent_contracts["reporter"].must_run_after, vec!["analyzer", "data_collector"]);
        assert!(policy.validate().is_ok());

        let mut looped = policy.clone();
        looped.agent_contracts.insert(
            "writer".into(),
            AgentContract {
                must_run_after: vec!["writer".into()],
                ..AgentContract::default()
            },
        );
        assert!(matches!(looped.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_cache_capacity_must_be_positive() {
        let mut config = EngineConfig::default();
        assert_eq!(config.analysis.cache_capacity, 256);
        config.analysis.cache_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config.apply_overrides(|key| match key {
            "BIND_ADDR" => Some("127.0.0.1:9000".into()),
            "CORS_ORIGINS" => Some("http://a.test, http://b.test".into()),
            "REPLAY_WEBHOOK_URL" => Some("http://runner.test/replay".into()),
            "BROADCAST_QUEUE_CAPACITY" => Some("8".into()),
            _ => None,
        });
        assert_eq!(config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.server.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert_eq!(config.replay.webhook_url.as_deref(), Some("http://runner.test/replay"));
        assert_eq!(config.broadcaster.queue_capacity, 8);
        assert_eq!(config.server.database_path, "data/crewtrace.db");
    }

    #[test]
    fn test_field_requirement_display_round_trip() {
        for req in [
            FieldRequirement::Tokens,
            FieldRequirement::EndTime,
            FieldRequirement::Metadata("model".into()),
        ] {
            assert_eq!(FieldRequirement::try_from(req.to_string()).unwrap(), req);
        }
    }
}

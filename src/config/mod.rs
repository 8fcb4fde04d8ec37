//! Engine configuration: TOML file plus environment overrides.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    pub quality: QualityConfig,
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub bus: BusConfig,
    pub store: StoreConfig,
}

impl EngineConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies the environment variables the engine consumes on top of the
    /// current values. Unset variables leave the config untouched.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("LLM_ENDPOINT") {
            self.llm.endpoint = Some(endpoint);
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            self.llm.provider = provider;
        }
        if let Ok(v) = std::env::var("MAX_CONCURRENT_LLM") {
            self.llm.max_concurrent = v
                .parse()
                .map_err(|_| EngineError::Config(format!("MAX_CONCURRENT_LLM: {}", v)))?;
        }
        if let Ok(v) = std::env::var("MAX_SESSIONS") {
            self.orchestrator.max_sessions = v
                .parse()
                .map_err(|_| EngineError::Config(format!("MAX_SESSIONS: {}", v)))?;
        }
        if let Ok(v) = std::env::var("IDLE_TIMEOUT_SECONDS") {
            self.orchestrator.idle_timeout_secs = v
                .parse()
                .map_err(|_| EngineError::Config(format!("IDLE_TIMEOUT_SECONDS: {}", v)))?;
        }
        if let Ok(path) = std::env::var("STORE_PATH") {
            self.store.path = PathBuf::from(path);
        }
        Ok(())
    }

    pub async fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values for consistency and safety.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.orchestrator.max_sessions == 0 {
            errors.push("max_sessions must be greater than 0");
        }
        if self.orchestrator.max_agents_per_session == 0 {
            errors.push("max_agents_per_session must be greater than 0");
        }
        if self.orchestrator.max_rounds == 0 {
            errors.push("max_rounds must be greater than 0");
        }
        if self.orchestrator.max_questions_per_round == 0 {
            errors.push("max_questions_per_round must be greater than 0");
        }
        if self.orchestrator.max_high_priority_per_round > self.orchestrator.max_questions_per_round
        {
            errors.push("max_high_priority_per_round must not exceed max_questions_per_round");
        }
        if self.orchestrator.idle_timeout_secs == 0 {
            errors.push("idle_timeout_secs must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.quality.overall_threshold) {
            errors.push("quality.overall_threshold must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.quality.critical_threshold) {
            errors.push("quality.critical_threshold must be between 0.0 and 1.0");
        }
        if self.quality.floor_threshold > self.quality.overall_threshold {
            errors.push("quality.floor_threshold must not exceed quality.overall_threshold");
        }

        if self.agent.max_cycles == 0 {
            errors.push("agent.max_cycles must be greater than 0");
        }

        if self.llm.max_concurrent == 0 {
            errors.push("llm.max_concurrent must be greater than 0");
        }
        if self.llm.breaker.failure_threshold == 0 {
            errors.push("llm.breaker.failure_threshold must be greater than 0");
        }
        for (name, mode) in [
            ("quick", &self.llm.quick),
            ("standard", &self.llm.standard),
            ("deep", &self.llm.deep),
        ] {
            if mode.timeout_secs == 0 {
                errors.push(match name {
                    "quick" => "llm.quick.timeout_secs must be greater than 0",
                    "standard" => "llm.standard.timeout_secs must be greater than 0",
                    _ => "llm.deep.timeout_secs must be greater than 0",
                });
            }
        }

        if self.bus.retention == 0 {
            errors.push("bus.retention must be greater than 0");
        }
        if self.bus.heartbeat_secs == 0 {
            errors.push("bus.heartbeat_secs must be greater than 0");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-process cap on concurrently active sessions.
    pub max_sessions: usize,
    /// Per-session cap on concurrently running agent tasks.
    pub max_agents_per_session: usize,
    /// Maximum clarification rounds before forced resolution.
    pub max_rounds: u32,
    /// Questions generated per clarification round.
    pub max_questions_per_round: usize,
    /// High-priority question budget per round.
    pub max_high_priority_per_round: usize,
    /// Seconds without user input in clarifying before failing the session.
    pub idle_timeout_secs: u64,
    /// Non-terminal sessions whose last event is older than this are failed
    /// during restart recovery.
    pub stale_threshold_secs: u64,
    /// Windup budget for in-flight tasks on cancellation.
    pub cancel_windup_secs: u64,
    /// Minimum interval between progress events per task.
    pub progress_interval_ms: u64,
    /// In-place retries for transient task failures.
    pub transient_retries: u32,
    /// Backoff schedule for transient retries, one entry per retry.
    pub transient_backoff_ms: Vec<u64>,
    /// Days since last activity before a terminal session is purged.
    pub retention_days: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            max_agents_per_session: 3,
            max_rounds: 8,
            max_questions_per_round: 5,
            max_high_priority_per_round: 3,
            idle_timeout_secs: 1800,
            stale_threshold_secs: 900,
            cancel_windup_secs: 5,
            progress_interval_ms: 200,
            transient_retries: 2,
            transient_backoff_ms: vec![500, 2000],
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Overall score required for the clarification gate (inclusive).
    pub overall_threshold: f64,
    /// Minimum score for each critical dimension (inclusive).
    pub critical_threshold: f64,
    /// Overall floor required to promote when max_rounds is hit.
    pub floor_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            overall_threshold: 0.8,
            critical_threshold: 0.7,
            floor_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Task-level cycle budget per session mode.
    pub timeout_quick_secs: u64,
    pub timeout_standard_secs: u64,
    pub timeout_deep_secs: u64,
    /// Think-Act-Reflect cycles before the result is surfaced regardless.
    pub max_cycles: u32,
    /// Re-parse attempts for a malformed Think response.
    pub think_parse_retries: u32,
    /// Default reflect gate threshold when the role does not override it.
    pub default_threshold: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            timeout_quick_secs: 30,
            timeout_standard_secs: 90,
            timeout_deep_secs: 180,
            max_cycles: 2,
            think_parse_retries: 1,
            default_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeParams {
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ModeParams {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_tokens: 4096,
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    /// Process-global cap on in-flight provider calls.
    pub max_concurrent: usize,
    pub quick: ModeParams,
    pub standard: ModeParams,
    pub deep: ModeParams,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            endpoint: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            max_concurrent: 3,
            quick: ModeParams {
                timeout_secs: 20,
                max_tokens: 1024,
                temperature: 0.0,
            },
            standard: ModeParams {
                timeout_secs: 60,
                max_tokens: 4096,
                temperature: 0.0,
            },
            deep: ModeParams {
                timeout_secs: 120,
                max_tokens: 8192,
                temperature: 0.2,
            },
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries for network and 5xx failures only.
    pub max_retries: u32,
    /// Backoff schedule, one entry per retry.
    pub backoff_ms: Vec<u64>,
    /// Jitter applied to each backoff, as a percentage of the delay.
    pub jitter_pct: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: vec![250, 1000],
            jitter_pct: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Window for counting consecutive failures.
    pub failure_window_secs: u64,
    /// Open duration before a half-open probe is allowed.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events retained per session for replay.
    pub retention: usize,
    /// Heartbeat cadence when no other event is published.
    pub heartbeat_secs: u64,
    /// Broadcast channel capacity per session.
    pub channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retention: 1024,
            heartbeat_secs: 10,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for session records and the event log.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".reqforge"),
        }
    }
}

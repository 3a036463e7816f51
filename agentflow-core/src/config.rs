//! Configuration loading and management
//!
//! The server is configured entirely from the environment, the way the
//! upstream adapters expect:
//!
//! - `PORT` - listen port (default 3333)
//! - `AGENT_FLOW_DB` - SQLite database path (default `agent-flow.db`)
//! - `BETTER_AUTH_SECRET` - required; peppers session-token digests
//! - `ALLOWED_EMAIL_DOMAINS` - comma list restricting server-side sign-up
//! - `AGENT_FLOW_URL` - public origin advertised to adapters (optional)
//! - `ANALYZER_ENDPOINT` / `ANALYZER_MODEL` / `ANALYZER_API_KEY` - the
//!   tool-calling chat client behind insights and cron runs
//! - `INSIGHT_CRON` - analysis cadence (default every 5 hours)
//! - `AGENT_FLOW_LOG_DIR` - when set, logs also roll daily into this dir

use crate::error::{Error, Result};
use std::path::PathBuf;

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port
    pub port: u16,
    /// SQLite database path
    pub database_path: PathBuf,
    /// Secret peppering session-token digests; required to serve
    pub auth_secret: Option<String>,
    /// Email domains allowed to register (empty list = any)
    pub allowed_email_domains: Vec<String>,
    /// Public origin advertised to adapters, when fronted by a proxy
    pub public_url: Option<String>,
    /// Analyzer (tool-calling chat client) configuration
    pub analyzer: AnalyzerConfig,
    /// Insight scheduler configuration
    pub insights: InsightConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Analyzer endpoint configuration
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Messages-API style endpoint
    pub endpoint: String,
    /// Model identifier passed through to the endpoint
    pub model: String,
    /// API key; analyzer-backed features are disabled when absent
    pub api_key: Option<String>,
    /// Per-call timeout in seconds
    pub timeout_secs: u64,
    /// Upper bound on tool-loop iterations per run
    pub max_tool_iterations: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_analyzer_endpoint(),
            model: default_analyzer_model(),
            api_key: None,
            timeout_secs: default_analyzer_timeout(),
            max_tool_iterations: default_max_tool_iterations(),
        }
    }
}

fn default_analyzer_endpoint() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_analyzer_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_analyzer_timeout() -> u64 {
    120
}

fn default_max_tool_iterations() -> usize {
    15
}

/// Insight scheduler configuration
#[derive(Debug, Clone)]
pub struct InsightConfig {
    /// Cron expression for the analysis cadence (seconds field included)
    pub cadence: String,
    /// Minimum new events per user before a run analyzes that user
    pub min_new_events: i64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            cadence: default_insight_cadence(),
            min_new_events: default_min_new_events(),
        }
    }
}

fn default_insight_cadence() -> String {
    // every 5 hours
    "0 0 */5 * * *".to_string()
}

fn default_min_new_events() -> i64 {
    5
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    pub level: String,
    /// Optional directory for daily-rolling log files
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    3333
}

fn default_database_path() -> PathBuf {
    PathBuf::from("agent-flow.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_path: default_database_path(),
            auth_secret: None,
            allowed_email_domains: vec![],
            public_url: None,
            analyzer: AnalyzerConfig::default(),
            insights: InsightConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|_| Error::Config(format!("invalid PORT: {}", port)))?;
        }
        if let Ok(path) = std::env::var("AGENT_FLOW_DB") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(secret) = std::env::var("BETTER_AUTH_SECRET") {
            if !secret.is_empty() {
                config.auth_secret = Some(secret);
            }
        }
        if let Ok(domains) = std::env::var("ALLOWED_EMAIL_DOMAINS") {
            config.allowed_email_domains = domains
                .split(',')
                .map(|d| d.trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
        }
        if let Ok(url) = std::env::var("AGENT_FLOW_URL") {
            if !url.is_empty() {
                config.public_url = Some(url.trim_end_matches('/').to_string());
            }
        }
        if let Ok(endpoint) = std::env::var("ANALYZER_ENDPOINT") {
            if !endpoint.is_empty() {
                config.analyzer.endpoint = endpoint.trim_end_matches('/').to_string();
            }
        }
        if let Ok(model) = std::env::var("ANALYZER_MODEL") {
            if !model.is_empty() {
                config.analyzer.model = model;
            }
        }
        if let Ok(key) = std::env::var("ANALYZER_API_KEY") {
            if !key.is_empty() {
                config.analyzer.api_key = Some(key);
            }
        }
        if let Ok(cadence) = std::env::var("INSIGHT_CRON") {
            if !cadence.is_empty() {
                config.insights.cadence = cadence;
            }
        }
        if let Ok(level) = std::env::var("AGENT_FLOW_LOG_LEVEL") {
            if !level.is_empty() {
                config.logging.level = level;
            }
        }
        if let Ok(dir) = std::env::var("AGENT_FLOW_LOG_DIR") {
            if !dir.is_empty() {
                config.logging.dir = Some(PathBuf::from(dir));
            }
        }

        Ok(config)
    }

    /// Validate configuration for serving, returning an error message if
    /// something required is missing.
    pub fn validate(&self) -> Result<()> {
        if self.auth_secret.is_none() {
            return Err(Error::Config(
                "BETTER_AUTH_SECRET is required to start the server".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(Error::Config("PORT must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Check whether the analyzer-backed features can run.
    pub fn analyzer_ready(&self) -> bool {
        self.analyzer.api_key.is_some()
    }

    /// Check whether an email is admitted by `ALLOWED_EMAIL_DOMAINS`.
    pub fn email_allowed(&self, email: &str) -> bool {
        if self.allowed_email_domains.is_empty() {
            return true;
        }
        let domain = match email.rsplit_once('@') {
            Some((_, d)) => d.to_ascii_lowercase(),
            None => return false,
        };
        self.allowed_email_domains.iter().any(|d| *d == domain)
    }
}

//! Configuration management for Colloquy
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::cli::Cli;
use crate::error::{ColloquyError, Result};
use crate::quota::PlanTier;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure for Colloquy
///
/// Holds everything the server needs: listen address, provider endpoint,
/// dedup/stream/file/knowledge tuning knobs, background job periods, and
/// the agent catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Hosted AI provider settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Request deduplication settings
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Streaming proxy settings
    #[serde(default)]
    pub stream: StreamConfig,

    /// File ingestion settings
    #[serde(default)]
    pub files: FilesConfig,

    /// Knowledge store lifecycle settings
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Background job periods
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Agent catalog: slug -> provider agent reference and plan tier
    #[serde(default)]
    pub agents: HashMap<String, AgentEntry>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the server binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path to the SQLite database file (None = platform data dir)
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database_path: None,
        }
    }
}

/// Hosted provider configuration
///
/// The provider is consumed as an opaque capability: completion threads,
/// file uploads, and searchable stores all live behind one API base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL for provider endpoints (overridable for tests and mocks)
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Environment variable holding the provider API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for best-effort title summarization
    #[serde(default = "default_title_model")]
    pub title_model: String,

    /// Per-request timeout for non-streaming provider calls (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "COLLOQUY_API_KEY".to_string()
}

fn default_title_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key_env: default_api_key_env(),
            title_model: default_title_model(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Request deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// How long a pending signature shadows duplicates (seconds)
    #[serde(default = "default_dedup_ttl")]
    pub ttl_secs: u64,

    /// Fraction of registrations that trigger a stale-entry sweep
    #[serde(default = "default_sweep_probability")]
    pub sweep_probability: f64,
}

fn default_dedup_ttl() -> u64 {
    30
}

fn default_sweep_probability() -> f64 {
    0.01
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl(),
            sweep_probability: default_sweep_probability(),
        }
    }
}

/// Streaming proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Heartbeat comment interval before the first delta (seconds)
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// Hard ceiling on one streamed response (seconds)
    #[serde(default = "default_max_stream")]
    pub max_stream_secs: u64,

    /// Outbound frame buffer depth; a full buffer suspends the relay
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
}

fn default_heartbeat() -> u64 {
    5
}

fn default_max_stream() -> u64 {
    300
}

fn default_frame_buffer() -> usize {
    32
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat(),
            max_stream_secs: default_max_stream(),
            frame_buffer: default_frame_buffer(),
        }
    }
}

/// File ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Maximum attachments accepted per message
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// Maximum size of one uploaded file in bytes
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Images larger than this are compressed before upload (bytes)
    #[serde(default = "default_compress_threshold")]
    pub compress_threshold_bytes: u64,

    /// Directory for spooled uploads (None = system temp dir)
    #[serde(default)]
    pub spool_dir: Option<PathBuf>,
}

fn default_max_files() -> usize {
    5
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_compress_threshold() -> u64 {
    1024 * 1024
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
            compress_threshold_bytes: default_compress_threshold(),
            spool_dir: None,
        }
    }
}

impl FilesConfig {
    /// Resolved spool directory for temporary upload copies
    pub fn spool_dir(&self) -> PathBuf {
        self.spool_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("colloquy-uploads"))
    }
}

/// Knowledge store lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Store expiry window anchored to last activity (days)
    #[serde(default = "default_expiry_days")]
    pub expiry_days: i64,

    /// Stores within this many days of expiry are proactively recreated
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,
}

fn default_expiry_days() -> i64 {
    30
}

fn default_lookahead_days() -> i64 {
    2
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            expiry_days: default_expiry_days(),
            lookahead_days: default_lookahead_days(),
        }
    }
}

/// Background job periods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Expired-store cleanup period (hours)
    #[serde(default = "default_cleanup_hours")]
    pub cleanup_hours: u64,

    /// Proactive store recreation period (hours)
    #[serde(default = "default_recreation_hours")]
    pub recreation_hours: u64,

    /// Quota rollover sweep period (hours)
    #[serde(default = "default_quota_sweep_hours")]
    pub quota_sweep_hours: u64,
}

fn default_cleanup_hours() -> u64 {
    6
}

fn default_recreation_hours() -> u64 {
    12
}

fn default_quota_sweep_hours() -> u64 {
    1
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            cleanup_hours: default_cleanup_hours(),
            recreation_hours: default_recreation_hours(),
            quota_sweep_hours: default_quota_sweep_hours(),
        }
    }
}

/// One configured agent persona
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    /// Opaque provider-side agent reference
    pub agent_ref: String,

    /// Minimum plan tier required to talk to this agent
    #[serde(default = "default_tier")]
    pub tier: PlanTier,
}

fn default_tier() -> PlanTier {
    PlanTier::Starter
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            provider: ProviderConfig::default(),
            dedup: DedupConfig::default(),
            stream: StreamConfig::default(),
            files: FilesConfig::default(),
            knowledge: KnowledgeConfig::default(),
            jobs: JobsConfig::default(),
            agents: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, applying CLI overrides
    ///
    /// A missing file yields the defaults so the server can start from
    /// CLI flags alone.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the YAML configuration file
    /// * `cli` - Parsed CLI arguments whose flags override file values
    pub fn load<P: AsRef<Path>>(path: P, cli: &Cli) -> Result<Self> {
        let path = path.as_ref();

        let mut config: Config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                ColloquyError::Config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            serde_yaml::from_str(&contents).map_err(|e| {
                ColloquyError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?
        } else {
            tracing::debug!("Config file {} not found, using defaults", path.display());
            Config::default()
        };

        if let Some(listen) = &cli.listen {
            config.server.listen = listen.clone();
        }
        if let Some(db) = &cli.database {
            config.server.database_path = Some(db.clone());
        }

        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ColloquyError::Config` when the listen address does not
    /// parse, a knob is out of range, or an agent slug is malformed.
    pub fn validate(&self) -> Result<()> {
        self.server
            .listen
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                ColloquyError::Config(format!("Invalid listen address {}: {}", self.server.listen, e))
            })?;

        if self.dedup.ttl_secs == 0 {
            return Err(ColloquyError::Config("dedup.ttl_secs must be positive".into()).into());
        }
        if !(0.0..=1.0).contains(&self.dedup.sweep_probability) {
            return Err(ColloquyError::Config(
                "dedup.sweep_probability must be between 0.0 and 1.0".into(),
            )
            .into());
        }
        if self.stream.heartbeat_secs == 0 || self.stream.frame_buffer == 0 {
            return Err(ColloquyError::Config(
                "stream.heartbeat_secs and stream.frame_buffer must be positive".into(),
            )
            .into());
        }
        if self.files.max_files == 0 {
            return Err(ColloquyError::Config("files.max_files must be positive".into()).into());
        }
        if self.knowledge.expiry_days <= self.knowledge.lookahead_days {
            return Err(ColloquyError::Config(
                "knowledge.expiry_days must exceed knowledge.lookahead_days".into(),
            )
            .into());
        }

        let slug_re = Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("static regex");
        for (slug, entry) in &self.agents {
            if !slug_re.is_match(slug) {
                return Err(
                    ColloquyError::Config(format!("Invalid agent slug: {}", slug)).into(),
                );
            }
            if entry.agent_ref.is_empty() {
                return Err(ColloquyError::Config(format!(
                    "Agent {} has an empty agent_ref",
                    slug
                ))
                .into());
            }
        }

        Ok(())
    }

    /// Look up a configured agent by slug
    pub fn agent(&self, slug: &str) -> Option<&AgentEntry> {
        self.agents.get(slug)
    }
}

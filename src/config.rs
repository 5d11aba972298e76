//! `.remitlens.toml` loading.
//!
//! Every section has serde defaults, so a partial file (or none at all)
//! yields a usable configuration. Explicit CLI flags are merged on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".remitlens.toml";

/// Settings for one run, as read from `.remitlens.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Paths, verbosity and parallelism.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Upload parsing settings.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Bucket store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Report shape.
    #[serde(default)]
    pub report: ReportConfig,

    /// Credential settings.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// `[general]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// SQLite store path.
    #[serde(default = "default_store")]
    pub store: String,

    /// Default report file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Debug logging unless `--quiet` is given.
    #[serde(default)]
    pub verbose: bool,

    /// Number of uploads parsed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            output: default_output(),
            verbose: false,
            concurrency: default_concurrency(),
        }
    }
}

fn default_store() -> String {
    "remitlens.db".to_string()
}

fn default_output() -> String {
    "remitlens_report.md".to_string()
}

fn default_concurrency() -> usize {
    4
}

/// Upload parsing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Uploads larger than this are rejected unparsed.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// CARC codes treated as contractual reductions rather than denials.
    #[serde(default = "default_contractual_codes")]
    pub contractual_codes: Vec<String>,

    /// Skipped-line diagnostics kept per upload.
    #[serde(default = "default_max_recorded_skips")]
    pub max_recorded_skips: usize,

    /// How deep input directories are walked; unlimited when unset.
    #[serde(default)]
    pub max_scan_depth: Option<usize>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: default_max_upload_bytes(),
            contractual_codes: default_contractual_codes(),
            max_recorded_skips: default_max_recorded_skips(),
            max_scan_depth: None,
        }
    }
}

fn default_max_upload_bytes() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_contractual_codes() -> Vec<String> {
    vec!["45", "97", "59"].into_iter().map(String::from).collect()
}

fn default_max_recorded_skips() -> usize {
    50
}

/// Which bucket store backs a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Bucket store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Storage backend.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Total time a write keeps retrying while the database is locked.
    #[serde(default = "default_max_lock_wait_ms")]
    pub max_lock_wait_ms: u64,

    /// SQLite busy timeout per statement.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            max_lock_wait_ms: default_max_lock_wait_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_max_lock_wait_ms() -> u64 {
    5000
}

fn default_busy_timeout_ms() -> u64 {
    250
}

fn default_max_connections() -> u32 {
    8
}

/// `[report]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Rows per report table.
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    /// Include the monthly trend section.
    #[serde(default = "default_true")]
    pub include_trends: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            top_n: default_top_n(),
            include_trends: true,
        }
    }
}

fn default_top_n() -> usize {
    20
}

fn default_true() -> bool {
    true
}

/// Credential settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Require `--user` before ingesting or reporting.
    #[serde(default)]
    pub enabled: bool,

    /// Login attempts allowed per user per minute.
    #[serde(default = "default_max_attempts")]
    pub max_attempts_per_minute: u32,

    /// Known users with hashed secrets (see `--hash-password`).
    #[serde(default)]
    pub users: Vec<UserEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts_per_minute: default_max_attempts(),
            users: Vec::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

/// One `[[auth.users]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    /// `sha256$<iterations>$<salt>$<digest>`
    pub password_hash: String,
}

impl Config {
    /// Parse a config file; fails on unreadable or invalid TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Look for `.remitlens.toml` in the working directory.
    ///
    /// A missing file is `Ok(None)`; a broken one is an error.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Apply flags given on the command line.
    ///
    /// Only flags that were actually passed replace file values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref store) = args.store {
            self.general.store = store.display().to_string();
            self.store.backend = StoreBackend::Sqlite;
        }
        if args.memory {
            self.store.backend = StoreBackend::Memory;
        }

        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }
        if let Some(concurrency) = args.concurrency {
            self.general.concurrency = concurrency;
        }
        if let Some(max_upload_bytes) = args.max_upload_bytes {
            self.ingest.max_upload_bytes = max_upload_bytes;
        }
        if let Some(top) = args.top {
            self.report.top_n = top;
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Defaults rendered as TOML, written by `--init-config`.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

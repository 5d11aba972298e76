//! Command-line flags.
//!
//! Cross-flag rules that clap attributes cannot express live in
//! [`Args::validate`].

use clap::Parser;
use std::path::PathBuf;

/// RemitLens - de-identified payer statistics from 835/EDI remittances
///
/// Parses 835 remittance files and CSV denial exports, keeps only
/// aggregate counters (payer, state, CPT code, denial reason) and writes
/// a Markdown or JSON statistics report. No patient-level data is stored.
///
/// Examples:
///   remitlens uploads/ERA_2024_03.835
///   remitlens uploads/ --store stats.db --format json --output stats.json
///   remitlens exports/denials.csv --dry-run
///   remitlens --report-only --store stats.db --top 10
///   remitlens --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Upload files or directories to ingest
    ///
    /// Directories are scanned for .835, .dat, .edi and .csv files.
    #[arg(
        value_name = "PATH",
        required_unless_present_any = ["init_config", "init_store", "hash_password", "report_only"]
    )]
    pub inputs: Vec<PathBuf>,

    /// SQLite database holding the aggregate buckets
    ///
    /// Defaults to the [general] store entry of .remitlens.toml.
    #[arg(short, long, value_name = "FILE", env = "REMITLENS_STORE")]
    pub store: Option<PathBuf>,

    /// Keep buckets in memory only (nothing is persisted)
    #[arg(long, conflicts_with = "store")]
    pub memory: bool,

    /// Parse and summarize uploads without applying them to the store
    #[arg(long)]
    pub dry_run: bool,

    /// Output file path for the report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Number of rows per report table
    #[arg(long, value_name = "COUNT")]
    pub top: Option<usize>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .remitlens.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Number of uploads parsed concurrently
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Reject uploads larger than this many bytes
    #[arg(long, value_name = "BYTES")]
    pub max_upload_bytes: Option<u64>,

    /// User to authenticate as when [auth] is enabled
    #[arg(short, long, value_name = "NAME")]
    pub user: Option<String>,

    /// Password for --user or --hash-password
    #[arg(long, env = "REMITLENS_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Generate a default .remitlens.toml configuration file
    #[arg(long)]
    pub init_config: bool,

    /// Create the store schema and exit
    #[arg(long)]
    pub init_store: bool,

    /// Print a salted hash of the password for the [auth] users table
    #[arg(long)]
    pub hash_password: bool,

    /// Write a report from the existing store without ingesting anything
    #[arg(long, conflicts_with = "dry_run")]
    pub report_only: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for standalone utilities
        if self.init_config {
            return Ok(());
        }

        if self.hash_password {
            return match self.password.as_deref() {
                Some(p) if !p.is_empty() => Ok(()),
                _ => Err("--hash-password needs a password (--password or REMITLENS_PASSWORD)"
                    .to_string()),
            };
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        if self.top == Some(0) {
            return Err("--top must be at least 1".to_string());
        }

        if self.max_upload_bytes == Some(0) {
            return Err("--max-upload-bytes must be at least 1".to_string());
        }

        if self.memory && (self.report_only || self.init_store) {
            return Err("--report-only and --init-store need a persistent store".to_string());
        }

        if self.user.is_some() && self.password.is_none() {
            return Err("--user requires a password (--password or REMITLENS_PASSWORD)".to_string());
        }

        for input in &self.inputs {
            if !input.exists() {
                return Err(format!("Input does not exist: {}", input.display()));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    ///
    /// `config_verbose` is `verbose` from the config file; `--quiet` wins.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_args() -> Args {
        Args {
            inputs: vec![PathBuf::from("fixtures/sample.835")],
            store: None,
            memory: false,
            dry_run: false,
            output: None,
            format: OutputFormat::Markdown,
            top: None,
            config: None,
            verbose: false,
            quiet: false,
            concurrency: None,
            max_upload_bytes: None,
            user: None,
            password: None,
            init_config: false,
            init_store: false,
            hash_password: false,
            report_only: false,
        }
    }

    #[test]
    fn test_valid_args() {
        assert!(make_args().validate().is_ok());
    }

    #[test]
    fn test_parse_from_command_line() {
        let args = Args::try_parse_from([
            "remitlens",
            "fixtures/sample.835",
            "fixtures/denials.csv",
            "--format",
            "json",
            "--top",
            "5",
            "--memory",
        ])
        .unwrap();
        assert_eq!(args.inputs.len(), 2);
        assert_eq!(args.format, OutputFormat::Json);
        assert_eq!(args.top, Some(5));
        assert!(args.memory);
    }

    #[test]
    fn test_inputs_required_unless_utility() {
        assert!(Args::try_parse_from(["remitlens"]).is_err());
        assert!(Args::try_parse_from(["remitlens", "--init-config"]).is_ok());
        assert!(Args::try_parse_from(["remitlens", "--report-only"]).is_ok());
    }

    #[test]
    fn test_validation_missing_input() {
        let mut args = make_args();
        args.inputs = vec![PathBuf::from("does/not/exist.835")];
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args();
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.memory = true;
        args.report_only = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_zero_values() {
        let mut args = make_args();
        args.concurrency = Some(0);
        assert!(args.validate().is_err());

        let mut args = make_args();
        args.top = Some(0);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_credentials() {
        let mut args = make_args();
        args.user = Some("analyst".to_string());
        assert!(args.validate().is_err());
        args.password = Some("s3cret".to_string());
        assert!(args.validate().is_ok());

        let mut args = make_args();
        args.hash_password = true;
        assert!(args.validate().is_err());
        args.password = Some("s3cret".to_string());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args();
        assert_eq!(args.log_level(false), tracing::Level::INFO);
        assert_eq!(args.log_level(true), tracing::Level::DEBUG);

        args.verbose = true;
        assert_eq!(args.log_level(false), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(false), tracing::Level::ERROR);
        assert_eq!(args.log_level(true), tracing::Level::ERROR);
    }
}

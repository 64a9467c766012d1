use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::engine::EngineConfig;

/// Verbosity levels for output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum VerbosityLevel {
    /// Only show critical errors
    Quiet,
    /// Show standard information
    #[default]
    Normal,
    /// Show detailed information
    Verbose,
}

/// Main application configuration derived from CLI (and optionally a TOML
/// file; explicit CLI flags win).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub path: PathBuf,
    pub extensions: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub verbose: bool,
    pub quiet: bool,
    pub json: bool,
    pub status_url: Option<String>,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_cli(cli: &Cli, mut engine: EngineConfig) -> Self {
        if let Some(concurrency) = cli.concurrency {
            engine.max_concurrent_ingestions = concurrency;
        }
        if let Some(skew) = cli.clock_skew {
            engine.clock_skew_secs = skew;
        }
        if let Some(timeout) = cli.status_timeout {
            engine.status_timeout_secs = timeout;
        }
        if let Some(days) = cli.retention_days {
            engine.deferred_retention_days = days;
        }
        if cli.archive_dir.is_some() {
            engine.archive_dir = cli.archive_dir.clone();
        } else if cli.archive && engine.archive_dir.is_none() {
            engine.archive_dir = Some(default_archive_dir());
        }

        Self {
            path: cli.path.clone(),
            extensions: cli.get_extensions(),
            include_patterns: cli.include_patterns.clone(),
            exclude_patterns: cli.exclude_patterns.clone(),
            verbose: cli.verbose,
            quiet: cli.quiet,
            json: cli.json,
            status_url: cli.status_url.clone(),
            engine,
        }
    }

    pub fn verbosity(&self) -> VerbosityLevel {
        if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }
}

fn default_archive_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cfdi-engine")
        .join("archive")
}

/// CFDI validation, seal verification and indexing engine
#[derive(Parser, Debug, Clone)]
#[command(name = "cfdi-engine")]
#[command(about = "Validate, verify and index CFDI documents, then report aggregate statistics")]
#[command(version)]
pub struct Cli {
    /// Path to scan for CFDI XML files (directory or file)
    #[arg(help = "Directory or file to ingest")]
    pub path: PathBuf,

    /// File extensions to process (comma-separated)
    #[arg(
        short = 'e',
        long = "extensions",
        default_value = "xml",
        help = "File extensions to process (e.g., 'xml,cfdi')"
    )]
    pub extensions: String,

    /// Number of concurrent ingestions
    #[arg(short = 'c', long = "concurrency")]
    pub concurrency: Option<usize>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", help = "Enable verbose output")]
    pub verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(
        short = 'q',
        long = "quiet",
        help = "Quiet mode",
        conflicts_with = "verbose"
    )]
    pub quiet: bool,

    /// Emit machine-readable JSON instead of human-readable text
    #[arg(long = "json")]
    pub json: bool,

    /// Engine configuration file (TOML)
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Persist ingested documents to the default archive directory
    #[arg(long = "archive")]
    pub archive: bool,

    /// Persist ingested documents to this archive directory
    #[arg(long = "archive-dir")]
    pub archive_dir: Option<PathBuf>,

    /// Certificate-status service URL; omit to skip chain checks
    #[arg(long = "status-url")]
    pub status_url: Option<String>,

    /// Certificate-status lookup timeout in seconds
    #[arg(long = "status-timeout")]
    pub status_timeout: Option<u64>,

    /// Forward clock-skew tolerance for issue dates, in seconds
    #[arg(long = "clock-skew")]
    pub clock_skew: Option<u64>,

    /// Retention window for deferred cancellation events, in days
    #[arg(long = "retention-days")]
    pub retention_days: Option<i64>,

    /// Include file patterns (glob syntax)
    #[arg(long = "include", action = clap::ArgAction::Append)]
    pub include_patterns: Vec<String>,

    /// Exclude file patterns (glob syntax)
    #[arg(long = "exclude", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn get_extensions(&self) -> Vec<String> {
        self.extensions
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.path.exists() {
            return Err(format!("Path does not exist: {}", self.path.display()));
        }
        if let Some(concurrency) = self.concurrency
            && concurrency == 0
        {
            return Err("Concurrency must be greater than 0".to_string());
        }
        Ok(())
    }
}

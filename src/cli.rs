//! Command-line interface for unitd.
use clap::{Parser, Subcommand};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for unitd.
#[derive(Parser)]
#[command(name = "unitd", version, author)]
#[command(about = "A modular service manager for UNIX hosts", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Opt into privileged system mode. Requires running as root.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for unitd.
#[derive(Subcommand)]
pub enum Commands {
    /// Start the supervisor with the given catalog.
    Start {
        /// Path to the catalog file (defaults to `unitd.yaml`).
        #[arg(short, long, default_value = "unitd.yaml")]
        catalog: String,

        /// Whether to daemonize the supervisor.
        #[arg(long)]
        daemonize: bool,
    },

    /// Enable a service or instance so the graph brings it up.
    Enable {
        /// Target path, `svc` or `svc:inst`.
        path: String,
    },

    /// Disable a service or instance, stopping it and its dependents.
    Disable {
        /// Target path, `svc` or `svc:inst`.
        path: String,
    },

    /// Stop and re-start a service or instance.
    Restart {
        /// Target path, `svc` or `svc:inst`.
        path: String,
    },

    /// Show the supervisor's status snapshot.
    Status {
        /// Emit the snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Shut the resident supervisor down.
    Shutdown,
}

/// Parses command-line arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}

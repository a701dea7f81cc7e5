//! Command line and environment configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3000;

/// CampusDock course backend with live support chat
#[derive(Debug, Parser)]
#[command(name = "campusdock", version, about, long_about = None)]
pub struct Cli {
    /// Data directory (database, logs, auth token)
    #[arg(long, env = "CAMPUSDOCK_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Defaults to `start` when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP + WebSocket server
    Start(ServeArgs),

    /// Query a running server's diagnostics endpoints
    Status(StatusArgs),

    /// Create a random admin token for the diagnostics endpoints
    GenerateToken,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Full bind address; overrides --port
    #[arg(long, env = "CAMPUSDOCK_BIND")]
    pub bind: Option<SocketAddr>,

    /// Port to listen on all interfaces
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Seconds between idle-session sweeps
    #[arg(long, env = "CAMPUSDOCK_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Seconds of silence before a session is evicted
    #[arg(long, env = "CAMPUSDOCK_SESSION_IDLE_SECS", default_value_t = 180)]
    pub session_idle_secs: u64,

    /// Seconds after the last store use before the database connection closes
    #[arg(long, env = "CAMPUSDOCK_STORE_IDLE_SECS", default_value_t = 60)]
    pub store_idle_secs: u64,

    /// Bearer token required by the diagnostics endpoints
    #[arg(long, env = "CAMPUSDOCK_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Format of lines written to logs/server.log
    #[arg(
        long,
        env = "CAMPUSDOCK_LOG_FORMAT",
        value_enum,
        ignore_case = true,
        default_value_t = LogFormat::Json
    )]
    pub log_format: LogFormat,

    /// Tracing filter directives (falls back to RUST_LOG)
    #[arg(long, env = "CAMPUSDOCK_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Empty the log file before the server starts writing
    #[arg(long, env = "CAMPUSDOCK_TRUNCATE_LOG_ON_START")]
    pub truncate_log: bool,

    /// Identifier stamped on startup log lines
    #[arg(long, env = "CAMPUSDOCK_RUN_ID")]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl ServeArgs {
    /// Flag defaults with environment overrides applied, used when no
    /// subcommand is given.
    pub fn from_env() -> Result<Self, clap::Error> {
        #[derive(Parser)]
        struct Bare {
            #[command(flatten)]
            serve: ServeArgs,
        }
        Bare::try_parse_from(["campusdock"]).map(|bare| bare.serve)
    }
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// Base URL of the running server
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    pub url: String,

    /// Admin token, if the server requires one
    #[arg(long, env = "CAMPUSDOCK_ADMIN_TOKEN")]
    pub token: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("admin token must not be blank")]
    BlankToken,
}

/// Where and how the server log is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub dir: PathBuf,
    pub format: LogFormat,
    pub filter: Option<String>,
    pub truncate_on_start: bool,
    pub run_id: Option<String>,
}

/// Validated server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub sweep_interval: Duration,
    pub session_idle: Duration,
    pub store_idle: Duration,
    pub admin_token: Option<String>,
    pub log: LogOptions,
}

impl ServerConfig {
    pub fn from_args(args: &ServeArgs, data_dir: PathBuf) -> Result<Self, ConfigError> {
        let secs = |value: u64, name: &'static str| {
            if value == 0 {
                Err(ConfigError::ZeroDuration(name))
            } else {
                Ok(Duration::from_secs(value))
            }
        };

        let admin_token = match args.admin_token.as_deref().map(str::trim) {
            Some("") => return Err(ConfigError::BlankToken),
            Some(token) => Some(token.to_string()),
            None => None,
        };

        let blank_to_none = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let log = LogOptions {
            dir: data_dir.join("logs"),
            format: args.log_format,
            filter: blank_to_none(&args.log_filter),
            truncate_on_start: args.truncate_log,
            run_id: blank_to_none(&args.run_id),
        };

        Ok(Self {
            bind: args
                .bind
                .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port))),
            db_path: data_dir.join("campusdock.db"),
            data_dir,
            sweep_interval: secs(args.sweep_interval_secs, "sweep interval")?,
            session_idle: secs(args.session_idle_secs, "session idle window")?,
            store_idle: secs(args.store_idle_secs, "store idle window")?,
            admin_token,
            log,
        })
    }
}

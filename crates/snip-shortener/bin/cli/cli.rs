use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub const BASE_URL_ENV: &str = "BASE_URL";
pub const FILE_STORAGE_PATH_ENV: &str = "FILE_STORAGE_PATH";
pub const DATABASE_DSN_ENV: &str = "DATABASE_DSN";
pub const DELETE_WORKERS_ENV: &str = "SNIP_DELETE_WORKERS";
pub const LOG_FORMAT_ENV: &str = "SNIP_LOG_FORMAT";
pub const USER_ID_ENV: &str = "SNIP_USER_ID";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_DELETE_WORKERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[value(name = "text")]
    Text,
    #[value(name = "json")]
    Json,
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "snip", about = "Shorten, resolve and manage short URLs")]
pub struct CLI {
    /// Prefix of every short URL.
    #[arg(short = 'b', long, env = BASE_URL_ENV, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Journal file; records are kept in memory only when neither this
    /// nor a database DSN is given.
    #[arg(short = 'f', long, env = FILE_STORAGE_PATH_ENV)]
    pub file_storage_path: Option<PathBuf>,

    /// PostgreSQL DSN. Takes precedence over the journal file.
    #[arg(short = 'd', long, env = DATABASE_DSN_ENV)]
    pub database_dsn: Option<String>,

    #[arg(long, env = DELETE_WORKERS_ENV, default_value_t = DEFAULT_DELETE_WORKERS)]
    pub delete_workers: usize,

    #[arg(long, env = LOG_FORMAT_ENV, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Owner of created records, required by `list` and `delete`.
    #[arg(short = 'u', long, env = USER_ID_ENV, global = true, default_value = "")]
    pub user_id: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Shorten a single URL.
    Shorten { url: String },
    /// Shorten a JSON array of `{correlation_id, original_url}` read from stdin.
    Batch,
    /// Look up the URL behind a short key.
    Resolve { key: String },
    /// List the live URLs of the user.
    List,
    /// Schedule deletion of short keys owned by the user.
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Check that the storage engine is reachable.
    Ping,
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::SessionOptions;

/// Bookstore client - session and account management
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Bookstore API base URL
    #[arg(short = 'u', long, env = "BOOKSTORE_API_URL", default_value = "http://localhost:8080/api")]
    pub api_url: String,

    /// Path to the session database
    #[arg(short = 'd', long, env = "BOOKSTORE_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and store the session
    Login {
        /// Account email; prompted when omitted
        #[arg(short, long)]
        email: Option<String>,
    },
    /// Create an account (does not log in)
    Register,
    /// End the stored session
    Logout,
    /// Show the stored session user
    Whoami,
    /// Show the profile, or edit it when any field is given
    Profile {
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        phone_number: Option<String>,
    },
    /// Change the account password
    ChangePassword,
    /// Refresh the access token now
    Refresh,
    /// GET an API path with the stored session and print the body
    Get {
        /// Path relative to the API URL, e.g. /users/library
        path: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_url: String,

    // Session storage
    pub db_file: PathBuf,

    // Token lifecycle
    pub token_refresh_lead: u64,
    pub token_refresh_timeout: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    pub log_level: String,
}

impl Config {
    /// Build configuration with priority: CLI > ENV > defaults.
    /// The caller loads `.env` before parsing arguments.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let db_file = match args.db_file.as_deref() {
            Some(path) => expand_tilde(path),
            None => default_db_file().context(
                "Could not determine a data directory (use -d or set BOOKSTORE_DB_FILE)",
            )?,
        };

        Ok(Config {
            api_url: args.api_url.trim_end_matches('/').to_string(),
            db_file,

            token_refresh_lead: env_or("TOKEN_REFRESH_LEAD", 60),
            token_refresh_timeout: env_or("TOKEN_REFRESH_TIMEOUT", 30),

            http_max_connections: env_or("HTTP_MAX_CONNECTIONS", 20),
            http_connect_timeout: env_or("HTTP_CONNECT_TIMEOUT", 10),
            http_request_timeout: args.http_timeout,

            log_level: args.log_level.clone(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_url)
            .with_context(|| format!("BOOKSTORE_API_URL is not a valid URL: {}", self.api_url))?;

        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!(
                "BOOKSTORE_API_URL must use http or https, got: {}",
                url.scheme()
            );
        }

        if self.token_refresh_timeout == 0 {
            anyhow::bail!("TOKEN_REFRESH_TIMEOUT must be greater than zero");
        }

        Ok(())
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            api_url: self.api_url.clone(),
            refresh_lead: Duration::from_secs(self.token_refresh_lead),
            refresh_timeout: Duration::from_secs(self.token_refresh_timeout),
            request_timeout: Duration::from_secs(self.http_request_timeout),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// `<data_dir>/bookstore-client/session.sqlite3`
fn default_db_file() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("bookstore-client").join("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

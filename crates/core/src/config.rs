use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Immutable process configuration, built once at startup from environment
/// variables and passed explicitly into each component.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub github: GitHubConfig,
    pub actions: ActionConfig,
    pub mail: MailConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub app_id: u64,
    pub private_key_path: PathBuf,
    pub webhook_secret: String,
    /// REST API base, overridable for tests.
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub deploy_script: PathBuf,
    pub cleanup_script: PathBuf,
    /// Directory that receives one log file per action invocation.
    pub log_dir: PathBuf,
    /// Upper bound on a single script invocation.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub recipient: String,
}

const DEFAULT_API_BASE: &str = "https://api.github.com";
const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 900;

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            server: ServerConfig {
                port: parsed_or("PORT", 5000)?,
            },
            github: GitHubConfig {
                app_id: required("APP_ID")?.parse().context("APP_ID is not a number")?,
                private_key_path: required("PRIVATE_KEY_PATH")?.into(),
                webhook_secret: required("WEBHOOK_SECRET")?,
                api_base: optional("GITHUB_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.into()),
            },
            actions: ActionConfig {
                deploy_script: optional("DEPLOY_SCRIPT").unwrap_or_else(|| "./deploy.sh".into()).into(),
                cleanup_script: optional("CLEANUP_SCRIPT")
                    .unwrap_or_else(|| "./cleanup.sh".into())
                    .into(),
                log_dir: optional("LOG_DIR").unwrap_or_else(|| "/tmp".into()).into(),
                timeout: Duration::from_secs(parsed_or(
                    "ACTION_TIMEOUT_SECS",
                    DEFAULT_ACTION_TIMEOUT_SECS,
                )?),
            },
            mail: MailConfig {
                smtp_server: required("SMTP_SERVER")?,
                smtp_port: required("SMTP_PORT")?.parse().context("SMTP_PORT is not a number")?,
                smtp_username: required("SMTP_USERNAME")?,
                smtp_password: required("SMTP_PASSWORD")?,
                recipient: required("RECIPIENT_EMAIL")?,
            },
        })
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{name} is not set"))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where T::Err: std::error::Error + Send + Sync + 'static {
    match optional(name) {
        Some(value) => value.parse().with_context(|| format!("{name} is invalid")),
        None => Ok(default),
    }
}

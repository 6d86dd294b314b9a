//! Process configuration, read once at start-up.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoStrategyKind {
    Heuristic,
    RequireOrigin,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub webhook_secret: String,
    pub gateway_base_url: String,
    pub gateway_api_key: Option<String>,
    pub instances: HashSet<String>,
    pub disabled_instances: HashSet<String>,
    pub default_buffer_seconds: u32,
    pub dedup_capacity: usize,
    pub file_pause_hours: i64,
    pub echo_window: Duration,
    pub echo_history: usize,
    pub echo_strategy: EchoStrategyKind,
    pub rate_limit_per_minute: usize,
    pub pacing_min_ms: u64,
    pub pacing_max_ms: u64,
    pub history_limit: usize,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_chat_model: String,
    pub openai_transcribe_model: String,
    pub dashboard_token: Option<String>,
    pub admin_clear_password_hash: Option<String>,
    pub log_format: LogFormat,
    pub outbound_timeout: Duration,
}

pub const MEMORY_DATABASE_URL: &str = "memory://";

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let pacing_min_ms = parse_or(&get, "FIXED_PACING_MIN_MS", 2000u64)?;
        let pacing_max_ms = parse_or(&get, "FIXED_PACING_MAX_MS", 4000u64)?;
        if pacing_max_ms < pacing_min_ms {
            return Err(ConfigError::Invalid {
                name: "FIXED_PACING_MAX_MS",
                reason: format!("must be >= FIXED_PACING_MIN_MS ({pacing_min_ms})"),
            });
        }

        let echo_strategy = match get("ECHO_STRATEGY").as_deref() {
            None | Some("heuristic") => EchoStrategyKind::Heuristic,
            Some("require-origin") => EchoStrategyKind::RequireOrigin,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "ECHO_STRATEGY",
                    reason: format!("expected heuristic or require-origin, got '{other}'"),
                })
            }
        };
        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    reason: format!("expected pretty or json, got '{other}'"),
                })
            }
        };

        let mut instances = name_set(get("GATEWAY_INSTANCES"));
        if instances.is_empty() {
            instances.insert("default".to_string());
        }

        Ok(Self {
            port: parse_or(&get, "PORT", 4000u16)?,
            database_url: resolve_database_url(&get)?,
            webhook_secret: required("WEBHOOK_SECRET")?,
            gateway_base_url: required("GATEWAY_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            gateway_api_key: get("GATEWAY_API_KEY"),
            instances,
            disabled_instances: name_set(get("DISABLED_INSTANCES")),
            default_buffer_seconds: parse_or(&get, "DEFAULT_BUFFER_SECONDS", 5u32)?,
            dedup_capacity: parse_or(&get, "DEDUP_CAPACITY", 1000usize)?,
            file_pause_hours: parse_or(&get, "FILE_PAUSE_HOURS", 24i64)?,
            echo_window: Duration::from_secs(parse_or(&get, "ECHO_WINDOW_SECONDS", 30u64)?),
            echo_history: parse_or(&get, "ECHO_HISTORY", 10usize)?,
            echo_strategy,
            rate_limit_per_minute: parse_or(&get, "RATE_LIMIT_PER_MINUTE", 30usize)?,
            pacing_min_ms,
            pacing_max_ms,
            history_limit: parse_or(&get, "HISTORY_LIMIT", 20usize)?,
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            openai_chat_model: get("OPENAI_CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            openai_transcribe_model: get("OPENAI_TRANSCRIBE_MODEL")
                .unwrap_or_else(|| "whisper-1".to_string()),
            dashboard_token: get("DASHBOARD_TOKEN"),
            admin_clear_password_hash: get("ADMIN_CLEAR_PASSWORD_HASH"),
            log_format,
            outbound_timeout: Duration::from_secs(parse_or(&get, "OUTBOUND_TIMEOUT_SECS", 30u64)?),
        })
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }

    pub fn is_known_instance(&self, instance: &str) -> bool {
        self.instances.contains(instance) || self.disabled_instances.contains(instance)
    }

    pub fn is_disabled_instance(&self, instance: &str) -> bool {
        self.disabled_instances.contains(instance)
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|err| ConfigError::Invalid {
            name,
            reason: format!("'{raw}': {err}"),
        }),
    }
}

fn name_set(raw: Option<String>) -> HashSet<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_database_url<G>(get: &G) -> Result<String, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(url) = get("DATABASE_URL") {
        return Ok(url);
    }
    let host = get("POSTGRES_HOST")
        .or_else(|| get("PGHOST"))
        .ok_or(ConfigError::Missing("DATABASE_URL"))?;
    let port = get("POSTGRES_PORT")
        .or_else(|| get("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = get("POSTGRES_USER")
        .or_else(|| get("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let db = get("POSTGRES_DB")
        .or_else(|| get("PGDATABASE"))
        .unwrap_or_else(|| "lead_chat".to_string());
    let credentials = match get("POSTGRES_PASSWORD").or_else(|| get("PGPASSWORD")) {
        Some(password) => format!("{user}:{password}"),
        None => user,
    };
    Ok(format!("postgres://{credentials}@{host}:{port}/{db}"))
}

#![forbid(unsafe_code)]

//! Environment-sourced configuration.
//!
//! Values are read from the process environment first, falling back to a
//! `.env` file (default `./.env`) for anything not already set - the same
//! precedence and file format the rest of this workspace's tools use.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

pub const DEFAULT_ENV_PATH: &str = ".env";

/// Relational catalog connection.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: String,
    /// Schema prefix applied to every table reference (`content` against a
    /// real Postgres-speaking catalog; empty against the SQLite-compatible
    /// backing used for local runs and tests, since that backing has no
    /// schema namespace). See `DESIGN.md`.
    pub schema: String,
}

/// Search index connection.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub hosts: Vec<String>,
}

/// State-store cache file paths, one per checkpointed domain.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub main: String,
    pub producer: String,
    pub enricher: String,
    pub merger: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            main: "./cache/main.json".to_string(),
            producer: "./cache/producer.json".to_string(),
            enricher: "./cache/enricher.json".to_string(),
            merger: "./cache/merger.json".to_string(),
        }
    }
}

/// Log file path.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub etl: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            etl: "./log/etl.log".to_string(),
        }
    }
}

/// Page size and outer sleep period.
#[derive(Debug, Clone, Copy)]
pub struct MainConfig {
    pub limit_size: u32,
    pub sleep_period_secs: u64,
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            limit_size: 100,
            sleep_period_secs: 60,
        }
    }
}

/// All configuration the CLI entrypoint needs, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db: DbConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
    pub main: MainConfig,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_ENV_PATH))
    }

    pub fn load_from(env_path: &Path) -> Result<Self> {
        let file_vars = read_env_file(env_path)?;
        let lookup = |key: &str| lookup_value(key, &file_vars, &env_var_string);

        let db = DbConfig {
            name: required(&lookup, "DB_NAME")?,
            user: required(&lookup, "DB_USER")?,
            password: required(&lookup, "DB_PASSWORD")?,
            host: required(&lookup, "DB_HOST")?,
            port: required(&lookup, "DB_PORT")?,
            schema: lookup("DB_SCHEMA").unwrap_or_default(),
        };

        let hosts = required(&lookup, "ELASTIC_HOSTS")?;
        let index = IndexConfig {
            hosts: hosts
                .split(',')
                .map(|host| host.trim().to_string())
                .filter(|host| !host.is_empty())
                .collect(),
        };

        let cache = CacheConfig {
            main: lookup("CACHE_MAIN").unwrap_or_else(|| CacheConfig::default().main),
            producer: lookup("CACHE_PRODUCER").unwrap_or_else(|| CacheConfig::default().producer),
            enricher: lookup("CACHE_ENRICHER").unwrap_or_else(|| CacheConfig::default().enricher),
            merger: lookup("CACHE_MERGER").unwrap_or_else(|| CacheConfig::default().merger),
        };

        let log = LogConfig {
            etl: lookup("LOG_ETL").unwrap_or_else(|| LogConfig::default().etl),
        };

        let main = MainConfig {
            limit_size: lookup("MAIN_LIMIT_SIZE")
                .and_then(|value| value.parse().ok())
                .unwrap_or_else(|| MainConfig::default().limit_size),
            sleep_period_secs: lookup("MAIN_SLEEP_PERIOD")
                .and_then(|value| value.parse().ok())
                .unwrap_or_else(|| MainConfig::default().sleep_period_secs),
        };

        Ok(Self {
            db,
            index,
            cache,
            log,
            main,
        })
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    lookup(key).ok_or_else(|| anyhow!("{key} not set"))
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses a simple `KEY=value` file, tolerating `export ` prefixes, quoted
/// values, comments and blank lines. A missing file is not an error: it just
/// means every setting must come from the real environment.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|value| value.strip_suffix('\'')))
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

//! Configuration loaded from the environment (after `.env`).

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::lifecycle::DuplicatePolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_path: PathBuf,
    pub broadcast_queue_capacity: usize,
    pub store_retry_attempts: usize,
    pub duplicate_policy: DuplicatePolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_path = match lookup("DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let home_dir = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(".support-relay").join("chat.db")
            }
        };

        Ok(Self {
            bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            database_path,
            broadcast_queue_capacity: parse_or(&lookup, "BROADCAST_QUEUE_CAPACITY", 256)?,
            store_retry_attempts: parse_or(&lookup, "STORE_RETRY_ATTEMPTS", 3)?,
            duplicate_policy: parse_or(
                &lookup,
                "DUPLICATE_SESSION_POLICY",
                DuplicatePolicy::ReturnExisting,
            )?,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(default),
    }
}

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{
    constants,
    model::{DownloadError, Result},
};

/// Runtime settings read from the environment (or a `.env` file).
#[derive(Debug, Clone)]
pub struct Settings {
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub output_dir: Option<PathBuf>, // Used when no output directory is given on the command line.
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Settings {
            base_url: lookup("binance_base_url")
                .unwrap_or_else(|| constants::DEFAULT_BASE_URL.to_string()),
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "request_timeout_secs",
                constants::DEFAULT_TIMEOUT_SECS,
            )?),
            max_retries: parse_or(&lookup, "max_retries", constants::DEFAULT_MAX_RETRIES)?,
            retry_backoff: Duration::from_millis(parse_or(
                &lookup,
                "retry_backoff_ms",
                constants::DEFAULT_RETRY_BACKOFF_MS,
            )?),
            output_dir: lookup("output_dir").map(PathBuf::from),
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| DownloadError::InvalidSetting { key, value }),
        None => Ok(default),
    }
}

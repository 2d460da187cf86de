//! Service configuration, read from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `REDIS_URL` | `redis://127.0.0.1/` |
//! | `GEOPDF_KEY_PREFIX` | `geopdf` |
//! | `HTTP_ADDR` | `0.0.0.0:8080` |
//! | `WORKER_CONCURRENCY` | `4` |
//! | `MAX_ATTEMPTS` | `3` |
//! | `RETRY_MIN_DELAY_MS` / `RETRY_MAX_DELAY_MS` | `1000` / `10000` |
//! | `RETRY_FACTOR` | `2.0` |
//! | `RETRY_RANDOMIZE` | `true` |
//! | `ATTEMPT_TIMEOUT_SECS` | `120` |
//! | `CANCEL_GRACE_MS` | `5000` |
//! | `SCRATCH_ROOT` | `$TMPDIR/geopdf-scratch` |
//! | `ARTIFACT_ROOT` | `./artifacts` |
//! | `CLEANUP_ATTEMPTS` / `CLEANUP_DELAY_MS` | `3` / `100` |
//! | `OGR2OGR_PATH` | `ogr2ogr` |
//! | `PDF_CREATION_OPTIONS` | `LAYER_CREATION=YES,GEOREF=YES` |
//! | `TERMINAL_TTL_SECS` | `86400`, `0` keeps records forever |
//! | `LOG_FORMAT` | `text` (or `json`) |

use anyhow::{bail, Context, Result};
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::executor::ExecutorSettings;
use crate::workspace::CleanupPolicy;

/// Exponential backoff with optional jitter between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Multiplies each delay by a random factor in `[1, 2)`.
    pub randomize: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            factor: 2.0,
            randomize: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let base = self.min_delay.as_secs_f64() * self.factor.powi(exponent);
        let jitter = if self.randomize {
            rand::thread_rng().gen_range(1.0..2.0)
        } else {
            1.0
        };
        let capped = (base * jitter).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be at least 1");
        }
        if !self.factor.is_finite() || self.factor < 1.0 {
            bail!("RETRY_FACTOR must be a finite number >= 1, got {}", self.factor);
        }
        if self.min_delay > self.max_delay {
            bail!(
                "RETRY_MIN_DELAY_MS ({:?}) exceeds RETRY_MAX_DELAY_MS ({:?})",
                self.min_delay,
                self.max_delay
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format {other:?}, expected text or json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub key_prefix: String,
    pub http_addr: SocketAddr,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub cancel_grace: Duration,
    pub scratch_root: PathBuf,
    pub artifact_root: PathBuf,
    pub cleanup: CleanupPolicy,
    pub ogr2ogr_path: PathBuf,
    pub creation_options: Vec<String>,
    /// How long finished records are kept; `None` keeps them forever.
    pub terminal_ttl: Option<Duration>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1/".to_string(),
            key_prefix: "geopdf".to_string(),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            concurrency: 4,
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(120),
            cancel_grace: Duration::from_millis(5000),
            scratch_root: std::env::temp_dir().join("geopdf-scratch"),
            artifact_root: PathBuf::from("artifacts"),
            cleanup: CleanupPolicy::default(),
            ogr2ogr_path: PathBuf::from("ogr2ogr"),
            creation_options: vec!["LAYER_CREATION=YES".to_string(), "GEOREF=YES".to_string()],
            terminal_ttl: Some(Duration::from_secs(86_400)),
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Config::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let millis = |key: &str, default: Duration| -> Result<Duration> {
            parse_or(var(key), key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let retry = RetryPolicy {
            max_attempts: parse_or(var("MAX_ATTEMPTS"), "MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            min_delay: millis("RETRY_MIN_DELAY_MS", defaults.retry.min_delay)?,
            max_delay: millis("RETRY_MAX_DELAY_MS", defaults.retry.max_delay)?,
            factor: parse_or(var("RETRY_FACTOR"), "RETRY_FACTOR", defaults.retry.factor)?,
            randomize: parse_or(var("RETRY_RANDOMIZE"), "RETRY_RANDOMIZE", defaults.retry.randomize)?,
        };
        retry.validate()?;

        let cleanup = CleanupPolicy {
            attempts: parse_or(var("CLEANUP_ATTEMPTS"), "CLEANUP_ATTEMPTS", defaults.cleanup.attempts)?,
            delay: millis("CLEANUP_DELAY_MS", defaults.cleanup.delay)?,
        };

        let concurrency: usize = parse_or(
            var("WORKER_CONCURRENCY"),
            "WORKER_CONCURRENCY",
            defaults.concurrency,
        )?;
        if concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }

        let attempt_timeout = Duration::from_secs(parse_or(
            var("ATTEMPT_TIMEOUT_SECS"),
            "ATTEMPT_TIMEOUT_SECS",
            defaults.attempt_timeout.as_secs(),
        )?);
        if attempt_timeout.is_zero() {
            bail!("ATTEMPT_TIMEOUT_SECS must be at least 1");
        }

        let ttl_secs: u64 = parse_or(
            var("TERMINAL_TTL_SECS"),
            "TERMINAL_TTL_SECS",
            defaults.terminal_ttl.map_or(0, |ttl| ttl.as_secs()),
        )?;

        let creation_options = match var("PDF_CREATION_OPTIONS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|opt| !opt.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.creation_options,
        };

        Ok(Self {
            redis_url: var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: var("GEOPDF_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            http_addr: parse_or(var("HTTP_ADDR"), "HTTP_ADDR", defaults.http_addr)?,
            concurrency,
            retry,
            attempt_timeout,
            cancel_grace: millis("CANCEL_GRACE_MS", defaults.cancel_grace)?,
            scratch_root: var("SCRATCH_ROOT").map_or(defaults.scratch_root, PathBuf::from),
            artifact_root: var("ARTIFACT_ROOT").map_or(defaults.artifact_root, PathBuf::from),
            cleanup,
            ogr2ogr_path: var("OGR2OGR_PATH").map_or(defaults.ogr2ogr_path, PathBuf::from),
            creation_options,
            terminal_ttl: (ttl_secs > 0).then(|| Duration::from_secs(ttl_secs)),
            log_format: parse_or(var("LOG_FORMAT"), "LOG_FORMAT", defaults.log_format)?,
        })
    }

    /// Attempts older than this are presumed dead by the reconciler.
    pub fn stale_after(&self) -> Duration {
        self.attempt_timeout + self.cancel_grace
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            concurrency: self.concurrency,
            retry: self.retry.clone(),
            attempt_timeout: self.attempt_timeout,
            cancel_grace: self.cancel_grace,
            creation_options: self.creation_options.clone(),
            ..ExecutorSettings::default()
        }
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {value:?}")),
        None => Ok(default),
    }
}

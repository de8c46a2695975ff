//! Configuration for chatrelay.
//!
//! Everything is environment-driven; a `.env` file is honored when present.

use std::time::Duration;

use crate::error::ConfigError;

/// Main configuration for the gateway.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub stream: StreamConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        Ok(Self {
            server: ServerConfig::from_env()?,
            store: StoreConfig::from_env()?,
            stream: StreamConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            stream: StreamConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: optional_env("HOST")?.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_optional_env("PORT", 5001)?,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
        }
    }
}

/// Persistent key-value store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Deployment namespace prefixed to every key.
    pub namespace: String,
    /// TTL on job records; abandoned jobs expire on their own.
    pub job_ttl: Duration,
}

impl StoreConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            namespace: optional_env("STORE_NAMESPACE")?.unwrap_or_else(|| "chatrelay".to_string()),
            job_ttl: Duration::from_secs(parse_optional_env("JOB_TTL_SECS", 86_400)?),
        })
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "chatrelay".to_string(),
            job_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Streaming and lifecycle timing.
///
/// `timeout` is shared by the supervisor sweep and every consumer's own
/// wall-clock timer. Using one value closes the window where the server
/// considers a job dead while a client is still waiting on it.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Hard deadline for a generation from job creation to terminal state.
    pub timeout: Duration,
    /// Producer-side floor between stream-buffer republishes.
    pub publish_interval: Duration,
    /// Consumer poll interval while new content is arriving.
    pub poll_interval: Duration,
    /// Consumer poll interval once the buffer goes quiet.
    pub idle_poll_interval: Duration,
    /// How often the supervisor sweeps for timed-out jobs.
    pub sweep_interval: Duration,
    /// TTL on stream buffers so abandoned ones self-expire.
    pub buffer_ttl: Duration,
}

impl StreamConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let timeout_secs: u64 = parse_optional_env("STREAM_TIMEOUT_SECS", 300)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "STREAM_TIMEOUT_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let poll_ms: u64 = parse_optional_env("STREAM_POLL_INTERVAL_MS", 100)?;
        Ok(Self {
            timeout: Duration::from_secs(timeout_secs),
            publish_interval: Duration::from_millis(parse_optional_env(
                "STREAM_PUBLISH_INTERVAL_MS",
                100,
            )?),
            poll_interval: Duration::from_millis(poll_ms),
            // Back off roughly 10x while nothing new is arriving.
            idle_poll_interval: Duration::from_millis(poll_ms.saturating_mul(10)),
            sweep_interval: Duration::from_secs(parse_optional_env("SWEEP_INTERVAL_SECS", 1)?),
            // Buffers outlive the stream deadline by a sweep's worth of slack.
            buffer_ttl: Duration::from_secs(timeout_secs + 60),
        })
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            publish_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
            idle_poll_interval: Duration::from_millis(1000),
            sweep_interval: Duration::from_secs(1),
            buffer_ttl: Duration::from_secs(360),
        }
    }
}

/// Elastic worker pool sizing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub floor: usize,
    pub ceiling: usize,
    pub check_interval: Duration,
}

impl WorkerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let floor: usize = parse_optional_env("WORKER_POOL_FLOOR", 5)?;
        let ceiling: usize = parse_optional_env("WORKER_POOL_CEILING", 50)?;
        if floor == 0 || floor > ceiling {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_POOL_FLOOR".to_string(),
                message: format!("floor {floor} must be in 1..={ceiling}"),
            });
        }
        Ok(Self {
            floor,
            ceiling,
            check_interval: Duration::from_secs(parse_optional_env(
                "WORKER_CHECK_INTERVAL_SECS",
                30,
            )?),
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            floor: 5,
            ceiling: 50,
            check_interval: Duration::from_secs(30),
        }
    }
}

// Helper functions

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global, so serialize tests that mutate them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_env_unset() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::remove_var("STREAM_TIMEOUT_SECS");
        std::env::remove_var("WORKER_POOL_FLOOR");
        let stream = StreamConfig::from_env().unwrap();
        assert_eq!(stream.timeout, Duration::from_secs(300));
        assert_eq!(stream.idle_poll_interval, Duration::from_millis(1000));
        let worker = WorkerConfig::from_env().unwrap();
        assert_eq!(worker.floor, 5);
        assert_eq!(worker.ceiling, 50);
    }

    #[test]
    fn rejects_floor_above_ceiling() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("WORKER_POOL_FLOOR", "60");
        std::env::set_var("WORKER_POOL_CEILING", "50");
        assert!(WorkerConfig::from_env().is_err());
        std::env::remove_var("WORKER_POOL_FLOOR");
        std::env::remove_var("WORKER_POOL_CEILING");
    }

    #[test]
    fn rejects_zero_timeout() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("STREAM_TIMEOUT_SECS", "0");
        assert!(StreamConfig::from_env().is_err());
        std::env::remove_var("STREAM_TIMEOUT_SECS");
    }
}

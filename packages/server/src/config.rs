use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub max_concurrent_jobs: usize,
    pub heartbeat_interval_s: u64,
    pub job_poll_interval_s: u64,
    pub recovery_scan_interval_s: u64,
    pub stale_job_threshold_s: i64,
    pub max_job_attempts: i32,
    pub stream_buffer_size: usize,
    pub stream_grace_seconds: u64,
    pub bisect_timeout_s: Option<u64>,
    pub jwt_secret: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be valid: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            max_concurrent_jobs: env_or("MAX_CONCURRENT_JOBS", 4)?,
            heartbeat_interval_s: env_or("HEARTBEAT_INTERVAL_S", 60)?,
            job_poll_interval_s: env_or("JOB_POLL_INTERVAL_S", 2)?,
            recovery_scan_interval_s: env_or("RECOVERY_SCAN_INTERVAL_S", 30)?,
            stale_job_threshold_s: env_or("STALE_JOB_THRESHOLD_S", 300)?,
            max_job_attempts: env_or("MAX_JOB_ATTEMPTS", 3)?,
            stream_buffer_size: env_or("STREAM_BUFFER_SIZE", 1000)?,
            stream_grace_seconds: env_or("STREAM_GRACE_SECONDS", 300)?,
            bisect_timeout_s: env::var("BISECT_TIMEOUT_S")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .context("BISECT_TIMEOUT_S must be a valid number")?,
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| "dev-secret".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_to_default() {
        std::env::remove_var("SOME_UNSET_TUNABLE");
        let value: u64 = env_or("SOME_UNSET_TUNABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_or_parses_present_value() {
        std::env::set_var("SOME_SET_TUNABLE", "17");
        let value: u64 = env_or("SOME_SET_TUNABLE", 42).unwrap();
        assert_eq!(value, 17);
        std::env::remove_var("SOME_SET_TUNABLE");
    }
}

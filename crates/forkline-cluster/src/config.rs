// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::resources::ResourceLimits;
use crate::supervisor::RestartPolicy;

const MIB: u64 = 1024 * 1024;

/// Forkline cluster configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address every worker binds (shared through SO_REUSEPORT)
    pub bind_addr: SocketAddr,
    /// Idle time after which a keep-alive connection is closed
    pub keep_alive_timeout: Duration,
    /// Time allowed for a client to send complete request headers
    pub headers_timeout: Duration,
    /// Shared store file
    pub store_path: PathBuf,
    /// Shared store channel id
    pub store_channel: String,
    /// Redis URL backing the distributed lock (lock disabled when unset)
    pub redis_url: Option<String>,
    /// Memory budgeting for the worker count
    pub limits: ResourceLimits,
    /// Pause between "what now" pings while a worker waits for start
    pub poll_interval: Duration,
    /// What happens when a worker dies
    pub restart_policy: RestartPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `FORKLINE_MAX_FORKS`: worker cap (default: 4)
    /// - `FORKLINE_PORT`: HTTP port (default: 3000)
    /// - `FORKLINE_KEEP_ALIVE_TIMEOUT_MS`: keep-alive idle timeout (default: 65000)
    /// - `FORKLINE_HEADERS_TIMEOUT_MS`: header read timeout (default: 66000)
    /// - `FORKLINE_STORE_PATH`: shared store file (default: `.data/shared.json`)
    /// - `FORKLINE_STORE_CHANNEL`: shared store channel id (default: `shared-config`)
    /// - `FORKLINE_REDIS_URL`: enables the Redis distributed lock
    /// - `FORKLINE_WORKER_MEMORY_MB`: memory per worker (default: 512)
    /// - `FORKLINE_RESERVED_MEMORY_MB`: memory kept for the system (default: 2048)
    /// - `FORKLINE_POLL_INTERVAL_MS`: worker start poll interval (default: 100)
    /// - `FORKLINE_RESTART_MAX`: enables the bounded restart policy
    /// - `FORKLINE_RESTART_WINDOW_SECS`: bounded policy window (default: 60)
    /// - `FORKLINE_RESTART_BACKOFF_MS`: bounded policy backoff (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_forks: usize = parse_var("FORKLINE_MAX_FORKS", "4", "must be a positive integer")?;
        if max_forks == 0 {
            return Err(ConfigError::Invalid("FORKLINE_MAX_FORKS", "must be at least 1"));
        }

        let port: u16 = parse_var("FORKLINE_PORT", "3000", "must be a valid port number")?;

        let keep_alive_ms: u64 = parse_var(
            "FORKLINE_KEEP_ALIVE_TIMEOUT_MS",
            "65000",
            "must be a duration in milliseconds",
        )?;
        let headers_ms: u64 = parse_var(
            "FORKLINE_HEADERS_TIMEOUT_MS",
            "66000",
            "must be a duration in milliseconds",
        )?;

        let store_path = PathBuf::from(
            std::env::var("FORKLINE_STORE_PATH")
                .unwrap_or_else(|_| ".data/shared.json".to_string()),
        );
        let store_channel =
            std::env::var("FORKLINE_STORE_CHANNEL").unwrap_or_else(|_| "shared-config".to_string());
        if store_channel.is_empty() {
            return Err(ConfigError::Invalid("FORKLINE_STORE_CHANNEL", "must not be empty"));
        }

        let redis_url = std::env::var("FORKLINE_REDIS_URL")
            .ok()
            .filter(|url| !url.is_empty());

        let worker_memory_mb: u64 = parse_var(
            "FORKLINE_WORKER_MEMORY_MB",
            "512",
            "must be a positive integer",
        )?;
        if worker_memory_mb == 0 {
            return Err(ConfigError::Invalid("FORKLINE_WORKER_MEMORY_MB", "must be at least 1"));
        }
        let reserved_memory_mb: u64 = parse_var(
            "FORKLINE_RESERVED_MEMORY_MB",
            "2048",
            "must be a non-negative integer",
        )?;

        let poll_interval_ms: u64 = parse_var(
            "FORKLINE_POLL_INTERVAL_MS",
            "100",
            "must be a duration in milliseconds",
        )?;

        let restart_policy = match std::env::var("FORKLINE_RESTART_MAX") {
            Ok(value) if !value.is_empty() => {
                let max_restarts: u32 = value.parse().map_err(|_| {
                    ConfigError::Invalid("FORKLINE_RESTART_MAX", "must be a non-negative integer")
                })?;
                let window_secs: u64 = parse_var(
                    "FORKLINE_RESTART_WINDOW_SECS",
                    "60",
                    "must be a duration in seconds",
                )?;
                let backoff_ms: u64 = parse_var(
                    "FORKLINE_RESTART_BACKOFF_MS",
                    "1000",
                    "must be a duration in milliseconds",
                )?;
                RestartPolicy::Bounded {
                    max_restarts,
                    window: Duration::from_secs(window_secs),
                    backoff: Duration::from_millis(backoff_ms),
                }
            }
            _ => RestartPolicy::Permanent,
        };

        Ok(Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            keep_alive_timeout: Duration::from_millis(keep_alive_ms),
            headers_timeout: Duration::from_millis(headers_ms),
            store_path,
            store_channel,
            redis_url,
            limits: ResourceLimits {
                max_forks,
                worker_memory_bytes: worker_memory_mb * MIB,
                reserved_memory_bytes: reserved_memory_mb * MIB,
            },
            poll_interval: Duration::from_millis(poll_interval_ms),
            restart_policy,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            keep_alive_timeout: Duration::from_millis(65_000),
            headers_timeout: Duration::from_millis(66_000),
            store_path: PathBuf::from(".data/shared.json"),
            store_channel: "shared-config".to_string(),
            redis_url: None,
            limits: ResourceLimits::default(),
            poll_interval: Duration::from_millis(100),
            restart_policy: RestartPolicy::Permanent,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, reason))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "FORKLINE_MAX_FORKS",
        "FORKLINE_PORT",
        "FORKLINE_KEEP_ALIVE_TIMEOUT_MS",
        "FORKLINE_HEADERS_TIMEOUT_MS",
        "FORKLINE_STORE_PATH",
        "FORKLINE_STORE_CHANNEL",
        "FORKLINE_REDIS_URL",
        "FORKLINE_WORKER_MEMORY_MB",
        "FORKLINE_RESERVED_MEMORY_MB",
        "FORKLINE_POLL_INTERVAL_MS",
        "FORKLINE_RESTART_MAX",
        "FORKLINE_RESTART_WINDOW_SECS",
        "FORKLINE_RESTART_BACKOFF_MS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        /// Start from a clean slate: every forkline variable unset.
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();

        assert_eq!(config.limits.max_forks, 4);
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.keep_alive_timeout, Duration::from_millis(65_000));
        assert_eq!(config.headers_timeout, Duration::from_millis(66_000));
        assert_eq!(config.store_path, PathBuf::from(".data/shared.json"));
        assert_eq!(config.store_channel, "shared-config");
        assert!(config.redis_url.is_none());
        assert_eq!(config.limits.worker_memory_bytes, 512 * MIB);
        assert_eq!(config.limits.reserved_memory_bytes, 2048 * MIB);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.restart_policy, RestartPolicy::Permanent);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("FORKLINE_MAX_FORKS", "3");
        guard.set("FORKLINE_PORT", "8080");
        guard.set("FORKLINE_STORE_PATH", "/var/lib/app/config.json");
        guard.set("FORKLINE_STORE_CHANNEL", "app-config");
        guard.set("FORKLINE_REDIS_URL", "redis://cache:6379");
        guard.set("FORKLINE_POLL_INTERVAL_MS", "25");

        let config = Config::from_env().unwrap();

        assert_eq!(config.limits.max_forks, 3);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.store_path, PathBuf::from("/var/lib/app/config.json"));
        assert_eq!(config.store_channel, "app-config");
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.poll_interval, Duration::from_millis(25));
    }

    #[test]
    fn test_config_bounded_restart_policy() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("FORKLINE_RESTART_MAX", "5");
        guard.set("FORKLINE_RESTART_BACKOFF_MS", "250");

        let config = Config::from_env().unwrap();

        assert_eq!(
            config.restart_policy,
            RestartPolicy::Bounded {
                max_restarts: 5,
                window: Duration::from_secs(60),
                backoff: Duration::from_millis(250),
            }
        );
    }

    #[test]
    fn test_config_empty_redis_url_is_unset() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("FORKLINE_REDIS_URL", "");

        let config = Config::from_env().unwrap();
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_config_zero_max_forks() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("FORKLINE_MAX_FORKS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("FORKLINE_MAX_FORKS", _)));
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("FORKLINE_PORT", "99999"); // > 65535

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("FORKLINE_PORT", _)));
    }

    #[test]
    fn test_config_invalid_restart_max() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("FORKLINE_RESTART_MAX", "lots");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("FORKLINE_RESTART_MAX", _)));
    }

    #[test]
    fn test_config_error_display() {
        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}

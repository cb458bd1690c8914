/// Configuration management for the flowpilot engine
///
/// Handles server configuration, database connection, scheduler lifecycle,
/// retry policy, definition caching and outbound delivery gateways.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Scheduler lifecycle and log retention
    pub scheduler: SchedulerConfig,
    /// Per-action retry policy
    pub retry: RetryConfig,
    /// Read-through definition cache
    pub cache: CacheConfig,
    /// Outbound delivery for the built-in messaging actions
    pub actions: ActionsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration for workflow and log storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (default: "sqlite://data/flowpilot.db")
    pub url: String,
}

/// Scheduler lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of most recent log entries kept by the retention trim
    pub log_retention: u32,
    /// Hours between retention trims
    pub cleanup_interval_hours: u64,
    /// Seconds to wait for in-flight runs on shutdown before abandoning them
    pub shutdown_grace_secs: u64,
}

/// Retry policy applied to every action step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// First backoff wait; doubles after every failed attempt
    pub base_delay_secs: u64,
}

/// Definition cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a cached definition stays fresh
    pub ttl_secs: u64,
}

/// Gateways for the email and messaging actions.
/// When unset the action records the delivery in the log instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    pub email_gateway_url: Option<String>,
    pub whatsapp_gateway_url: Option<String>,
}

impl SchedulerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 3600)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            log_retention: 1000,
            cleanup_interval_hours: 24,
            shutdown_grace_secs: 30,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let scheduler_defaults = SchedulerConfig::default();
        let retry_defaults = RetryConfig::default();

        Self {
            server: ServerConfig {
                host: std::env::var("FLOWPILOT_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWPILOT_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("FLOWPILOT_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/flowpilot.db".to_string()),
            },
            scheduler: SchedulerConfig {
                log_retention: env_or("FLOWPILOT_LOG_RETENTION", scheduler_defaults.log_retention),
                cleanup_interval_hours: env_or(
                    "FLOWPILOT_CLEANUP_INTERVAL_HOURS",
                    scheduler_defaults.cleanup_interval_hours,
                ),
                shutdown_grace_secs: env_or(
                    "FLOWPILOT_SHUTDOWN_GRACE_SECS",
                    scheduler_defaults.shutdown_grace_secs,
                ),
            },
            retry: RetryConfig {
                max_attempts: env_or("FLOWPILOT_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts),
                base_delay_secs: env_or(
                    "FLOWPILOT_RETRY_BASE_DELAY_SECS",
                    retry_defaults.base_delay_secs,
                ),
            },
            cache: CacheConfig {
                ttl_secs: env_or("FLOWPILOT_CACHE_TTL_SECS", CacheConfig::default().ttl_secs),
            },
            actions: ActionsConfig {
                email_gateway_url: std::env::var("FLOWPILOT_EMAIL_GATEWAY_URL").ok(),
                whatsapp_gateway_url: std::env::var("FLOWPILOT_WHATSAPP_GATEWAY_URL").ok(),
            },
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when
/// it is unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_garbage() {
        std::env::set_var("FLOWPILOT_TEST_GARBAGE_PORT", "not-a-number");
        assert_eq!(env_or("FLOWPILOT_TEST_GARBAGE_PORT", 3004u16), 3004);
        std::env::remove_var("FLOWPILOT_TEST_GARBAGE_PORT");
    }

    #[test]
    fn scheduler_durations() {
        let config = SchedulerConfig::default();
        assert_eq!(config.cleanup_interval(), Duration::from_secs(86_400));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(config.log_retention, 1000);
    }
}

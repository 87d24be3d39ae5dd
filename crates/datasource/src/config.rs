//! Pool and data source configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::factory::{ConnectionSettings, Credentials};

/// Default keep-alive query.
pub const DEFAULT_KEEP_ALIVE_QUERY: &str = "SELECT 1";

/// Idle time after which a connection is pinged before checkout.
pub const DEFAULT_KEEP_ALIVE_AGE: Duration = Duration::from_secs(5);

/// Idle time after which a connection is retired without a ping.
pub const DEFAULT_MAX_IDLE_AGE: Duration = Duration::from_secs(60 * 60);

/// Configuration for the resource-limiting pool.
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections. Zero means unbounded.
    pub max_connections: usize,

    /// Never exceed `max_connections`, even under load.
    ///
    /// When false the pool creates over-limit connections instead of
    /// failing or blocking.
    pub max_strict: bool,

    /// Wait for a released connection when a strict pool is exhausted.
    pub blocking: bool,

    /// How long a blocked `get` may wait in total. Zero waits forever.
    pub block_timeout: Duration,

    /// Period of the idle trimmer, and the idle age it trims at. Zero disables trimming.
    pub trim_interval: Duration,

    /// Auto-commit mode applied to every newly created connection.
    pub auto_commit: bool,

    /// Number of connections trimming never goes below, and that
    /// `warm_up` opens ahead of demand.
    pub min_connections: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 3,
            max_strict: true,
            blocking: true,
            block_timeout: Duration::ZERO,
            trim_interval: Duration::from_secs(60),
            auto_commit: true,
            min_connections: 0,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of connections. Zero means unbounded.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Enable or disable the hard cap on pool size.
    #[must_use]
    pub fn max_strict(mut self, strict: bool) -> Self {
        self.max_strict = strict;
        self
    }

    /// Enable or disable blocking when a strict pool is exhausted.
    #[must_use]
    pub fn blocking(mut self, enabled: bool) -> Self {
        self.blocking = enabled;
        self
    }

    /// Set the total time a blocked `get` may wait. Zero waits forever.
    #[must_use]
    pub fn block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Set the trim interval. Zero disables trimming.
    #[must_use]
    pub fn trim_interval(mut self, interval: Duration) -> Self {
        self.trim_interval = interval;
        self
    }

    /// Set the auto-commit default for new connections.
    #[must_use]
    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    /// Set the minimum number of retained connections.
    #[must_use]
    pub fn min_connections(mut self, count: usize) -> Self {
        self.min_connections = count;
        self
    }

    /// The block timeout, or `None` when a blocked `get` waits forever.
    #[must_use]
    pub fn wait_limit(&self) -> Option<Duration> {
        (!self.block_timeout.is_zero()).then_some(self.block_timeout)
    }

    /// Whether `size` connections leave room for one more under the cap.
    #[must_use]
    pub fn has_capacity(&self, size: usize) -> bool {
        self.max_connections == 0 || size < self.max_connections
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections != 0 && self.min_connections > self.max_connections {
            return Err(PoolError::Configuration(
                "min_connections cannot be greater than max_connections".into(),
            ));
        }
        Ok(())
    }
}

/// Keep-alive probe configuration.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Probe query, prepared once per connection. `None` disables probing.
    pub query: Option<Arc<str>>,

    /// Idle time after which a connection is probed before checkout.
    pub age: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            query: Some(Arc::from(DEFAULT_KEEP_ALIVE_QUERY)),
            age: DEFAULT_KEEP_ALIVE_AGE,
        }
    }
}

impl KeepAliveConfig {
    /// Probe with `query` once a connection has been idle for `age`.
    #[must_use]
    pub fn new(query: impl Into<Arc<str>>, age: Duration) -> Self {
        Self {
            query: Some(query.into()),
            age,
        }
    }

    /// Never probe.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            query: None,
            age: DEFAULT_KEEP_ALIVE_AGE,
        }
    }

    /// The probe query, if it is set and not blank.
    #[must_use]
    pub fn effective_query(&self) -> Option<&str> {
        self.query.as_deref().filter(|q| !q.trim().is_empty())
    }
}

/// When a pooled connection is retired regardless of probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetirementPolicy {
    /// Retire a connection that has been idle longer than this.
    pub max_idle_age: Option<Duration>,

    /// Retire a connection after it has been returned this many times.
    pub max_uses: Option<u32>,
}

impl Default for RetirementPolicy {
    fn default() -> Self {
        Self {
            max_idle_age: Some(DEFAULT_MAX_IDLE_AGE),
            max_uses: None,
        }
    }
}

impl RetirementPolicy {
    /// Never retire connections on age or use count.
    #[must_use]
    pub fn never() -> Self {
        Self {
            max_idle_age: None,
            max_uses: None,
        }
    }

    /// Retire connections idle longer than `age`.
    #[must_use]
    pub fn max_idle_age(mut self, age: Option<Duration>) -> Self {
        self.max_idle_age = age;
        self
    }

    /// Retire connections after `uses` returns to the pool.
    #[must_use]
    pub fn max_uses(mut self, uses: Option<u32>) -> Self {
        self.max_uses = uses;
        self
    }
}

/// Flat data source configuration record.
///
/// Durations are in milliseconds. Reading the record from a file or the
/// environment is left to the caller; any serde format works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DataSourceSettings {
    /// Driver-specific connection URL.
    pub url: String,
    /// User name, if the driver needs credentials.
    pub user: Option<String>,
    /// Password for `user`.
    pub password: Option<String>,
    /// Maximum pool size. Values below 1 are raised to 1.
    pub max_size: i64,
    /// Enforce `max_size` as a hard cap.
    pub max_strict: bool,
    /// Block when the pool is exhausted.
    pub blocking: bool,
    /// Block timeout in milliseconds. Zero waits forever.
    pub block_timeout_ms: u64,
    /// Trim interval in milliseconds. Zero disables trimming.
    pub trim_interval_ms: u64,
    /// Auto-commit default for new connections.
    pub auto_commit: bool,
    /// Keep-alive probe query.
    pub keep_alive_query: Option<String>,
    /// Disable the keep-alive probe even if a query is set.
    pub keep_alive_disabled: bool,
    /// Idle time in milliseconds before a connection is probed.
    pub keep_alive_age_ms: u64,
    /// Connections kept through trimming and opened at startup.
    pub min_size: usize,
    /// Retire connections after this many uses.
    pub max_uses: Option<u32>,
    /// Retire connections idle longer than this many milliseconds. Zero disables.
    pub max_idle_age_ms: u64,
}

impl Default for DataSourceSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: None,
            password: None,
            max_size: 3,
            max_strict: true,
            blocking: true,
            block_timeout_ms: 0,
            trim_interval_ms: 60_000,
            auto_commit: true,
            keep_alive_query: Some(DEFAULT_KEEP_ALIVE_QUERY.to_string()),
            keep_alive_disabled: false,
            keep_alive_age_ms: 5_000,
            min_size: 0,
            max_uses: None,
            max_idle_age_ms: 60 * 60 * 1000,
        }
    }
}

impl DataSourceSettings {
    /// Create settings for `url` with default values.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Split the record into factory settings and pool configuration.
    ///
    /// A `max_size` below 1 is raised to 1 and logged.
    #[must_use]
    pub fn into_parts(self) -> (ConnectionSettings, PoolConfig) {
        let max = if self.max_size < 1 {
            tracing::warn!(
                max_size = self.max_size,
                "maximum number of connections must be at least 1, using 1"
            );
            1
        } else {
            usize::try_from(self.max_size).unwrap_or(usize::MAX)
        };

        let keep_alive = match self.keep_alive_query {
            Some(query) if !self.keep_alive_disabled => KeepAliveConfig::new(
                query,
                Duration::from_millis(self.keep_alive_age_ms),
            ),
            _ => KeepAliveConfig::disabled(),
        };

        let retirement = RetirementPolicy::never()
            .max_idle_age(
                (self.max_idle_age_ms > 0).then(|| Duration::from_millis(self.max_idle_age_ms)),
            )
            .max_uses(self.max_uses);

        let credentials = self.user.map(|user| Credentials::new(user, self.password));

        let connection = ConnectionSettings {
            url: self.url,
            credentials,
            auto_commit: self.auto_commit,
            keep_alive,
            retirement,
        };

        let pool = PoolConfig::new()
            .max_connections(max)
            .max_strict(self.max_strict)
            .blocking(self.blocking)
            .block_timeout(Duration::from_millis(self.block_timeout_ms))
            .trim_interval(Duration::from_millis(self.trim_interval_ms))
            .auto_commit(self.auto_commit)
            .min_connections(self.min_size.min(max));

        (connection, pool)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 3);
        assert!(config.max_strict);
        assert!(config.blocking);
        assert_eq!(config.block_timeout, Duration::ZERO);
        assert_eq!(config.trim_interval, Duration::from_secs(60));
        assert!(config.auto_commit);
        assert_eq!(config.wait_limit(), None);
    }

    #[test]
    fn test_config_builder_methods() {
        let config = PoolConfig::new()
            .max_connections(10)
            .max_strict(false)
            .blocking(false)
            .block_timeout(Duration::from_millis(250))
            .trim_interval(Duration::ZERO)
            .auto_commit(false)
            .min_connections(2);

        assert_eq!(config.max_connections, 10);
        assert!(!config.max_strict);
        assert!(!config.blocking);
        assert_eq!(config.wait_limit(), Some(Duration::from_millis(250)));
        assert_eq!(config.trim_interval, Duration::ZERO);
        assert!(!config.auto_commit);
        assert_eq!(config.min_connections, 2);
    }

    #[test]
    fn test_capacity_unbounded() {
        let config = PoolConfig::new().max_connections(0);
        assert!(config.has_capacity(10_000));

        let config = PoolConfig::new().max_connections(2);
        assert!(config.has_capacity(1));
        assert!(!config.has_capacity(2));
    }

    #[test]
    fn test_config_validation_min_greater_than_max() {
        let config = PoolConfig::new().min_connections(5).max_connections(2);
        let result = config.validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("min_connections cannot be greater than max_connections")
        );

        // Unbounded pools accept any minimum.
        let config = PoolConfig::new().min_connections(5).max_connections(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_keep_alive_blank_query_disables_probe() {
        assert_eq!(
            KeepAliveConfig::default().effective_query(),
            Some(DEFAULT_KEEP_ALIVE_QUERY)
        );
        assert_eq!(
            KeepAliveConfig::new("   ", Duration::ZERO).effective_query(),
            None
        );
        assert_eq!(KeepAliveConfig::disabled().effective_query(), None);
    }

    #[test]
    fn test_settings_clamp_max_size() {
        let mut settings = DataSourceSettings::new("mock://db");
        settings.max_size = 0;
        settings.min_size = 4;

        let (_, pool) = settings.into_parts();
        assert_eq!(pool.max_connections, 1);
        assert_eq!(pool.min_connections, 1);
        assert!(pool.validate().is_ok());
    }

    #[test]
    fn test_settings_disable_keep_alive() {
        let mut settings = DataSourceSettings::new("mock://db");
        settings.keep_alive_disabled = true;

        let (connection, _) = settings.into_parts();
        assert!(connection.keep_alive.query.is_none());
    }

    #[test]
    fn test_settings_retirement_and_credentials() {
        let mut settings = DataSourceSettings::new("mock://db");
        settings.user = Some("scott".into());
        settings.password = Some("tiger".into());
        settings.max_idle_age_ms = 0;
        settings.max_uses = Some(3);

        let (connection, _) = settings.into_parts();
        assert_eq!(connection.retirement, RetirementPolicy::never().max_uses(Some(3)));
        let credentials = connection.credentials.unwrap();
        assert_eq!(credentials.user(), "scott");
        assert_eq!(credentials.password(), Some("tiger"));
    }
}

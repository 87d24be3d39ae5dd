//! Connection factories.
//!
//! A [`ConnectionFactory`] opens new pooled connections and decommissions
//! old ones. [`DriverConnectionFactory`] is the standard implementation: it
//! stores a URL and credentials and asks a [`Driver`] for physical
//! connections.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::config::{KeepAliveConfig, RetirementPolicy};
use crate::connection::{Connection, ConnectionFlavor, PooledConnection};
use crate::error::{DriverError, PoolError};

/// Creates and destroys pooled connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// The driver connection type produced by this factory.
    type Connection: Connection;

    /// Open a new physical connection.
    async fn create(&self) -> Result<PooledConnection<Self::Connection>, PoolError>;

    /// Physically close a connection. Never fails; close errors are logged.
    async fn decommission(&self, mut connection: PooledConnection<Self::Connection>) {
        connection.dispose().await;
    }

    /// Close anything the factory holds outside the pool.
    ///
    /// Called once when the owning pool is disposed.
    async fn shutdown(&self) {}
}

/// Opens physical connections to a database.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// The connection type this driver opens.
    type Connection: Connection;

    /// Open a connection to `url`.
    async fn connect(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Self::Connection, DriverError>;
}

/// User name and password for a driver.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    user: String,
    password: Option<String>,
}

impl Credentials {
    /// Create credentials for `user`.
    #[must_use]
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }

    /// The user name.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The password, if any.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Everything a [`DriverConnectionFactory`] needs to open connections.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Driver-specific connection URL.
    pub url: String,
    /// Optional credentials.
    pub credentials: Option<Credentials>,
    /// Auto-commit mode for new connections.
    pub auto_commit: bool,
    /// Keep-alive probe.
    pub keep_alive: KeepAliveConfig,
    /// Age and use-count retirement.
    pub retirement: RetirementPolicy,
}

impl ConnectionSettings {
    /// Settings for `url` with defaults for everything else.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            auto_commit: true,
            keep_alive: KeepAliveConfig::default(),
            retirement: RetirementPolicy::default(),
        }
    }

    /// Set credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Set the auto-commit mode.
    #[must_use]
    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    /// Set the keep-alive probe.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the retirement policy.
    #[must_use]
    pub fn retirement(mut self, retirement: RetirementPolicy) -> Self {
        self.retirement = retirement;
        self
    }
}

/// Connection factory backed by a [`Driver`].
pub struct DriverConnectionFactory<D: Driver> {
    driver: D,
    settings: ConnectionSettings,
    flavor: OnceCell<ConnectionFlavor>,
    first: Mutex<Option<D::Connection>>,
    next_id: AtomicU64,
}

impl<D: Driver> DriverConnectionFactory<D> {
    /// Create a factory that opens its first connection on demand.
    pub fn new(driver: D, settings: ConnectionSettings) -> Self {
        Self {
            driver,
            settings,
            flavor: OnceCell::new(),
            first: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a factory and open one connection right away.
    ///
    /// The connection is used to detect the driver's capabilities and is
    /// handed out by the first [`create`](ConnectionFactory::create). If it
    /// cannot be opened the failure is logged and detection is deferred.
    pub async fn connect(driver: D, settings: ConnectionSettings) -> Self {
        let factory = Self::new(driver, settings);
        match factory.open().await {
            Ok(raw) => {
                factory.detect(&raw);
                *factory.first.lock() = Some(raw);
            }
            Err(e) => {
                tracing::warn!(url = %factory.settings.url, error = %e, "could not open initial connection");
            }
        }
        factory
    }

    /// The detected wrapper variant, once a connection has been opened.
    #[must_use]
    pub fn flavor(&self) -> Option<ConnectionFlavor> {
        self.flavor.get().copied()
    }

    /// The settings this factory opens connections with.
    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// The driver.
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    async fn open(&self) -> Result<D::Connection, DriverError> {
        self.driver
            .connect(&self.settings.url, self.settings.credentials.as_ref())
            .await
    }

    fn detect(&self, raw: &D::Connection) -> ConnectionFlavor {
        *self.flavor.get_or_init(|| {
            let flavor = ConnectionFlavor::detect(raw.capabilities());
            tracing::debug!(?flavor, "detected connection capabilities");
            flavor
        })
    }
}

#[async_trait]
impl<D: Driver> ConnectionFactory for DriverConnectionFactory<D> {
    type Connection = D::Connection;

    async fn create(&self) -> Result<PooledConnection<D::Connection>, PoolError> {
        let stashed = self.first.lock().take();
        let raw = match stashed {
            Some(raw) => raw,
            None => self.open().await.map_err(PoolError::ConnectionCreation)?,
        };

        let flavor = self.detect(&raw);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connection = PooledConnection::new(
            id,
            raw,
            flavor,
            &self.settings.keep_alive,
            self.settings.retirement,
        )
        .await;

        if let Err(e) = connection.set_auto_commit(self.settings.auto_commit).await {
            connection.dispose().await;
            return Err(PoolError::ConnectionCreation(e));
        }

        tracing::debug!(connection_id = id, "connection created");
        Ok(connection)
    }

    async fn decommission(&self, mut connection: PooledConnection<D::Connection>) {
        let id = connection.id();
        connection.dispose().await;
        tracing::debug!(connection_id = id, "connection decommissioned");
    }

    async fn shutdown(&self) {
        let stashed = self.first.lock().take();
        if let Some(mut raw) = stashed {
            if let Err(e) = raw.close().await {
                tracing::debug!(error = %e, "could not close initial connection");
            }
            tracing::debug!(url = %self.settings.url, "closed unused initial connection");
        }
    }
}

impl<D: Driver> Drop for DriverConnectionFactory<D> {
    fn drop(&mut self) {
        if self.first.get_mut().is_some() {
            tracing::warn!(
                url = %self.settings.url,
                "factory dropped before its initial connection was used or closed"
            );
        }
    }
}

impl<D: Driver> std::fmt::Debug for DriverConnectionFactory<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConnectionFactory")
            .field("settings", &self.settings)
            .field("flavor", &self.flavor.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials::new("scott", Some("tiger".into()));
        let debug = format!("{credentials:?}");
        assert!(debug.contains("scott"));
        assert!(!debug.contains("tiger"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_connection_settings_builder() {
        let settings = ConnectionSettings::new("mock://db")
            .credentials(Credentials::new("sa", None))
            .auto_commit(false)
            .keep_alive(KeepAliveConfig::disabled())
            .retirement(RetirementPolicy::never());

        assert_eq!(settings.url, "mock://db");
        assert_eq!(settings.credentials.as_ref().map(Credentials::user), Some("sa"));
        assert!(!settings.auto_commit);
        assert!(settings.keep_alive.query.is_none());
        assert_eq!(settings.retirement, RetirementPolicy::never());
    }
}

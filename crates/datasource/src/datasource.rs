//! Data source component.
//!
//! [`ResourceLimitingDataSource`] owns a pool built from a flat
//! [`DataSourceSettings`] record and enforces the configure-once,
//! dispose-once lifecycle around it.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::DataSourceSettings;
use crate::error::{IllegalState, PoolError};
use crate::factory::{ConnectionFactory, Driver, DriverConnectionFactory};
use crate::pool::{PoolGuard, PoolStatus, ResourceLimitingPool};

/// Something that hands out pooled connections.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Factory type behind the connections.
    type Factory: ConnectionFactory;

    /// Get a connection.
    async fn get_connection(&self) -> Result<PoolGuard<Self::Factory>, PoolError>;

    /// Release every connection held by this data source.
    async fn dispose(&self);
}

#[async_trait]
impl<F: ConnectionFactory> DataSource for ResourceLimitingPool<F> {
    type Factory = F;

    async fn get_connection(&self) -> Result<PoolGuard<F>, PoolError> {
        self.get().await
    }

    async fn dispose(&self) {
        ResourceLimitingPool::dispose(self).await;
    }
}

type DriverPool<D> = ResourceLimitingPool<DriverConnectionFactory<D>>;

enum Lifecycle<D: Driver> {
    Unconfigured,
    Configuring,
    Ready(DriverPool<D>),
    Disposed,
}

/// A configurable data source backed by a [`ResourceLimitingPool`].
pub struct ResourceLimitingDataSource<D: Driver> {
    name: String,
    lifecycle: Mutex<Lifecycle<D>>,
}

impl<D: Driver> ResourceLimitingDataSource<D> {
    /// Create an unconfigured data source.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lifecycle: Mutex::new(Lifecycle::Unconfigured),
        }
    }

    /// Name used in log output.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configure the data source and open its pool.
    ///
    /// Opens one connection right away to detect driver capabilities, then
    /// warms the pool up to `min_size`. Failing to open either is logged and
    /// left to the first `get_connection`.
    ///
    /// Fails with [`IllegalState::AlreadyConfigured`] on a second call.
    pub async fn configure(
        &self,
        driver: D,
        settings: DataSourceSettings,
    ) -> Result<(), PoolError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match &*lifecycle {
                Lifecycle::Unconfigured => {}
                Lifecycle::Disposed => return Err(IllegalState::Disposed.into()),
                Lifecycle::Configuring | Lifecycle::Ready(_) => {
                    return Err(IllegalState::AlreadyConfigured.into());
                }
            }
            *lifecycle = Lifecycle::Configuring;
        }

        let (connection, config) = settings.into_parts();
        tracing::debug!(
            data_source = %self.name,
            url = %connection.url,
            "configuring data source"
        );

        let factory = DriverConnectionFactory::connect(driver, connection).await;
        let pool = match ResourceLimitingPool::new(factory, config) {
            Ok(pool) => pool,
            Err(e) => {
                self.abandon_configure();
                return Err(e);
            }
        };

        if let Err(e) = pool.warm_up().await {
            tracing::warn!(
                data_source = %self.name,
                error = %e,
                "could not open minimum connections"
            );
        }

        let disposed = {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Disposed) {
                true
            } else {
                *lifecycle = Lifecycle::Ready(pool.clone());
                false
            }
        };

        if disposed {
            pool.dispose().await;
            return Err(IllegalState::Disposed.into());
        }
        Ok(())
    }

    fn abandon_configure(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, Lifecycle::Configuring) {
            *lifecycle = Lifecycle::Unconfigured;
        }
    }

    /// The pool, once configured.
    #[must_use]
    pub fn pool(&self) -> Option<DriverPool<D>> {
        match &*self.lifecycle.lock() {
            Lifecycle::Ready(pool) => Some(pool.clone()),
            _ => None,
        }
    }

    /// Pool status, once configured.
    #[must_use]
    pub fn status(&self) -> Option<PoolStatus> {
        self.pool().map(|pool| pool.status())
    }

    fn ready_pool(&self) -> Result<DriverPool<D>, PoolError> {
        match &*self.lifecycle.lock() {
            Lifecycle::Ready(pool) => Ok(pool.clone()),
            Lifecycle::Unconfigured | Lifecycle::Configuring => {
                Err(IllegalState::NotConfigured.into())
            }
            Lifecycle::Disposed => Err(IllegalState::Disposed.into()),
        }
    }
}

#[async_trait]
impl<D: Driver> DataSource for ResourceLimitingDataSource<D> {
    type Factory = DriverConnectionFactory<D>;

    async fn get_connection(&self) -> Result<PoolGuard<Self::Factory>, PoolError> {
        let pool = self.ready_pool()?;
        pool.get().await.inspect_err(|e| {
            tracing::warn!(data_source = %self.name, error = %e, "could not return connection");
        })
    }

    async fn dispose(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Disposed);
        if let Lifecycle::Ready(pool) = previous {
            pool.dispose().await;
        }
    }
}

impl<D: Driver> std::fmt::Debug for ResourceLimitingDataSource<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lifecycle.lock() {
            Lifecycle::Unconfigured => "unconfigured",
            Lifecycle::Configuring => "configuring",
            Lifecycle::Ready(_) => "ready",
            Lifecycle::Disposed => "disposed",
        };
        f.debug_struct("ResourceLimitingDataSource")
            .field("name", &self.name)
            .field("state", &state)
            .finish()
    }
}

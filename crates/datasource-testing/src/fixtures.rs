//! Test fixture utilities.
//!
//! Fixtures turn background trimming and keep-alive probing off so tests
//! only see the behavior they switch on.

use std::time::Duration;

use excalibur_datasource::{
    ConnectionSettings, DataSourceSettings, DriverConnectionFactory, KeepAliveConfig, PoolConfig,
    PoolError, ResourceLimitingPool, RetirementPolicy,
};

use crate::MockDriver;

/// URL used by every fixture.
pub const MOCK_URL: &str = "mock://test";

/// Pool type produced by [`pool`].
pub type MockPool = ResourceLimitingPool<DriverConnectionFactory<MockDriver>>;

/// Strict, non-blocking pool config with `max` connections and no trimming.
#[must_use]
pub fn pool_config(max: usize) -> PoolConfig {
    PoolConfig::new()
        .max_connections(max)
        .max_strict(true)
        .blocking(false)
        .trim_interval(Duration::ZERO)
}

/// Like [`pool_config`], but callers block for up to `timeout`.
#[must_use]
pub fn blocking_config(max: usize, timeout: Duration) -> PoolConfig {
    pool_config(max).blocking(true).block_timeout(timeout)
}

/// Factory settings with keep-alive and retirement off.
#[must_use]
pub fn connection_settings() -> ConnectionSettings {
    ConnectionSettings::new(MOCK_URL)
        .keep_alive(KeepAliveConfig::disabled())
        .retirement(RetirementPolicy::never())
}

/// A lazy factory for `driver`.
#[must_use]
pub fn factory(driver: &MockDriver) -> DriverConnectionFactory<MockDriver> {
    DriverConnectionFactory::new(driver.clone(), connection_settings())
}

/// A pool over `driver` with fixture connection settings.
pub fn pool(driver: &MockDriver, config: PoolConfig) -> Result<MockPool, PoolError> {
    ResourceLimitingPool::new(factory(driver), config)
}

/// A pool over `driver` with custom connection settings.
pub fn pool_with(
    driver: &MockDriver,
    settings: ConnectionSettings,
    config: PoolConfig,
) -> Result<MockPool, PoolError> {
    ResourceLimitingPool::new(DriverConnectionFactory::new(driver.clone(), settings), config)
}

/// Data source settings for a strict, non-blocking pool with no trimming.
#[must_use]
pub fn data_source_settings(max_size: i64) -> DataSourceSettings {
    DataSourceSettings {
        max_size,
        blocking: false,
        trim_interval_ms: 0,
        keep_alive_disabled: true,
        max_idle_age_ms: 0,
        ..DataSourceSettings::new(MOCK_URL)
    }
}

//! # excalibur-datasource
//!
//! Resource-limiting connection pool for database drivers.
//!
//! The pool hands out connections from a bounded set, validates idle
//! connections before reuse, and closes connections that sat unused for too
//! long. Drivers plug in through the [`Driver`] and [`Connection`] traits.
//!
//! ## Features
//!
//! - Strict or soft upper bound on the number of open connections
//! - Blocking checkout with a timeout, or fail-fast when exhausted
//! - Keep-alive probe on connections idle longer than a configured age
//! - Retirement by idle age and by number of uses
//! - Background trimming of idle connections down to a floor
//! - Configure-once data source component and a hashed cluster of data sources
//!
//! ## Example
//!
//! ```rust,ignore
//! use excalibur_datasource::{DataSource, DataSourceSettings, ResourceLimitingDataSource};
//!
//! let settings = DataSourceSettings {
//!     url: "postgres://localhost/app".into(),
//!     max_size: 10,
//!     blocking: true,
//!     block_timeout_ms: 500,
//!     ..Default::default()
//! };
//!
//! let data_source = ResourceLimitingDataSource::new("app");
//! data_source.configure(driver, settings).await?;
//!
//! let mut conn = data_source.get_connection().await?;
//! conn.execute("UPDATE t SET x = 1").await?;
//! // Connection goes back to the pool on drop
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cluster;
pub mod config;
pub mod connection;
pub mod datasource;
pub mod error;
pub mod factory;
pub mod instrumentation;
pub mod lifecycle;
pub mod pool;

mod trim;

pub use cluster::HashedDataSourceCluster;
pub use config::{DataSourceSettings, KeepAliveConfig, PoolConfig, RetirementPolicy};
pub use connection::{Capabilities, Connection, ConnectionFlavor, PooledConnection};
pub use datasource::{DataSource, ResourceLimitingDataSource};
pub use error::{DriverError, IllegalState, PoolError};
pub use factory::{
    ConnectionFactory, ConnectionSettings, Credentials, Driver, DriverConnectionFactory,
};
pub use instrumentation::{PoolMetrics, PoolMetricsSnapshot};
pub use lifecycle::{ConnectionMetadata, ConnectionState};
pub use pool::{PoolGuard, PoolStatus, ResourceLimitingPool};

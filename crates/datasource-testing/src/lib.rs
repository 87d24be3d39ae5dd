//! # excalibur-datasource-testing
//!
//! Test infrastructure for the `excalibur-datasource` connection pool.
//!
//! This crate provides an in-memory driver whose connections can be made to
//! fail on demand, so pool behavior can be tested without a database.
//!
//! ## Features
//!
//! - Mock driver and connection with shared counters for opens, closes and probes
//! - Fault injection for connect, prepare, probe and auto-commit changes
//! - Killing individual connections from the "server" side
//! - Fixture helpers for pools and data sources with background trimming off
//!
//! ## Example
//!
//! ```rust,ignore
//! use excalibur_datasource_testing::{MockDriver, fixtures};
//!
//! #[tokio::test]
//! async fn test_with_mock_driver() {
//!     let driver = MockDriver::new();
//!     let pool = fixtures::pool(&driver, fixtures::pool_config(2)).unwrap();
//!
//!     let conn = pool.get().await.unwrap();
//!     driver.kill(conn.raw().id());
//!     drop(conn);
//!
//!     // The next checkout discards the dead connection and opens a new one.
//!     let _conn = pool.get().await.unwrap();
//!     assert_eq!(driver.connects(), 2);
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_driver;

pub use mock_driver::{MockConnection, MockDriver, MockStatement};

//! In-memory mock driver.
//!
//! All connections opened by one [`MockDriver`] (and its clones) share a
//! single state record, so a test can hold the driver, hand a clone to the
//! pool, and then inspect what the pool did.
//!
//! ## Example
//!
//! ```rust,ignore
//! use excalibur_datasource_testing::MockDriver;
//!
//! let driver = MockDriver::new();
//! driver.set_fail_probe(true);
//! // Every keep-alive probe now fails...
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use excalibur_datasource::{Capabilities, Connection, Credentials, Driver, DriverError};
use parking_lot::Mutex;

#[derive(Default)]
struct MockState {
    next_id: AtomicU64,
    connects: AtomicUsize,
    probes: AtomicUsize,
    prepares: AtomicUsize,
    fail_connect: AtomicBool,
    fail_prepare: AtomicBool,
    fail_probe: AtomicBool,
    fail_auto_commit: AtomicBool,
    connect_delay: Mutex<Duration>,
    probe_delay: Mutex<Duration>,
    capabilities: Mutex<Capabilities>,
    killed: Mutex<HashSet<u64>>,
    closes: Mutex<HashMap<u64, usize>>,
    executed: Mutex<Vec<String>>,
    last_user: Mutex<Option<String>>,
}

impl MockState {
    fn is_killed(&self, id: u64) -> bool {
        self.killed.lock().contains(&id)
    }
}

/// A driver that opens [`MockConnection`]s.
///
/// Cloning is cheap; clones share counters and fault settings.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    /// Create a driver whose connections always succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report these capabilities from every new connection.
    #[must_use]
    pub fn with_capabilities(self, capabilities: Capabilities) -> Self {
        *self.state.capabilities.lock() = capabilities;
        self
    }

    /// Make `connect` fail.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make `prepare` fail, which also fails keep-alive preparation.
    pub fn set_fail_prepare(&self, fail: bool) {
        self.state.fail_prepare.store(fail, Ordering::SeqCst);
    }

    /// Make every keep-alive probe fail.
    pub fn set_fail_probe(&self, fail: bool) {
        self.state.fail_probe.store(fail, Ordering::SeqCst);
    }

    /// Make changing the auto-commit mode fail.
    pub fn set_fail_auto_commit(&self, fail: bool) {
        self.state.fail_auto_commit.store(fail, Ordering::SeqCst);
    }

    /// Delay every `connect` by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Delay every keep-alive probe by `delay`.
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.state.probe_delay.lock() = delay;
    }

    /// Close connection `id` from the server side.
    ///
    /// The connection then reports itself closed and fails every operation.
    pub fn kill(&self, id: u64) {
        self.state.killed.lock().insert(id);
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of keep-alive probes run.
    #[must_use]
    pub fn probes(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    /// Number of statements prepared.
    #[must_use]
    pub fn prepares(&self) -> usize {
        self.state.prepares.load(Ordering::SeqCst)
    }

    /// Total number of `close` calls across all connections.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.state.closes.lock().values().sum()
    }

    /// Number of `close` calls on connection `id`.
    #[must_use]
    pub fn close_count(&self, id: u64) -> usize {
        self.state.closes.lock().get(&id).copied().unwrap_or(0)
    }

    /// Connections opened and not yet closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connects() - self.state.closes.lock().len()
    }

    /// SQL passed to `execute`, in call order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    /// User name from the most recent `connect`.
    #[must_use]
    pub fn last_user(&self) -> Option<String> {
        self.state.last_user.lock().clone()
    }
}

impl std::fmt::Debug for MockDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDriver")
            .field("connects", &self.connects())
            .field("closes", &self.closes())
            .field("probes", &self.probes())
            .finish()
    }
}

#[async_trait]
impl Driver for MockDriver {
    type Connection = MockConnection;

    async fn connect(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<MockConnection, DriverError> {
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(DriverError::Connect(format!("mock refused connection to {url}")));
        }

        *self.state.last_user.lock() = credentials.map(|c| c.user().to_string());
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(mock_id = id, url, "mock connection opened");

        Ok(MockConnection {
            id,
            state: Arc::clone(&self.state),
            capabilities: *self.state.capabilities.lock(),
            auto_commit: true,
            closed: false,
            warnings: 0,
        })
    }
}

/// A prepared statement on a [`MockConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockStatement {
    /// The prepared SQL.
    pub sql: String,
}

/// A connection opened by [`MockDriver`].
pub struct MockConnection {
    id: u64,
    state: Arc<MockState>,
    capabilities: Capabilities,
    auto_commit: bool,
    closed: bool,
    warnings: u32,
}

impl MockConnection {
    /// Driver-assigned id, starting at 1.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of warnings not yet cleared.
    #[must_use]
    pub fn warnings(&self) -> u32 {
        self.warnings
    }

    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed || self.state.is_killed(self.id) {
            Err(DriverError::Closed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("auto_commit", &self.auto_commit)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl Connection for MockConnection {
    type Statement = MockStatement;

    fn is_closed(&self) -> bool {
        self.closed || self.state.is_killed(self.id)
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn prepare(&mut self, sql: &str) -> Result<MockStatement, DriverError> {
        self.check_open()?;
        if self.state.fail_prepare.load(Ordering::SeqCst) {
            return Err(DriverError::Query(format!("mock could not prepare `{sql}`")));
        }
        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        Ok(MockStatement { sql: sql.to_string() })
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        self.check_open()?;
        self.state.executed.lock().push(sql.to_string());
        // Every statement leaves a warning behind for recycling to clear.
        self.warnings += 1;
        Ok(1)
    }

    async fn probe(&mut self, statement: &mut MockStatement) -> Result<(), DriverError> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.probe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_open()?;
        if self.state.fail_probe.load(Ordering::SeqCst) {
            return Err(DriverError::Query(format!("mock probe `{}` failed", statement.sql)));
        }
        Ok(())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.check_open()?;
        if self.state.fail_auto_commit.load(Ordering::SeqCst) {
            return Err(DriverError::Query("mock could not change auto-commit".into()));
        }
        self.auto_commit = enabled;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.check_open()
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.check_open()
    }

    fn clear_warnings(&mut self) -> Result<(), DriverError> {
        self.warnings = 0;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        *self.state.closes.lock().entry(self.id).or_insert(0) += 1;
        self.closed = true;
        Ok(())
    }

    async fn savepoint(&mut self, _name: &str) -> Result<(), DriverError> {
        self.check_open()?;
        if self.capabilities.savepoints {
            Ok(())
        } else {
            Err(DriverError::Unsupported("savepoints"))
        }
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), DriverError> {
        self.savepoint(name).await
    }
}

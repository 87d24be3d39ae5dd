//! Pooled connection wrapper.
//!
//! [`Connection`] is the driver-side contract for one physical database
//! connection. [`PooledConnection`] wraps it with the bookkeeping the pool
//! needs: last-use tracking, a prepared keep-alive probe, and retirement by
//! idle age or use count.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{KeepAliveConfig, RetirementPolicy};
use crate::error::DriverError;
use crate::lifecycle::{ConnectionMetadata, ConnectionState};

/// A physical database connection provided by a driver.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Prepared statement handle.
    type Statement: Send;

    /// Whether the driver reports the connection as closed.
    ///
    /// This must be a local check; liveness probing is done with
    /// [`probe`](Self::probe).
    fn is_closed(&self) -> bool;

    /// Capabilities supported by this connection.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Prepare a statement.
    async fn prepare(&mut self, sql: &str) -> Result<Self::Statement, DriverError>;

    /// Execute a statement, returning the number of rows affected.
    async fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Run a prepared probe statement and discard its results.
    async fn probe(&mut self, statement: &mut Self::Statement) -> Result<(), DriverError>;

    /// Current auto-commit mode.
    fn auto_commit(&self) -> bool;

    /// Change the auto-commit mode.
    async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Clear any warnings reported on this connection.
    fn clear_warnings(&mut self) -> Result<(), DriverError>;

    /// Physically close the connection.
    async fn close(&mut self) -> Result<(), DriverError>;

    /// Create a named savepoint.
    async fn savepoint(&mut self, _name: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("savepoints"))
    }

    /// Roll back to a named savepoint.
    async fn rollback_to_savepoint(&mut self, _name: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("savepoints"))
    }
}

/// Optional features a driver connection may support.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Named savepoints inside a transaction.
    pub savepoints: bool,
    /// Result-set holdability across commits.
    pub holdability: bool,
}

/// The wrapper variant chosen from a driver's capabilities.
///
/// Resolved once per factory from the first connection it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFlavor {
    /// Core operations only.
    Basic,
    /// Core operations plus savepoints and holdability.
    Extended,
}

impl ConnectionFlavor {
    /// Pick the flavor for a set of capabilities.
    #[must_use]
    pub fn detect(capabilities: Capabilities) -> Self {
        if capabilities.savepoints && capabilities.holdability {
            Self::Extended
        } else {
            Self::Basic
        }
    }
}

/// A driver connection owned by a pool.
///
/// The pool hands these out through [`PoolGuard`](crate::pool::PoolGuard).
/// Once disposed, a wrapper is never reused.
pub struct PooledConnection<C: Connection> {
    raw: C,
    flavor: ConnectionFlavor,
    keep_alive: Option<C::Statement>,
    keep_alive_age: Duration,
    probe_error: Option<DriverError>,
    retirement: RetirementPolicy,
    uses_left: Option<u32>,
    metadata: ConnectionMetadata,
    disposed: bool,
}

impl<C: Connection> PooledConnection<C> {
    /// Wrap a freshly opened connection and prepare its keep-alive probe.
    ///
    /// If the probe cannot be prepared the connection is still usable; it is
    /// then retired on idle age alone.
    pub async fn new(
        id: u64,
        mut raw: C,
        flavor: ConnectionFlavor,
        keep_alive: &KeepAliveConfig,
        retirement: RetirementPolicy,
    ) -> Self {
        let (statement, probe_error) = match keep_alive.effective_query() {
            Some(query) => match raw.prepare(query).await {
                Ok(statement) => (Some(statement), None),
                Err(e) => {
                    tracing::warn!(
                        connection_id = id,
                        error = %e,
                        "could not prepare keep-alive statement, connection recycled on basis of time"
                    );
                    (None, Some(e))
                }
            },
            None => (None, None),
        };

        Self {
            raw,
            flavor,
            keep_alive: statement,
            keep_alive_age: keep_alive.age,
            probe_error,
            retirement,
            uses_left: retirement.max_uses,
            metadata: ConnectionMetadata::new(id),
            disposed: false,
        }
    }

    /// Pool-assigned connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.metadata.id
    }

    /// Lifecycle metadata.
    #[must_use]
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut ConnectionMetadata {
        &mut self.metadata
    }

    /// The wrapper variant this connection was created with.
    #[must_use]
    pub fn flavor(&self) -> ConnectionFlavor {
        self.flavor
    }

    /// Whether a keep-alive probe is prepared.
    #[must_use]
    pub fn has_keep_alive(&self) -> bool {
        self.keep_alive.is_some()
    }

    /// The error latched when the keep-alive probe could not be prepared.
    ///
    /// Cleared by [`recycle`](Self::recycle).
    #[must_use]
    pub fn probe_error(&self) -> Option<&DriverError> {
        self.probe_error.as_ref()
    }

    /// Returns left before the use-count retires this connection.
    #[must_use]
    pub fn uses_left(&self) -> Option<u32> {
        self.uses_left
    }

    /// The underlying driver connection.
    #[must_use]
    pub fn raw(&self) -> &C {
        &self.raw
    }

    /// The underlying driver connection, mutably.
    ///
    /// Statements created directly through the driver do not update the
    /// last-used time.
    pub fn raw_mut(&mut self) -> &mut C {
        &mut self.raw
    }

    /// Prepare a statement.
    pub async fn prepare(&mut self, sql: &str) -> Result<C::Statement, DriverError> {
        let statement = self.raw.prepare(sql).await?;
        self.metadata.touch();
        Ok(statement)
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        let affected = self.raw.execute(sql).await?;
        self.metadata.touch();
        Ok(affected)
    }

    /// Commit the current transaction.
    pub async fn commit(&mut self) -> Result<(), DriverError> {
        self.raw.commit().await?;
        self.metadata.touch();
        Ok(())
    }

    /// Roll back the current transaction.
    pub async fn rollback(&mut self) -> Result<(), DriverError> {
        self.raw.rollback().await?;
        self.metadata.touch();
        Ok(())
    }

    /// Current auto-commit mode.
    #[must_use]
    pub fn auto_commit(&self) -> bool {
        self.raw.auto_commit()
    }

    /// Change the auto-commit mode if it differs from `enabled`.
    ///
    /// Not every driver accepts a redundant change, so it is skipped.
    pub async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError> {
        if self.raw.auto_commit() != enabled {
            self.raw.set_auto_commit(enabled).await?;
        }
        Ok(())
    }

    /// Create a named savepoint. Requires the extended flavor.
    pub async fn savepoint(&mut self, name: &str) -> Result<(), DriverError> {
        self.require_extended()?;
        self.raw.savepoint(name).await
    }

    /// Roll back to a named savepoint. Requires the extended flavor.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), DriverError> {
        self.require_extended()?;
        self.raw.rollback_to_savepoint(name).await?;
        self.metadata.touch();
        Ok(())
    }

    fn require_extended(&self) -> Result<(), DriverError> {
        match self.flavor {
            ConnectionFlavor::Extended => Ok(()),
            ConnectionFlavor::Basic => Err(DriverError::Unsupported("savepoints")),
        }
    }

    /// Check whether the connection can no longer be handed out.
    ///
    /// Returns true if the connection is disposed or the driver reports it
    /// closed. Otherwise a connection that is past its idle age, has used up
    /// its returns, or fails its keep-alive probe disposes itself and also
    /// returns true.
    pub async fn is_closed(&mut self) -> bool {
        if self.disposed {
            return true;
        }
        if self.raw.is_closed() {
            self.metadata.mark_closed();
            return true;
        }

        let age = self.metadata.idle_for();
        let id = self.metadata.id;

        if let Some(limit) = self.retirement.max_idle_age {
            if age > limit {
                tracing::debug!(connection_id = id, idle = ?age, "retiring connection after idle age");
                self.dispose().await;
                return true;
            }
        }

        if self.uses_left == Some(0) {
            tracing::debug!(connection_id = id, "retiring connection after its last use");
            self.dispose().await;
            return true;
        }

        if age > self.keep_alive_age {
            if let Some(statement) = self.keep_alive.as_mut() {
                tracing::debug!(connection_id = id, idle = ?age, "pinging database after inactivity");
                if let Err(e) = self.raw.probe(statement).await {
                    tracing::debug!(connection_id = id, error = %e, "ping of connection failed");
                    self.dispose().await;
                    return true;
                }
            }
        }

        false
    }

    /// Whether the use-count has run out.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.uses_left == Some(0)
    }

    /// Reset transient state on return to the idle set.
    pub fn recycle(&mut self) {
        self.probe_error = None;
        if let Err(e) = self.raw.clear_warnings() {
            tracing::trace!(connection_id = self.metadata.id, error = %e, "could not clear warnings");
        }
        if let Some(uses) = self.uses_left.as_mut() {
            *uses = uses.saturating_sub(1);
        }
        self.metadata.mark_checkin();
    }

    /// Physically close the connection.
    ///
    /// Close errors are logged and ignored. Calling this again does nothing.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.keep_alive = None;
        self.metadata.mark_closed();

        if let Err(e) = self.raw.close().await {
            tracing::debug!(connection_id = self.metadata.id, error = %e, "could not close connection");
        }
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.metadata.state
    }
}

impl<C: Connection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.metadata.id)
            .field("flavor", &self.flavor)
            .field("state", &self.metadata.state)
            .field("keep_alive", &self.keep_alive.is_some())
            .field("uses_left", &self.uses_left)
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct Fake {
        closed: bool,
        fail_prepare: bool,
        fail_probe: bool,
        probes: u32,
        closes: u32,
        auto_commit: bool,
    }

    #[async_trait]
    impl Connection for Fake {
        type Statement = String;

        fn is_closed(&self) -> bool {
            self.closed
        }

        async fn prepare(&mut self, sql: &str) -> Result<String, DriverError> {
            if self.fail_prepare {
                return Err(DriverError::Query("prepare failed".into()));
            }
            Ok(sql.to_string())
        }

        async fn execute(&mut self, _sql: &str) -> Result<u64, DriverError> {
            Ok(1)
        }

        async fn probe(&mut self, _statement: &mut String) -> Result<(), DriverError> {
            self.probes += 1;
            if self.fail_probe {
                Err(DriverError::Closed)
            } else {
                Ok(())
            }
        }

        fn auto_commit(&self) -> bool {
            self.auto_commit
        }

        async fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError> {
            self.auto_commit = enabled;
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        fn clear_warnings(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), DriverError> {
            self.closes += 1;
            self.closed = true;
            Ok(())
        }
    }

    fn backdate(conn: &mut PooledConnection<Fake>, by: Duration) {
        conn.metadata_mut().last_used_at = Instant::now().checked_sub(by).unwrap();
    }

    async fn wrap(
        raw: Fake,
        keep_alive: KeepAliveConfig,
        retirement: RetirementPolicy,
    ) -> PooledConnection<Fake> {
        PooledConnection::new(1, raw, ConnectionFlavor::Basic, &keep_alive, retirement).await
    }

    #[test]
    fn test_flavor_detection() {
        assert_eq!(
            ConnectionFlavor::detect(Capabilities::default()),
            ConnectionFlavor::Basic
        );
        assert_eq!(
            ConnectionFlavor::detect(Capabilities {
                savepoints: true,
                holdability: true
            }),
            ConnectionFlavor::Extended
        );
    }

    #[tokio::test]
    async fn test_fresh_connection_is_open_without_probe() {
        let mut conn = wrap(
            Fake::default(),
            KeepAliveConfig::default(),
            RetirementPolicy::default(),
        )
        .await;
        assert!(conn.has_keep_alive());
        assert!(!conn.is_closed().await);
        assert_eq!(conn.raw().probes, 0);
    }

    #[tokio::test]
    async fn test_probe_after_keep_alive_age() {
        let keep_alive = KeepAliveConfig::new("SELECT 1", Duration::from_millis(10));
        let mut conn = wrap(Fake::default(), keep_alive, RetirementPolicy::never()).await;
        backdate(&mut conn, Duration::from_millis(50));

        assert!(!conn.is_closed().await);
        assert_eq!(conn.raw().probes, 1);
    }

    #[tokio::test]
    async fn test_failed_probe_disposes() {
        let keep_alive = KeepAliveConfig::new("SELECT 1", Duration::from_millis(10));
        let raw = Fake {
            fail_probe: true,
            ..Fake::default()
        };
        let mut conn = wrap(raw, keep_alive, RetirementPolicy::never()).await;
        backdate(&mut conn, Duration::from_millis(50));

        assert!(conn.is_closed().await);
        assert!(conn.is_disposed());
        assert_eq!(conn.raw().closes, 1);

        // Disposal happens once.
        conn.dispose().await;
        assert_eq!(conn.raw().closes, 1);
    }

    #[tokio::test]
    async fn test_prepare_failure_is_latched_until_recycle() {
        let raw = Fake {
            fail_prepare: true,
            ..Fake::default()
        };
        let mut conn = wrap(raw, KeepAliveConfig::default(), RetirementPolicy::default()).await;
        assert!(!conn.has_keep_alive());
        assert!(conn.probe_error().is_some());

        conn.recycle();
        assert!(conn.probe_error().is_none());
    }

    #[tokio::test]
    async fn test_idle_age_retirement() {
        let retirement = RetirementPolicy::never().max_idle_age(Some(Duration::from_secs(1)));
        let mut conn = wrap(Fake::default(), KeepAliveConfig::disabled(), retirement).await;
        backdate(&mut conn, Duration::from_secs(2));

        assert!(conn.is_closed().await);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_use_count_retirement() {
        let retirement = RetirementPolicy::never().max_uses(Some(2));
        let mut conn = wrap(Fake::default(), KeepAliveConfig::disabled(), retirement).await;

        conn.recycle();
        assert!(!conn.is_closed().await);
        conn.recycle();
        assert!(conn.is_exhausted());
        assert!(conn.is_closed().await);
    }

    #[tokio::test]
    async fn test_statement_ops_touch_last_used() {
        let mut conn = wrap(
            Fake::default(),
            KeepAliveConfig::disabled(),
            RetirementPolicy::never(),
        )
        .await;
        backdate(&mut conn, Duration::from_secs(30));

        conn.execute("UPDATE t SET x = 1").await.unwrap();
        assert!(conn.metadata().idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_savepoint_requires_extended_flavor() {
        let mut conn = wrap(
            Fake::default(),
            KeepAliveConfig::disabled(),
            RetirementPolicy::never(),
        )
        .await;
        assert!(matches!(
            conn.savepoint("sp1").await,
            Err(DriverError::Unsupported("savepoints"))
        ));
    }
}

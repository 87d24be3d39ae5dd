//! Resource-limiting connection pool.
//!
//! The pool keeps two logical partitions: an *idle* set of connections ready
//! for checkout and an *active* set checked out to callers. All bookkeeping
//! sits behind one short-lived lock; liveness probes, connection creation and
//! decommissioning always run outside it.
//!
//! ## Acquisition
//!
//! 1. An idle connection is taken and validated. If it fails validation it is
//!    decommissioned, its slot is freed, and acquisition starts over.
//! 2. With no idle connection and room under `max_connections` (or no limit),
//!    a new connection is created.
//! 3. At capacity, a non-strict pool creates an over-limit connection anyway.
//!    A strict non-blocking pool fails with
//!    [`PoolError::MaxConnectionsReached`]. A strict blocking pool waits for a
//!    release until the block timeout expires, then fails with
//!    [`PoolError::AcquisitionTimeout`].
//!
//! Waiters are not served in any particular order. A waiter that loses the
//! race for a released connection waits again within its remaining budget.
//!
//! Dropping a pending `get` gives back whatever slot it had reserved. A
//! connection it was validating is decommissioned in the background.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::PoolConfig;
use crate::connection::PooledConnection;
use crate::error::{IllegalState, PoolError};
use crate::factory::ConnectionFactory;
use crate::instrumentation::{PoolMetrics, PoolMetricsSnapshot, span_names};
use crate::trim;

type Conn<F> = PooledConnection<<F as ConnectionFactory>::Connection>;

/// A bounded pool of database connections.
///
/// Cloning the pool is cheap; clones share the same connections.
pub struct ResourceLimitingPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ResourceLimitingPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ResourceLimitingPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLimitingPool")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<Conn<F>>>,
    released: Notify,
    waiting: AtomicUsize,
    metrics: PoolMetrics,
    trimmer: Mutex<Option<JoinHandle<()>>>,
}

struct PoolState<T> {
    idle: VecDeque<T>,
    active: HashSet<u64>,
    /// Idle + active + connections being created or validated.
    size: usize,
    disposed: bool,
}

enum Step<F: ConnectionFactory> {
    Validate(Reservation<F>),
    Create(Reservation<F>),
    Wait,
}

impl<F: ConnectionFactory> ResourceLimitingPool<F> {
    /// Create a pool.
    ///
    /// When `trim_interval` is non-zero a background trim task is started on
    /// the current tokio runtime; calling this outside a runtime then fails
    /// with [`PoolError::Configuration`].
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let interval = config.trim_interval;
        let inner = Arc::new(PoolInner {
            factory,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: HashSet::new(),
                size: 0,
                disposed: false,
            }),
            released: Notify::new(),
            waiting: AtomicUsize::new(0),
            metrics: PoolMetrics::default(),
            trimmer: Mutex::new(None),
        });

        if !interval.is_zero() {
            let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                PoolError::Configuration("idle trimming requires a tokio runtime".into())
            })?;
            let task = trim::spawn(&handle, Arc::downgrade(&inner), interval);
            *inner.trimmer.lock() = Some(task);
        }

        tracing::debug!(
            max = inner.config.max_connections,
            strict = inner.config.max_strict,
            blocking = inner.config.blocking,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Get a connection from the pool.
    ///
    /// See the [module documentation](self) for the acquisition rules.
    pub async fn get(&self) -> Result<PoolGuard<F>, PoolError> {
        let blocking = self.inner.config.blocking;
        self.inner
            .acquire(blocking)
            .instrument(tracing::trace_span!(span_names::ACQUIRE))
            .await
    }

    /// Get a connection without waiting.
    ///
    /// Behaves like [`get`](Self::get) on a non-blocking pool, except that an
    /// exhausted pool yields `Ok(None)`.
    pub async fn try_get(&self) -> Result<Option<PoolGuard<F>>, PoolError> {
        match self.inner.acquire(false).await {
            Ok(guard) => Ok(Some(guard)),
            Err(PoolError::MaxConnectionsReached { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Return a connection to the pool.
    ///
    /// A guard that belongs to a different pool is left alone: a warning is
    /// logged and the guard goes back to its own pool when dropped.
    pub async fn put(&self, guard: PoolGuard<F>) {
        if !Arc::ptr_eq(&self.inner, &guard.pool) {
            tracing::warn!(
                connection_id = guard.id(),
                "released connection is not active in this pool, ignoring"
            );
            return;
        }
        guard.release().await;
    }

    /// Remove idle connections unused for longer than the trim interval.
    ///
    /// Never trims below `min_connections` and never touches active
    /// connections. Returns the number of connections removed.
    pub async fn trim(&self) -> usize {
        self.inner.trim().await
    }

    /// Open idle connections until the pool holds `min_connections`.
    ///
    /// Returns the number of connections opened.
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        self.inner.warm_up().await
    }

    /// Dispose of the pool.
    ///
    /// Idle connections are decommissioned immediately; active connections
    /// are decommissioned as their guards are released. Blocked and later
    /// calls to `get` fail with [`IllegalState::Disposed`]. Calling this
    /// again does nothing.
    pub async fn dispose(&self) {
        self.inner
            .dispose()
            .instrument(tracing::debug_span!(span_names::DISPOSE))
            .await;
    }

    /// Check if the pool has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            active: state.active.len(),
            size: state.size,
            max: self.inner.config.max_connections,
            waiting: self.inner.waiting.load(Ordering::Relaxed),
        }
    }

    /// Get the lifecycle counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the connection factory.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }
}

impl<F: ConnectionFactory> PoolInner<F> {
    pub(crate) fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    async fn acquire(self: &Arc<Self>, blocking: bool) -> Result<PoolGuard<F>, PoolError> {
        let deadline = self
            .config
            .wait_limit()
            .map(|limit| tokio::time::Instant::now() + limit);

        loop {
            match self.next_step(blocking)? {
                Step::Validate(reservation) => {
                    if let Some(conn) = reservation.validate().await {
                        return self.activate(conn).await;
                    }

                    if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                        self.metrics.record_timeout();
                        return Err(PoolError::AcquisitionTimeout(self.config.block_timeout));
                    }
                }
                Step::Create(reservation) => {
                    let conn = self.open().await?;
                    reservation.keep();
                    return self.activate(conn).await;
                }
                Step::Wait => {
                    let notified = self.released.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    // A release between `next_step` and `enable` sent no
                    // wakeup to this caller; look again before sleeping.
                    if self.can_proceed() {
                        continue;
                    }

                    let _waiting = WaitingGuard::new(&self.waiting);
                    tracing::trace!("pool exhausted, waiting for a released connection");

                    let woken = match deadline {
                        Some(deadline) => tokio::time::timeout_at(deadline, notified)
                            .await
                            .is_ok(),
                        None => {
                            notified.await;
                            true
                        }
                    };

                    if !woken {
                        tracing::debug!(
                            waited = ?self.config.block_timeout,
                            "timed out waiting for a connection"
                        );
                        self.metrics.record_timeout();
                        return Err(PoolError::AcquisitionTimeout(self.config.block_timeout));
                    }
                }
            }
        }
    }

    fn can_proceed(&self) -> bool {
        let state = self.state.lock();
        state.disposed || !state.idle.is_empty() || self.config.has_capacity(state.size)
    }

    fn next_step(self: &Arc<Self>, blocking: bool) -> Result<Step<F>, PoolError> {
        let mut state = self.state.lock();

        if state.disposed {
            return Err(IllegalState::Disposed.into());
        }
        if let Some(conn) = state.idle.pop_back() {
            return Ok(Step::Validate(Reservation::holding(self, conn)));
        }
        if self.config.has_capacity(state.size) {
            state.size += 1;
            return Ok(Step::Create(Reservation::new(self)));
        }
        if !self.config.max_strict {
            state.size += 1;
            tracing::debug!(size = state.size, "creating connection over the pool maximum");
            return Ok(Step::Create(Reservation::new(self)));
        }
        if !blocking {
            return Err(PoolError::MaxConnectionsReached {
                max: self.config.max_connections,
            });
        }
        Ok(Step::Wait)
    }

    /// Create a connection for a slot the caller holds a [`Reservation`] for.
    ///
    /// The reservation frees the slot if this fails or is cancelled.
    async fn open(&self) -> Result<Conn<F>, PoolError> {
        let mut conn = self.factory.create().await?;
        self.metrics.record_created();

        if let Err(e) = conn.set_auto_commit(self.config.auto_commit).await {
            self.retire(conn).await;
            return Err(PoolError::ConnectionCreation(e));
        }
        Ok(conn)
    }

    async fn activate(self: &Arc<Self>, mut conn: Conn<F>) -> Result<PoolGuard<F>, PoolError> {
        let disposed = {
            let mut state = self.state.lock();
            if state.disposed {
                state.size -= 1;
                true
            } else {
                state.active.insert(conn.id());
                false
            }
        };

        if disposed {
            self.retire(conn).await;
            return Err(IllegalState::Disposed.into());
        }

        conn.metadata_mut().mark_checkout();
        self.metrics.record_checkout();
        tracing::trace!(connection_id = conn.id(), "got connection from the pool");

        Ok(PoolGuard {
            connection: Some(conn),
            pool: Arc::clone(self),
        })
    }

    /// Move a connection from active back to idle.
    ///
    /// Returns the connection if it must be decommissioned instead, which
    /// happens when it has used up its returns or the pool is disposed.
    fn checkin(&self, mut conn: Conn<F>) -> Option<Conn<F>> {
        conn.recycle();
        let id = conn.id();

        let mut state = self.state.lock();
        if !state.active.remove(&id) {
            tracing::warn!(connection_id = id, "released connection was not active in this pool");
            return Some(conn);
        }

        if state.disposed || conn.is_exhausted() {
            state.size -= 1;
            drop(state);
            self.released.notify_one();
            return Some(conn);
        }

        state.idle.push_back(conn);
        drop(state);

        tracing::trace!(connection_id = id, "put connection back into the pool");
        self.released.notify_one();
        None
    }

    fn detach(&self, id: u64) {
        let mut state = self.state.lock();
        if state.active.remove(&id) {
            state.size -= 1;
            drop(state);
            self.released.notify_one();
        }
    }

    fn free_slot(&self) {
        {
            let mut state = self.state.lock();
            state.size = state.size.saturating_sub(1);
        }
        self.released.notify_one();
    }

    async fn retire(&self, conn: Conn<F>) {
        self.metrics.record_decommissioned();
        self.factory.decommission(conn).await;
    }

    /// Decommission `conn` on a background task, for callers that cannot wait.
    fn retire_detached(self: &Arc<Self>, conn: Conn<F>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move { pool.retire(conn).await });
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = conn.id(),
                    "no runtime to decommission connection, dropping it"
                );
            }
        }
    }

    pub(crate) async fn trim(&self) -> usize {
        let interval = self.config.trim_interval;
        let min = self.config.min_connections;

        let expired: Vec<Conn<F>> = {
            let mut state = self.state.lock();
            if state.disposed {
                return 0;
            }

            let PoolState { idle, size, .. } = &mut *state;
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(idle.len());
            // Oldest first, so the freshest connections survive the floor.
            for conn in idle.drain(..) {
                if *size > min && conn.metadata().idle_for() >= interval {
                    *size -= 1;
                    expired.push(conn);
                } else {
                    kept.push_back(conn);
                }
            }
            *idle = kept;
            expired
        };

        let count = expired.len();
        if count > 0 {
            async {
                for conn in expired {
                    self.retire(conn).await;
                }
                tracing::debug!(trimmed = count, "trimmed idle connections");
            }
            .instrument(tracing::debug_span!(span_names::TRIM))
            .await;
            self.metrics.record_trimmed(count as u64);
        }
        count
    }

    async fn warm_up(self: &Arc<Self>) -> Result<usize, PoolError> {
        let mut opened = 0;
        loop {
            let reservation = {
                let mut state = self.state.lock();
                if state.disposed {
                    return Err(IllegalState::Disposed.into());
                }
                if state.size >= self.config.min_connections
                    || !self.config.has_capacity(state.size)
                {
                    break;
                }
                state.size += 1;
                Reservation::new(self)
            };

            let mut conn = self.open().await?;
            reservation.keep();
            conn.metadata_mut().mark_checkin();

            let rejected = {
                let mut state = self.state.lock();
                if state.disposed {
                    state.size -= 1;
                    Some(conn)
                } else {
                    state.idle.push_back(conn);
                    None
                }
            };

            if let Some(conn) = rejected {
                self.retire(conn).await;
                return Err(IllegalState::Disposed.into());
            }

            self.released.notify_one();
            opened += 1;
        }

        if opened > 0 {
            tracing::debug!(opened, "pool warmed up");
        }
        Ok(opened)
    }

    async fn dispose(&self) {
        let idle: Vec<Conn<F>> = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.size -= idle.len();
            idle
        };

        if let Some(task) = self.trimmer.lock().take() {
            task.abort();
        }
        self.released.notify_waiters();

        let count = idle.len();
        for conn in idle {
            self.retire(conn).await;
        }
        self.factory.shutdown().await;

        tracing::info!(decommissioned = count, "connection pool disposed");
    }
}

impl<F: ConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        if let Some(task) = self.trimmer.get_mut().take() {
            task.abort();
        }
    }
}

/// A slot counted in `size` for a connection that is neither idle nor active.
///
/// Covers connections being created and idle connections being validated.
/// Dropping an unkept reservation frees the slot and decommissions the
/// connection it holds, so a cancelled `get` leaves the pool as it found it.
struct Reservation<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    connection: Option<Conn<F>>,
    kept: bool,
}

impl<F: ConnectionFactory> Reservation<F> {
    fn new(pool: &Arc<PoolInner<F>>) -> Self {
        Self {
            pool: Arc::clone(pool),
            connection: None,
            kept: false,
        }
    }

    fn holding(pool: &Arc<PoolInner<F>>, conn: Conn<F>) -> Self {
        Self {
            pool: Arc::clone(pool),
            connection: Some(conn),
            kept: false,
        }
    }

    /// The slot now belongs to a connection in the idle or active set.
    fn keep(mut self) {
        self.kept = true;
    }

    /// Validate the held idle connection.
    ///
    /// A valid connection is handed back with the slot still counted for it.
    /// An invalid one is decommissioned and its slot freed.
    async fn validate(mut self) -> Option<Conn<F>> {
        let conn = self.connection.as_mut()?;
        conn.metadata_mut().mark_checking();
        if !conn.is_closed().await {
            self.kept = true;
            return self.connection.take();
        }

        tracing::debug!(connection_id = conn.id(), "discarding invalid idle connection");
        self.pool.metrics.record_validation_failure();

        let conn = self.connection.take()?;
        self.kept = true;
        self.pool.free_slot();
        self.pool.retire(conn).await;
        None
    }
}

impl<F: ConnectionFactory> Drop for Reservation<F> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        self.pool.free_slot();
        if let Some(conn) = self.connection.take() {
            tracing::debug!(connection_id = conn.id(), "checkout abandoned during validation");
            self.pool.retire_detached(conn);
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub idle: usize,
    /// Number of connections currently checked out.
    pub active: usize,
    /// Total number of connections, including ones being created or validated.
    pub size: usize,
    /// Maximum allowed connections. Zero means unbounded.
    pub max: usize,
    /// Number of callers blocked waiting for a connection.
    pub waiting: usize,
}

/// A connection checked out from a [`ResourceLimitingPool`].
///
/// Dereferences to the [`PooledConnection`]. When dropped, the connection is
/// returned to the pool; use [`release`](Self::release) to return it and wait
/// for any decommissioning to finish.
pub struct PoolGuard<F: ConnectionFactory> {
    connection: Option<Conn<F>>,
    pool: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> PoolGuard<F> {
    /// Return the connection to its pool.
    pub async fn release(mut self) {
        if let Some(conn) = self.connection.take() {
            if let Some(dead) = self.pool.checkin(conn) {
                self.pool
                    .retire(dead)
                    .instrument(tracing::trace_span!(span_names::RELEASE))
                    .await;
            }
        }
    }

    /// Take the connection out of the pool.
    ///
    /// The pool stops counting it and will not return or close it.
    #[allow(clippy::expect_used)]
    pub fn detach(mut self) -> Conn<F> {
        let conn = self.connection.take().expect("connection taken");
        self.pool.detach(conn.id());
        conn
    }
}

impl<F: ConnectionFactory> Deref for PoolGuard<F> {
    type Target = Conn<F>;

    #[allow(clippy::expect_used)]
    fn deref(&self) -> &Self::Target {
        // Only `release` and `detach` take the connection, and both consume the guard.
        self.connection.as_ref().expect("connection taken")
    }
}

impl<F: ConnectionFactory> DerefMut for PoolGuard<F> {
    #[allow(clippy::expect_used)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("connection taken")
    }
}

impl<F: ConnectionFactory> Drop for PoolGuard<F> {
    fn drop(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        if let Some(dead) = self.pool.checkin(conn) {
            self.pool.retire_detached(dead);
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PoolGuard<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard")
            .field("connection", &self.connection)
            .finish()
    }
}

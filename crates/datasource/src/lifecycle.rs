//! Connection lifecycle tracking.
//!
//! A pooled connection moves through
//! `Created -> Idle -> InUse -> Idle -> ... -> Closed`. A failed liveness
//! check moves it straight to `Closed` from either `Idle` or `InUse`; the
//! pool then creates a replacement if one is still needed.

use std::time::{Duration, Instant};

/// Connection state tracked by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connection was just opened by the factory.
    Created,
    /// Connection is idle and available for use.
    Idle,
    /// Connection is checked out to a caller.
    InUse,
    /// Connection is being validated before checkout.
    Checking,
    /// Connection is physically closed and must not be reused.
    Closed,
}

impl ConnectionState {
    /// Check if the connection is available for checkout.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Created | Self::Idle)
    }

    /// Check if the connection is currently owned by a caller or a check.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::InUse | Self::Checking)
    }

    /// Check if the connection should be removed from the pool.
    #[must_use]
    pub fn should_remove(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Metadata about a pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    /// Unique identifier for this connection.
    pub id: u64,
    /// When the connection was created.
    pub created_at: Instant,
    /// When the connection was last used or returned.
    pub last_used_at: Instant,
    /// Number of times the connection has been checked out.
    pub checkout_count: u64,
    /// Current state of the connection.
    pub state: ConnectionState,
}

impl ConnectionMetadata {
    /// Create metadata for a new connection.
    pub fn new(id: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used_at: now,
            checkout_count: 0,
            state: ConnectionState::Created,
        }
    }

    /// Time since the connection was last used.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// Check if the connection has been idle longer than `limit`.
    #[must_use]
    pub fn is_idle_expired(&self, limit: Duration) -> bool {
        self.idle_for() > limit
    }

    /// Record a statement-level use.
    pub fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Mark the connection as being validated.
    pub fn mark_checking(&mut self) {
        self.state = ConnectionState::Checking;
    }

    /// Mark the connection as checked out.
    pub fn mark_checkout(&mut self) {
        self.checkout_count += 1;
        self.state = ConnectionState::InUse;
    }

    /// Mark the connection as returned to idle.
    pub fn mark_checkin(&mut self) {
        self.last_used_at = Instant::now();
        self.state = ConnectionState::Idle;
    }

    /// Mark the connection as physically closed.
    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

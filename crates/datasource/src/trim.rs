//! Background idle trimmer.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::factory::ConnectionFactory;
use crate::pool::PoolInner;

/// Start the trim task for a pool.
///
/// The task holds only a weak reference, so it stops on its own once the
/// pool is dropped. `dispose` aborts it.
pub(crate) fn spawn<F: ConnectionFactory>(
    handle: &Handle,
    pool: Weak<PoolInner<F>>,
    interval: Duration,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if pool.is_disposed() {
                break;
            }
            pool.trim().await;
        }

        tracing::trace!("idle trimmer stopped");
    })
}

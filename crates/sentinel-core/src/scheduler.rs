//! C7 — the two periodic tickers that drive active probing.
//!
//! Each tick acquires the shared period lock before running so that,
//! across the whole fleet of workers sharing a store, only one of them
//! actually issues probes for a given tick (§4.7). Acquisition uses a
//! single zero-wait attempt — a contended tick is a no-op, not a queued
//! retry, because the next tick is only `sub_interval` away regardless.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::engine::Engine;
use crate::health::InternalHealth;
use crate::lock::{with_lock, LockOptions};
use crate::prober::active_check_targets;
use crate::target::Target;

const MAX_SUB_INTERVAL: Duration = Duration::from_millis(500);

fn sub_interval(period: Duration) -> Duration {
    period.min(MAX_SUB_INTERVAL)
}

pub(crate) async fn run_healthy_tick(engine: Arc<Engine>) {
    run_tick(engine, "healthy", |h| matches!(h, InternalHealth::Healthy | InternalHealth::MostlyHealthy)).await
}

pub(crate) async fn run_unhealthy_tick(engine: Arc<Engine>) {
    run_tick(engine, "unhealthy", |h| matches!(h, InternalHealth::Unhealthy | InternalHealth::MostlyUnhealthy)).await
}

async fn run_tick(engine: Arc<Engine>, which: &'static str, matches_bucket: impl Fn(InternalHealth) -> bool) {
    let period = if which == "healthy" {
        engine.config().checks.active.healthy_interval()
    } else {
        engine.config().checks.active.unhealthy_interval()
    };

    if period.is_zero() {
        debug!(which, "tick disabled (interval=0)");
        return;
    }

    let mut ticker = tokio::time::interval(sub_interval(period));
    let mut elapsed = Duration::ZERO;

    loop {
        ticker.tick().await;
        elapsed += sub_interval(period);
        if elapsed < period {
            continue;
        }
        elapsed = Duration::ZERO;

        let lock_key = engine.codec.keyspace().period_lock(which);
        let outcome = with_lock(engine.lock.as_ref(), &lock_key, LockOptions::try_once(period), || async {
            let targets: Vec<Target> = {
                let index = engine.index.read().await;
                index
                    .list()
                    .into_iter()
                    .filter(|(_, h)| matches_bucket(*h))
                    .map(|(t, _)| t)
                    .collect()
            };
            active_check_targets(&engine, targets).await;
        })
        .await;

        if outcome.ran().is_none() {
            debug!(which, "period lock contended, skipping this tick");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_interval_caps_at_half_a_second() {
        assert_eq!(sub_interval(Duration::from_secs(5)), Duration::from_millis(500));
        assert_eq!(sub_interval(Duration::from_millis(200)), Duration::from_millis(200));
    }
}

//! The `Engine`: ties the shared-store codec (C1), locking (C2), target
//! registry (C3), counter-threshold state machine (C4), passive report
//! API (C5) and event fanout (C8) together behind one handle. The active
//! prober (C6) and scheduler (C7) live in their own modules and operate
//! on an `Arc<Engine>`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, SentinelError};
use crate::events::{EventBus, HealthEvent};
use crate::health::{decide, InternalHealth, ReportKind};
use crate::lock::{with_lock, LockOptions, LockOutcome};
use crate::registry::TargetIndex;
use crate::scheduler;
use crate::store::{Codec, Keyspace, NamedLock, SharedStore};
use crate::target::{target_key, Selector, Target, TargetList};

struct SchedulerHandles {
    healthy: JoinHandle<()>,
    unhealthy: JoinHandle<()>,
}

pub struct Engine {
    pub(crate) config: Config,
    pub(crate) codec: Codec,
    pub(crate) lock: Arc<dyn NamedLock>,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) index: RwLock<TargetIndex>,
    status_ver: AtomicU64,
    pub(crate) worker_exiting: AtomicBool,
    scheduler: std::sync::Mutex<Option<SchedulerHandles>>,
}

impl Engine {
    /// Validates `config`, wires the store/lock/bus collaborators, and
    /// spawns this worker's own event-bus subscriber. The subscriber holds
    /// only a [`std::sync::Weak`] reference back to the engine, so it
    /// winds down on its own once the last `Arc<Engine>` is dropped rather
    /// than keeping the engine alive.
    pub fn new(
        config: Config,
        store: Arc<dyn SharedStore>,
        lock: Arc<dyn NamedLock>,
        bus: Arc<dyn EventBus>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let keyspace = Keyspace::new(config.shm_name.clone(), config.name.clone());
        let codec = Codec::new(store, keyspace);

        let engine = Arc::new(Self {
            config,
            codec,
            lock,
            bus,
            index: RwLock::new(TargetIndex::new()),
            status_ver: AtomicU64::new(0),
            worker_exiting: AtomicBool::new(false),
            scheduler: std::sync::Mutex::new(None),
        });

        let weak = Arc::downgrade(&engine);
        let mut subscription = engine.bus.subscribe();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match weak.upgrade() {
                    Some(engine) => engine.handle_event(event).await,
                    None => break,
                }
            }
        });

        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status_ver(&self) -> u64 {
        self.status_ver.load(Ordering::SeqCst)
    }

    // ---- C3: target registry --------------------------------------

    /// Adds `(ip, port, hostname)`, no-op if already present (does not
    /// reset state). `healthy_init` defaults to `true`. State is written
    /// before the list is appended, per §4.3's ordering requirement.
    pub async fn add_target(
        &self,
        ip: &str,
        port: u16,
        hostname: Option<&str>,
        hostheader: Option<&str>,
        healthy_init: Option<bool>,
    ) -> Result<()> {
        let ip = ip.to_string();
        let hostname_owned = hostname.map(String::from);
        let hostheader_owned = hostheader.map(String::from);

        let outcome = with_lock(
            self.lock.as_ref(),
            &self.codec.keyspace().target_list_lock(),
            LockOptions::default(),
            || async {
                let mut list = self.codec.get_target_list()?;
                if list.contains(&ip, port, hostname_owned.as_deref()) {
                    return Ok(());
                }

                let key = target_key(&ip, port, hostname_owned.as_deref());
                let initial = if healthy_init.unwrap_or(true) {
                    InternalHealth::Healthy
                } else {
                    InternalHealth::Unhealthy
                };
                self.codec.set_state_by_key(&key, initial as i64);

                let target = Target::new(ip.clone(), port, hostname_owned.clone(), hostheader_owned.clone());
                list.push(target.clone());
                self.codec.put_target_list(&list)?;

                {
                    let mut index = self.index.write().await;
                    index.insert(target.clone(), initial);
                }
                self.post_verdict(initial, target);
                Ok(())
            },
        )
        .await;

        flatten(outcome, self.codec.keyspace().target_list_lock())
    }

    /// Removes `(ip, port, hostname)`: mutates the list first, then
    /// deletes state/counter, then posts `remove`, per §4.3's ordering
    /// requirement (list before state).
    pub async fn remove_target(&self, ip: &str, port: u16, hostname: Option<&str>) -> Result<()> {
        let ip = ip.to_string();
        let hostname_owned = hostname.map(String::from);

        let outcome = with_lock(
            self.lock.as_ref(),
            &self.codec.keyspace().target_list_lock(),
            LockOptions::default(),
            || async {
                let mut list = self.codec.get_target_list()?;
                list.remove(&ip, port, hostname_owned.as_deref());
                self.codec.put_target_list(&list)?;

                let key = target_key(&ip, port, hostname_owned.as_deref());
                self.codec.delete_state(&key);
                self.codec.delete_counter(&key);

                {
                    let mut index = self.index.write().await;
                    index.remove(&ip, port, hostname_owned.as_deref());
                }
                self.bus.post(HealthEvent::Removed {
                    ip: ip.clone(),
                    port,
                    hostname: hostname_owned.clone(),
                });
                Ok(())
            },
        )
        .await;

        flatten(outcome, self.codec.keyspace().target_list_lock())
    }

    /// Empties the list, deletes every target's state/counter, posts
    /// `clear`, and empties the local index synchronously.
    pub async fn clear(&self) -> Result<()> {
        let outcome = with_lock(
            self.lock.as_ref(),
            &self.codec.keyspace().target_list_lock(),
            LockOptions::default(),
            || async {
                let old = self.codec.get_target_list()?;
                self.codec.put_target_list(&TargetList::default())?;
                for target in &old.0 {
                    let key = target_key(&target.ip, target.port, target.hostname.as_deref());
                    self.codec.delete_state(&key);
                    self.codec.delete_counter(&key);
                }
                {
                    let mut index = self.index.write().await;
                    index.clear();
                }
                self.bus.post(HealthEvent::Cleared);
                Ok(())
            },
        )
        .await;

        flatten(outcome, self.codec.keyspace().target_list_lock())
    }

    /// Reads the projected boolean verdict from the per-worker index;
    /// `None` means the target is not known locally.
    pub async fn get_target_status(&self, ip: &str, port: u16, hostname: Option<&str>) -> Option<bool> {
        let index = self.index.read().await;
        index.get_health(ip, port, hostname).map(InternalHealth::as_bool)
    }

    // ---- C5: passive report API ------------------------------------

    pub async fn report_failure(&self, ip: &str, port: u16, hostname: Option<&str>) -> Result<()> {
        let passive = &self.config.checks.passive;
        let (selector, threshold) = match passive.r#type {
            crate::config::CheckType::Tcp => (Selector::Tcp, passive.unhealthy.tcp_failures),
            _ => (Selector::Http, passive.unhealthy.http_failures),
        };
        self.apply_report(ip, port, hostname, ReportKind::Unhealthy, selector, threshold).await
    }

    pub async fn report_success(&self, ip: &str, port: u16, hostname: Option<&str>) -> Result<()> {
        let threshold = self.config.checks.passive.healthy.successes;
        self.apply_report(ip, port, hostname, ReportKind::Healthy, Selector::Success, threshold).await
    }

    pub async fn report_tcp_failure(&self, ip: &str, port: u16, hostname: Option<&str>) -> Result<()> {
        let threshold = self.config.checks.passive.unhealthy.tcp_failures;
        self.apply_report(ip, port, hostname, ReportKind::Unhealthy, Selector::Tcp, threshold).await
    }

    pub async fn report_timeout(&self, ip: &str, port: u16, hostname: Option<&str>) -> Result<()> {
        let threshold = self.config.checks.passive.unhealthy.timeouts;
        self.apply_report(ip, port, hostname, ReportKind::Unhealthy, Selector::Timeout, threshold).await
    }

    /// `code = None` is treated as `0` (open question: preserved from the
    /// source rather than special-cased — a nil status and a literal `0`
    /// both route through the unhealthy branch, or are ignored if neither
    /// set claims `0`).
    pub async fn report_http_status(&self, ip: &str, port: u16, hostname: Option<&str>, code: Option<u16>) -> Result<()> {
        let code = code.unwrap_or(0);
        let passive = &self.config.checks.passive;

        if passive.healthy.http_statuses.as_set().contains(&code) {
            let threshold = passive.healthy.successes;
            self.apply_report(ip, port, hostname, ReportKind::Healthy, Selector::Success, threshold).await
        } else if passive.unhealthy.http_statuses.as_set().contains(&code) || code == 0 {
            let threshold = passive.unhealthy.http_failures;
            self.apply_report(ip, port, hostname, ReportKind::Unhealthy, Selector::Http, threshold).await
        } else {
            Ok(())
        }
    }

    /// Core C4 evaluation shared by every passive/active entry point.
    pub(crate) async fn apply_report(
        &self,
        ip: &str,
        port: u16,
        hostname: Option<&str>,
        report: ReportKind,
        selector: Selector,
        threshold: u8,
    ) -> Result<()> {
        if threshold == 0 {
            return Ok(());
        }

        let (target, current) = {
            let index = self.index.read().await;
            match (index.get(ip, port, hostname), index.get_health(ip, port, hostname)) {
                (Some(t), Some(h)) => (t.clone(), h),
                _ => {
                    warn!(ip, port, ?hostname, "report for unknown target, dropping (sync lag)");
                    return Ok(());
                }
            }
        };

        if current.is_saturated_same(report) {
            return Ok(());
        }

        let key = target_key(ip, port, hostname);
        let outcome = with_lock(self.lock.as_ref(), &self.codec.keyspace().target_lock(&key), LockOptions::default(), || async {
            let word = self.codec.incr_counter(&key, selector);
            let ctr = crate::target::CounterWord(word).extract(selector);

            // Re-read current health under the lock: another worker's
            // event may have moved us since the fast-path check above.
            let current = self
                .index
                .read()
                .await
                .get_health(ip, port, hostname)
                .unwrap_or(current);

            let decision = decide(current, ctr, threshold, word, report, selector);
            if decision.new_word != word {
                self.codec.set_counter_word(&key, decision.new_word);
            }
            if let Some(new_health) = decision.new_health {
                self.codec.set_state_by_key(&key, new_health as i64);
                // Index update and status_ver bookkeeping happen only in
                // the bus subscriber's `fold_verdict` (§9: "the bus-
                // subscriber update is the only mutator of the per-worker
                // index"), including for this very event once it comes
                // back around to us.
                self.post_verdict(new_health, target.clone());
            }
            Ok::<(), SentinelError>(())
        })
        .await;

        flatten(outcome, key)
    }

    // ---- forced overrides -------------------------------------------

    /// Skips the state machine: zeroes the counter, writes the verdict
    /// directly, posts the event.
    pub async fn set_target_status(&self, ip: &str, port: u16, hostname: Option<&str>, healthy: bool) -> Result<()> {
        let key = target_key(ip, port, hostname);
        let new_health = if healthy { InternalHealth::Healthy } else { InternalHealth::Unhealthy };

        let target = {
            let index = self.index.read().await;
            index.get(ip, port, hostname).cloned()
        };
        let target = match target {
            Some(t) => t,
            None => {
                debug!(ip, port, ?hostname, "set_target_status for unknown target, hostheader will be unset");
                Target::new(ip, port, hostname.map(String::from), None)
            }
        };

        let outcome = with_lock(self.lock.as_ref(), &self.codec.keyspace().target_lock(&key), LockOptions::default(), || async {
            self.codec.clear_counter(&key);
            self.codec.set_state_by_key(&key, new_health as i64);
            // See `apply_report`: the index is mutated only by the bus
            // subscriber, never synchronously here.
            self.post_verdict(new_health, target.clone());
            Ok::<(), SentinelError>(())
        })
        .await;

        flatten(outcome, key)
    }

    /// Bulk forced override across every target sharing `(hostname,
    /// port)`; aggregates per-target errors into one message.
    pub async fn set_all_target_statuses_for_hostname(&self, hostname: &str, port: u16, healthy: bool) -> Result<()> {
        let matching: Vec<Target> = {
            let index = self.index.read().await;
            index
                .list()
                .into_iter()
                .map(|(t, _)| t)
                .filter(|t| t.port == port && t.key_hostname() == hostname)
                .collect()
        };

        let mut errors = Vec::new();
        for target in matching {
            if let Err(e) = self
                .set_target_status(&target.ip, target.port, target.hostname.as_deref(), healthy)
                .await
            {
                errors.push(format!("{}:{}: {e}", target.ip, target.port));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SentinelError::Store(errors.join("; ")))
        }
    }

    fn post_verdict(&self, health: InternalHealth, target: Target) {
        let event = match health {
            InternalHealth::Healthy => HealthEvent::Healthy { target },
            InternalHealth::Unhealthy => HealthEvent::Unhealthy { target },
            InternalHealth::MostlyHealthy => HealthEvent::MostlyHealthy { target },
            InternalHealth::MostlyUnhealthy => HealthEvent::MostlyUnhealthy { target },
        };
        self.bus.post(event);
    }

    // ---- C8: event-bus subscriber ------------------------------------

    async fn handle_event(&self, event: HealthEvent) {
        match event {
            HealthEvent::Healthy { target } => self.fold_verdict(target, InternalHealth::Healthy).await,
            HealthEvent::Unhealthy { target } => self.fold_verdict(target, InternalHealth::Unhealthy).await,
            HealthEvent::MostlyHealthy { target } => self.fold_verdict(target, InternalHealth::MostlyHealthy).await,
            HealthEvent::MostlyUnhealthy { target } => self.fold_verdict(target, InternalHealth::MostlyUnhealthy).await,
            HealthEvent::Removed { ip, port, hostname } => {
                let mut index = self.index.write().await;
                if index.get(&ip, port, hostname.as_deref()).is_none() {
                    warn!(ip, port, ?hostname, "remove event for unknown target");
                } else {
                    index.remove(&ip, port, hostname.as_deref());
                }
            }
            HealthEvent::Cleared => {
                self.index.write().await.clear();
            }
        }
    }

    async fn fold_verdict(&self, target: Target, new_health: InternalHealth) {
        let mut index = self.index.write().await;
        let prev_bool = index
            .get_health(&target.ip, target.port, target.hostname.as_deref())
            .map(InternalHealth::as_bool);

        index.insert(target, new_health);

        if prev_bool != Some(new_health.as_bool()) {
            self.status_ver.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ---- C7: scheduler lifecycle --------------------------------------

    /// Starts the healthy/unhealthy tickers. Refuses if already running.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.scheduler.lock().expect("scheduler mutex poisoned");
        if guard.is_some() {
            return Err(SentinelError::Config("scheduler already running".into()));
        }
        self.worker_exiting.store(false, Ordering::SeqCst);
        let healthy = tokio::spawn(scheduler::run_healthy_tick(Arc::clone(self)));
        let unhealthy = tokio::spawn(scheduler::run_unhealthy_tick(Arc::clone(self)));
        *guard = Some(SchedulerHandles { healthy, unhealthy });
        Ok(())
    }

    /// Cancels both tickers. In-flight probes finish naturally because
    /// `worker_exiting` only gates the *next* item in a probe package.
    pub fn stop(&self) {
        self.worker_exiting.store(true, Ordering::SeqCst);
        if let Some(handles) = self.scheduler.lock().expect("scheduler mutex poisoned").take() {
            handles.healthy.abort();
            handles.unhealthy.abort();
        }
    }
}

fn flatten(outcome: LockOutcome<Result<()>>, key: String) -> Result<()> {
    match outcome {
        LockOutcome::Ran(result) => result,
        LockOutcome::Deferred => Err(SentinelError::LockTimeout(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::InProcessBus;
    use crate::store::MemoryStore;

    fn engine_deps() -> (Arc<dyn SharedStore>, Arc<dyn NamedLock>, Arc<dyn EventBus>) {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcessBus::new(256));
        (store.clone(), store, bus)
    }

    async fn test_engine(mut config: Config) -> Arc<Engine> {
        config.checks.passive.unhealthy.tcp_failures = 2;
        let (store, lock, bus) = engine_deps();
        Engine::new(config, store, lock, bus).unwrap()
    }

    /// The index is updated only by the bus subscriber task (§9), so tests
    /// that mutate health and then read it back through the index must
    /// give that task a turn to run first.
    async fn settle() {
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn add_target_is_idempotent() {
        let engine = test_engine(Config::new("e1", "shm")).await;
        engine.add_target("10.0.0.1", 80, None, None, None).await.unwrap();
        engine.add_target("10.0.0.1", 80, None, None, None).await.unwrap();
        let list = engine.codec.get_target_list().unwrap();
        assert_eq!(list.0.len(), 1);
    }

    #[tokio::test]
    async fn rise_from_unhealthy_flips_after_fifth_success() {
        let mut config = Config::new("e2", "shm");
        config.checks.passive.healthy.successes = 5;
        let engine = test_engine(config).await;
        engine.add_target("10.0.0.1", 80, None, None, Some(false)).await.unwrap();

        for _ in 0..4 {
            engine.report_success("10.0.0.1", 80, None).await.unwrap();
        }
        settle().await;
        assert_eq!(engine.get_target_status("10.0.0.1", 80, None).await, Some(false));

        engine.report_success("10.0.0.1", 80, None).await.unwrap();
        settle().await;
        assert_eq!(engine.get_target_status("10.0.0.1", 80, None).await, Some(true));
        assert_eq!(engine.status_ver(), 1);
    }

    #[tokio::test]
    async fn masked_counter_moves_healthy_to_mostly_healthy() {
        let mut config = Config::new("e3", "shm");
        config.checks.passive.unhealthy.http_failures = 5;
        let engine = test_engine(config).await;
        engine.add_target("10.0.0.1", 80, None, None, Some(true)).await.unwrap();

        engine.report_http_status("10.0.0.1", 80, None, Some(500)).await.unwrap();
        settle().await;

        let key = target_key("10.0.0.1", 80, None);
        let word = engine.codec.get_counter_word(&key);
        assert_eq!(crate::target::CounterWord(word).extract(Selector::Success), 0);
        assert_eq!(crate::target::CounterWord(word).extract(Selector::Http), 1);
        // still projects healthy: mostly_healthy is in the healthy set.
        assert_eq!(engine.get_target_status("10.0.0.1", 80, None).await, Some(true));
    }

    #[tokio::test]
    async fn disabled_category_never_mutates_state() {
        let mut config = Config::new("e4", "shm");
        config.checks.passive.unhealthy.timeouts = 0;
        let engine = test_engine(config).await;
        engine.add_target("10.0.0.1", 80, None, None, Some(true)).await.unwrap();

        for _ in 0..10 {
            engine.report_timeout("10.0.0.1", 80, None).await.unwrap();
        }
        let key = target_key("10.0.0.1", 80, None);
        assert_eq!(engine.codec.get_counter_word(&key), 0);
        assert_eq!(engine.get_target_status("10.0.0.1", 80, None).await, Some(true));
    }

    #[tokio::test]
    async fn threshold_saturation_stops_incrementing_past_the_first_call() {
        let engine = test_engine(Config::new("e5", "shm")).await;
        engine.add_target("10.0.0.1", 80, None, None, Some(false)).await.unwrap();

        for _ in 0..10 {
            engine.report_tcp_failure("10.0.0.1", 80, None).await.unwrap();
        }
        let key = target_key("10.0.0.1", 80, None);
        assert_eq!(crate::target::CounterWord(engine.codec.get_counter_word(&key)).extract(Selector::Tcp), 0);
    }

    #[tokio::test]
    async fn forced_override_zeroes_counters_and_flips_status_ver() {
        let engine = test_engine(Config::new("e6", "shm")).await;
        engine.add_target("10.0.0.1", 80, None, None, Some(true)).await.unwrap();
        engine.report_success("10.0.0.1", 80, None).await.unwrap();
        engine.report_success("10.0.0.1", 80, None).await.unwrap();
        engine.report_success("10.0.0.1", 80, None).await.unwrap();

        engine.set_target_status("10.0.0.1", 80, None, false).await.unwrap();
        settle().await;

        let key = target_key("10.0.0.1", 80, None);
        assert_eq!(engine.codec.get_counter_word(&key), 0);
        assert_eq!(engine.get_target_status("10.0.0.1", 80, None).await, Some(false));
        assert_eq!(engine.status_ver(), 1);
    }

    #[tokio::test]
    async fn cross_worker_propagation_synthesizes_unknown_targets() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcessBus::new(64));

        let a = Engine::new(Config::new("a", "shm"), store.clone(), store.clone(), bus.clone()).unwrap();
        let b = Engine::new(Config::new("a", "shm"), store.clone(), store, bus).unwrap();

        a.add_target("1.2.3.4", 443, None, None, Some(true)).await.unwrap();

        // give b's subscriber task a turn to process the posted event.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert_eq!(b.get_target_status("1.2.3.4", 443, None).await, Some(true));
    }

    #[tokio::test]
    async fn remove_target_prunes_local_index() {
        let engine = test_engine(Config::new("e7", "shm")).await;
        engine.add_target("10.0.0.1", 80, None, None, None).await.unwrap();
        engine.remove_target("10.0.0.1", 80, None).await.unwrap();
        assert_eq!(engine.get_target_status("10.0.0.1", 80, None).await, None);
    }
}

//! Per-endpoint circuit breaker.
//!
//! ```text
//!             failure rate >= threshold
//!   CLOSE ─────────────────────────────────► OPEN
//!     ▲                                       │ half_open_time
//!     │ trial succeeds                        ▼
//!   HALF_OPEN_WAIT ◄──── next call ──────  HALF_OPEN
//!     │                                       ▲
//!     ├── trial fails ──► OPEN                │
//!     └── trial never settles (half_open_time) ┘
//! ```
//!
//! While OPEN or HALF_OPEN_WAIT the endpoint's `state` is false, so
//! strategies skip it and callers see "service not found". Only one trial
//! call gets through per HALF_OPEN period: the first call flips the state to
//! HALF_OPEN_WAIT synchronously, before any other caller can select it.
//!
//! Counters live in a window that a periodic sweep resets; entries that are
//! closed or half-open with no traffic in the last window are dropped.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tokio::task::JoinHandle;

use crate::bus::{LocalBus, LocalEvent};
use crate::config::CircuitBreakerConfig;
use crate::error::MeshError;
use crate::provider::{Providers, TaskProvider, TaskSet, TimeProvider};
use crate::registry::Endpoint;

/// Breaker state of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow, failures are counted.
    Close,
    /// Endpoint excluded from selection.
    Open,
    /// Next call is let through as a trial.
    HalfOpen,
    /// Trial call in flight, endpoint excluded again.
    HalfOpenWait,
}

#[derive(Debug)]
struct BreakerItem {
    state: BreakerState,
    count: u32,
    failures: u32,
    endpoint: Rc<Endpoint>,
    timer: Option<JoinHandle<()>>,
}

impl BreakerItem {
    fn new(endpoint: Rc<Endpoint>) -> Self {
        Self {
            state: BreakerState::Close,
            count: 0,
            failures: 0,
            endpoint,
            timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Snapshot of one breaker entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    /// `node:action` key.
    pub name: String,
    /// Current state.
    pub state: BreakerState,
    /// Calls in the current window.
    pub count: u32,
    /// Failures in the current window.
    pub failures: u32,
}

/// Breaker store of one broker.
pub struct CircuitBreaker<P: Providers> {
    config: CircuitBreakerConfig,
    providers: P,
    bus: LocalBus,
    store: RefCell<HashMap<String, BreakerItem>>,
    tasks: TaskSet,
    me: Weak<Self>,
}

impl<P: Providers> CircuitBreaker<P> {
    /// Create a breaker store.
    pub fn new(config: CircuitBreakerConfig, providers: P, bus: LocalBus) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            config,
            providers,
            bus,
            store: RefCell::new(HashMap::new()),
            tasks: TaskSet::new(),
            me: me.clone(),
        })
    }

    /// Whether breakers are tracked.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Start the window sweep.
    pub fn start(&self) {
        if !self.config.enabled {
            return;
        }
        let me = self.me.clone();
        let time = self.providers.time().clone();
        let window = self.config.window_time;
        let handle = self.providers.task().spawn_task("circuit_breaker_window", async move {
            loop {
                time.sleep(window).await;
                match me.upgrade() {
                    Some(breaker) => breaker.reset_window(),
                    None => break,
                }
            }
        });
        self.tasks.push(handle);
    }

    /// Cancel the window sweep and every pending breaker timer.
    pub fn stop(&self) {
        self.tasks.abort_all();
        for item in self.store.borrow_mut().values_mut() {
            item.cancel_timer();
        }
    }

    /// Hook run right before a call goes to `endpoint`.
    ///
    /// In HALF_OPEN the call becomes the single trial.
    pub fn before_call(&self, endpoint: &Rc<Endpoint>) {
        if !self.config.enabled {
            return;
        }
        let half_open = self.with_item(endpoint, |item| item.state == BreakerState::HalfOpen);
        if half_open {
            self.half_open_wait(&endpoint.name);
        }
    }

    /// Hook run after a successful call.
    pub fn success(&self, endpoint: &Rc<Endpoint>) {
        if !self.config.enabled {
            return;
        }
        let state = self.with_item(endpoint, |item| {
            item.count += 1;
            item.state
        });
        if state == BreakerState::HalfOpenWait {
            self.close(&endpoint.name);
        } else {
            self.check_threshold(&endpoint.name);
        }
    }

    /// Hook run after a failed call.
    ///
    /// Errors rejected by the configured predicate, or raised on another node
    /// than the endpoint's, count as a completed call but not as a failure.
    pub fn failure(&self, endpoint: &Rc<Endpoint>, err: &MeshError) {
        if !self.config.enabled {
            return;
        }
        let from_endpoint = err.origin_node().map_or(true, |origin| *origin == endpoint.id);
        if !(self.config.check)(err) || !from_endpoint {
            self.success(endpoint);
            return;
        }

        let state = self.with_item(endpoint, |item| {
            item.count += 1;
            item.failures += 1;
            item.state
        });
        if state == BreakerState::HalfOpenWait {
            self.trip(&endpoint.name);
        } else {
            self.check_threshold(&endpoint.name);
        }
    }

    /// State of the breaker for `name` (`node:action`).
    pub fn state(&self, name: &str) -> Option<BreakerState> {
        self.store.borrow().get(name).map(|item| item.state)
    }

    /// Snapshot of every tracked breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .store
            .borrow()
            .iter()
            .map(|(name, item)| BreakerSnapshot {
                name: name.clone(),
                state: item.state,
                count: item.count,
                failures: item.failures,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Reset counters and drop idle entries.
    ///
    /// An entry is idle when it saw no call in the last window while CLOSE or
    /// HALF_OPEN. Both leave the endpoint selectable.
    pub fn reset_window(&self) {
        self.store.borrow_mut().retain(|_, item| {
            let idle = matches!(item.state, BreakerState::Close | BreakerState::HalfOpen);
            if item.count == 0 && idle {
                item.cancel_timer();
                return false;
            }
            item.count = 0;
            item.failures = 0;
            true
        });
    }

    fn with_item<R>(&self, endpoint: &Rc<Endpoint>, f: impl FnOnce(&mut BreakerItem) -> R) -> R {
        let mut store = self.store.borrow_mut();
        let item = store
            .entry(endpoint.name.clone())
            .or_insert_with(|| BreakerItem::new(endpoint.clone()));
        if !Rc::ptr_eq(&item.endpoint, endpoint) {
            // The node re-registered after a disconnect: start over.
            item.cancel_timer();
            *item = BreakerItem::new(endpoint.clone());
        }
        f(item)
    }

    fn check_threshold(&self, name: &str) {
        let should_trip = self.store.borrow().get(name).is_some_and(|item| {
            item.state == BreakerState::Close
                && item.count >= self.config.min_request_count
                && f64::from(item.failures) / f64::from(item.count.max(1)) >= self.config.threshold
        });
        if should_trip {
            self.trip(name);
        }
    }

    fn trip(&self, name: &str) {
        let timer = self.schedule_half_open(name);
        let mut store = self.store.borrow_mut();
        let Some(item) = store.get_mut(name) else {
            timer.abort();
            return;
        };
        item.cancel_timer();
        item.state = BreakerState::Open;
        item.endpoint.set_state(false);
        item.timer = Some(timer);

        let rate = f64::from(item.failures) / f64::from(item.count.max(1));
        tracing::warn!(
            node_id = %item.endpoint.id,
            endpoint = %name,
            failures = item.failures,
            count = item.count,
            rate,
            "circuit breaker opened"
        );
        let event = LocalEvent::CircuitBreakerOpened {
            node_id: item.endpoint.id.clone(),
            action: action_of(name),
            failures: item.failures,
            count: item.count,
            rate,
        };
        drop(store);
        self.bus.emit(event);
    }

    fn half_open(&self, name: &str) {
        let mut store = self.store.borrow_mut();
        let Some(item) = store.get_mut(name) else {
            return;
        };
        // Called from the timer task itself; nothing to abort.
        item.timer = None;
        item.state = BreakerState::HalfOpen;
        item.endpoint.set_state(true);

        tracing::info!(node_id = %item.endpoint.id, endpoint = %name, "circuit breaker half-opened");
        let event = LocalEvent::CircuitBreakerHalfOpened {
            node_id: item.endpoint.id.clone(),
            action: action_of(name),
        };
        drop(store);
        self.bus.emit(event);
    }

    fn half_open_wait(&self, name: &str) {
        let timer = self.schedule_half_open(name);
        let mut store = self.store.borrow_mut();
        let Some(item) = store.get_mut(name) else {
            timer.abort();
            return;
        };
        item.cancel_timer();
        item.state = BreakerState::HalfOpenWait;
        item.endpoint.set_state(false);
        item.timer = Some(timer);
        tracing::debug!(endpoint = %name, "circuit breaker trial call in flight");
    }

    fn close(&self, name: &str) {
        let mut store = self.store.borrow_mut();
        let Some(item) = store.get_mut(name) else {
            return;
        };
        item.cancel_timer();
        item.state = BreakerState::Close;
        item.count = 0;
        item.failures = 0;
        item.endpoint.set_state(true);

        tracing::info!(node_id = %item.endpoint.id, endpoint = %name, "circuit breaker closed");
        let event = LocalEvent::CircuitBreakerClosed {
            node_id: item.endpoint.id.clone(),
            action: action_of(name),
        };
        drop(store);
        self.bus.emit(event);
    }

    fn schedule_half_open(&self, name: &str) -> JoinHandle<()> {
        let me = self.me.clone();
        let time = self.providers.time().clone();
        let delay = self.config.half_open_time;
        let name = name.to_string();
        self.providers
            .task()
            .spawn_task("circuit_breaker_half_open", async move {
                time.sleep(delay).await;
                if let Some(breaker) = me.upgrade() {
                    breaker.half_open(&name);
                }
            })
    }
}

impl<P: Providers> std::fmt::Debug for CircuitBreaker<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("entries", &self.store.borrow().len())
            .finish()
    }
}

impl<P: Providers> Drop for CircuitBreaker<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// `node:action` -> `action`.
fn action_of(name: &str) -> String {
    name.split_once(':')
        .map(|(_, action)| action.to_string())
        .unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TokioProviders;
    use crate::registry::endpoint::tests::{action, node};
    use std::time::Duration;

    fn breaker(min_request_count: u32) -> Rc<CircuitBreaker<TokioProviders>> {
        let config = CircuitBreakerConfig::enabled(0.5, min_request_count)
            .with_timing(Duration::from_secs(60), Duration::from_secs(10));
        CircuitBreaker::new(config, TokioProviders::new(), LocalBus::new())
    }

    fn endpoint() -> Rc<Endpoint> {
        Rc::new(Endpoint::new(node("b", false), action("math.add")))
    }

    fn remote_failure() -> MeshError {
        MeshError::NodeUnavailable { node_id: "b".into() }
    }

    async fn run_local<F: std::future::Future<Output = ()>>(f: F) {
        tokio::task::LocalSet::new().run_until(f).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_two_successes_trip_on_fifth_call() {
        run_local(async {
            let cb = breaker(5);
            let ep = endpoint();
            for _ in 0..3 {
                cb.before_call(&ep);
                cb.failure(&ep, &remote_failure());
            }
            cb.before_call(&ep);
            cb.success(&ep);
            assert_eq!(cb.state(&ep.name), Some(BreakerState::Close));
            cb.before_call(&ep);
            cb.success(&ep);
            assert_eq!(cb.state(&ep.name), Some(BreakerState::Open));
            assert!(!ep.is_available());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_three_successes_stay_closed() {
        run_local(async {
            let cb = breaker(5);
            let ep = endpoint();
            for _ in 0..2 {
                cb.failure(&ep, &remote_failure());
            }
            for _ in 0..3 {
                cb.success(&ep);
            }
            assert_eq!(cb.state(&ep.name), Some(BreakerState::Close));
            assert!(ep.is_available());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_lets_one_trial_through_then_closes() {
        run_local(async {
            let cb = breaker(2);
            let bus_rx = &mut cb.bus.subscribe();
            let ep = endpoint();
            cb.failure(&ep, &remote_failure());
            cb.failure(&ep, &remote_failure());
            assert_eq!(cb.state(&ep.name), Some(BreakerState::Open));

            tokio::time::sleep(Duration::from_secs(11)).await;
            assert_eq!(cb.state(&ep.name), Some(BreakerState::HalfOpen));
            assert!(ep.is_available());

            cb.before_call(&ep);
            assert_eq!(cb.state(&ep.name), Some(BreakerState::HalfOpenWait));
            assert!(!ep.is_available());

            cb.success(&ep);
            assert_eq!(cb.state(&ep.name), Some(BreakerState::Close));
            assert!(ep.is_available());

            let names: Vec<&str> = std::iter::from_fn(|| bus_rx.try_recv().ok())
                .map(|e| e.name())
                .collect();
            assert_eq!(
                names,
                vec![
                    "$circuit-breaker.opened",
                    "$circuit-breaker.half-opened",
                    "$circuit-breaker.closed"
                ]
            );
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_and_stuck_trial_half_opens_again() {
        run_local(async {
            let cb = breaker(1);
            let ep = endpoint();
            cb.failure(&ep, &remote_failure());
            tokio::time::sleep(Duration::from_secs(11)).await;

            cb.before_call(&ep);
            cb.failure(&ep, &remote_failure());
            assert_eq!(cb.state(&ep.name), Some(BreakerState::Open));

            tokio::time::sleep(Duration::from_secs(11)).await;
            cb.before_call(&ep);
            assert_eq!(cb.state(&ep.name), Some(BreakerState::HalfOpenWait));
            // The trial never settles.
            tokio::time::sleep(Duration::from_secs(11)).await;
            assert_eq!(cb.state(&ep.name), Some(BreakerState::HalfOpen));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_from_other_nodes_are_not_counted() {
        run_local(async {
            let cb = breaker(1);
            let ep = endpoint();
            cb.failure(&ep, &MeshError::NodeUnavailable { node_id: "deeper".into() });
            cb.failure(&ep, &MeshError::custom("ValidationError", "bad", 422));
            assert_eq!(cb.state(&ep.name), Some(BreakerState::Close));
            assert_eq!(cb.snapshot()[0].failures, 0);
            assert_eq!(cb.snapshot()[0].count, 2);
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_sweep_resets_and_collects() {
        run_local(async {
            let cb = breaker(100);
            cb.start();
            let busy = endpoint();
            let idle = Rc::new(Endpoint::new(node("c", false), action("math.add")));
            cb.failure(&busy, &remote_failure());
            cb.success(&idle);

            tokio::time::sleep(Duration::from_secs(61)).await;
            assert_eq!(cb.snapshot().len(), 2);
            assert!(cb.snapshot().iter().all(|s| s.count == 0 && s.failures == 0));

            cb.success(&busy);
            tokio::time::sleep(Duration::from_secs(60)).await;
            let names: Vec<String> = cb.snapshot().into_iter().map(|s| s.name).collect();
            assert_eq!(names, vec!["b:math.add".to_string()]);
            cb.stop();
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_half_open_entry_is_collected() {
        run_local(async {
            let cb = breaker(1);
            let ep = endpoint();
            cb.failure(&ep, &remote_failure());
            assert_eq!(cb.state(&ep.name), Some(BreakerState::Open));

            // The window sweep while OPEN only clears counters.
            cb.reset_window();
            assert_eq!(cb.state(&ep.name), Some(BreakerState::Open));

            tokio::time::sleep(Duration::from_secs(11)).await;
            assert_eq!(cb.state(&ep.name), Some(BreakerState::HalfOpen));

            // Nobody calls the node anymore.
            cb.reset_window();
            assert_eq!(cb.state(&ep.name), None);
            assert!(cb.snapshot().is_empty());
            assert!(ep.is_available());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_entry_with_traffic_survives_the_sweep() {
        run_local(async {
            let cb = breaker(1);
            let ep = endpoint();
            cb.failure(&ep, &remote_failure());
            tokio::time::sleep(Duration::from_secs(11)).await;

            cb.before_call(&ep);
            cb.reset_window();
            assert_eq!(cb.state(&ep.name), Some(BreakerState::HalfOpenWait));
        })
        .await;
    }

    #[test]
    fn test_disabled_breaker_tracks_nothing() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default(), TokioProviders::new(), LocalBus::new());
        let ep = endpoint();
        cb.failure(&ep, &remote_failure());
        assert!(cb.snapshot().is_empty());
    }
}

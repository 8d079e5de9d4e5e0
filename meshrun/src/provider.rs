//! Time and task providers.
//!
//! Every timer in meshrun (request timeouts, heartbeats, liveness sweeps,
//! circuit-breaker windows) goes through these traits, so the whole
//! coordination layer can run on a real Tokio runtime or under a paused clock
//! in tests with identical code.
//!
//! All tasks are spawned on the current thread: the registry, transit and
//! breaker state lives in `Rc<RefCell<..>>` and is never shared across
//! threads.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

/// Provider trait for time operations.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Monotonic time elapsed since the provider was created.
    ///
    /// Use this for deadlines, heartbeat ages and elapsed-time reporting.
    fn now(&self) -> Duration;

    /// Wall-clock milliseconds since the Unix epoch.
    ///
    /// Only used for values that cross the wire (PING/PONG clock skew).
    fn wall_clock_ms(&self) -> u64;
}

/// Real time provider using Tokio's clock.
///
/// Built on `tokio::time::Instant`, so it honors a paused test clock.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn wall_clock_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Provider for spawning local tasks in a single-threaded context.
#[async_trait(?Send)]
pub trait TaskProvider: Clone {
    /// Spawn a named task on the current thread.
    ///
    /// The returned handle is owned by whoever scheduled the task so it can be
    /// aborted on shutdown.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;

    /// Yield control to allow other tasks to run.
    async fn yield_now(&self);
}

/// Task provider backed by `tokio::task::spawn_local`.
///
/// Must be used from within a `LocalSet`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTaskProvider;

#[async_trait(?Send)]
impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        tracing::trace!(task = name, "spawning local task");
        tokio::task::spawn_local(future)
    }

    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}

/// Bundle of provider types for a runtime environment.
pub trait Providers: Clone + 'static {
    /// Time provider type.
    type Time: TimeProvider + 'static;

    /// Task provider type.
    type Task: TaskProvider + 'static;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the task provider instance.
    fn task(&self) -> &Self::Task;
}

/// Production providers using the Tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioProviders {
    time: TokioTimeProvider,
    task: TokioTaskProvider,
}

impl TokioProviders {
    /// Create a new production providers bundle.
    pub fn new() -> Self {
        Self {
            time: TokioTimeProvider::new(),
            task: TokioTaskProvider,
        }
    }
}

impl Providers for TokioProviders {
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }
}

/// Owned set of spawned task handles, aborted together.
///
/// Periodic loops register themselves here so stopping a component cancels
/// every timer it scheduled.
#[derive(Debug, Default)]
pub struct TaskSet {
    handles: std::cell::RefCell<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a spawned task, dropping handles of tasks that already finished.
    pub fn push(&self, handle: tokio::task::JoinHandle<()>) {
        let mut handles = self.handles.borrow_mut();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Number of tracked tasks still running.
    pub fn len(&self) -> usize {
        self.handles
            .borrow()
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Whether no tracked task is running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every tracked task.
    pub fn abort_all(&self) {
        for handle in self.handles.borrow_mut().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_time_provider_follows_paused_clock() {
        let time = TokioTimeProvider::new();
        let before = time.now();
        time.sleep(Duration::from_secs(5)).await;
        assert!(time.now() - before >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_set_aborts_tasks() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let set = TaskSet::new();
                set.push(TokioTaskProvider.spawn_task("sleeper", async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }));
                assert_eq!(set.len(), 1);
                set.abort_all();
                tokio::task::yield_now().await;
                assert!(set.is_empty());
            })
            .await;
    }
}

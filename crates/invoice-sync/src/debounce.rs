use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Trailing-edge debounce with single-flight execution.
///
/// Each `trigger` supersedes the pending action; only the last one inside
/// the quiet period runs. An action that already started is never
/// interrupted, and two actions never run at the same time.
pub struct Debouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
    flight: Arc<Mutex<()>>,
    pending: Arc<AtomicUsize>,
    on_idle: Option<IdleHook>,
}

type IdleHook = Arc<dyn Fn() + Send + Sync>;

/// Counts a scheduled action until its task ends, however it ends.
struct PendingGuard {
    pending: Arc<AtomicUsize>,
    on_idle: Option<IdleHook>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(hook) = &self.on_idle {
                hook();
            }
        }
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
            flight: Arc::new(Mutex::new(())),
            pending: Arc::new(AtomicUsize::new(0)),
            on_idle: None,
        }
    }

    /// Run `hook` whenever the last scheduled action has finished or been
    /// dropped.
    pub fn on_idle(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_idle = Some(Arc::new(hook));
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Actions scheduled but not yet finished, superseded ones included.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Schedule `action` after the quiet period. The handle resolves to
    /// `None` when the action was superseded or cancelled.
    pub fn trigger<F, T>(&self, action: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);
        let flight = Arc::clone(&self.flight);
        let delay = self.delay;

        self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            on_idle: self.on_idle.clone(),
        };

        tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::SeqCst) != ticket {
                return None;
            }
            let _in_flight = flight.lock().await;
            Some(action.await)
        })
    }

    /// Drop the pending action, if any.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

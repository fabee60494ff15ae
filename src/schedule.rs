//! Deferred execution of the breaker's cooldown reset.

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A one-shot task run by a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay. Tasks are fire-and-forget: no handle is
/// returned and they cannot be cancelled.
pub trait Scheduler: Send + Sync + 'static {
    /// Runs `task` after `delay`.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Spawns a detached thread per task.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        // The task moves into the thread only if spawning succeeds, so keep
        // it in a slot we can recover from on failure.
        let slot = Arc::new(Mutex::new(Some(task)));
        let thread_slot = Arc::clone(&slot);

        let spawned = thread::Builder::new()
            .name("thc-healer".to_string())
            .spawn(move || {
                thread::sleep(delay);
                let task = thread_slot.lock().take();
                if let Some(task) = task {
                    task();
                }
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn cooldown thread, running task now");
            let task = slot.lock().take();
            if let Some(task) = task {
                task();
            }
        }
    }
}

#[cfg(feature = "async")]
mod tokio_scheduler {
    use super::{Scheduler, Task};
    use std::time::Duration;
    use tokio::runtime::Handle;

    /// Spawns each task on a Tokio runtime.
    #[cfg_attr(docsrs, doc(cfg(feature = "async")))]
    #[derive(Debug, Clone)]
    pub struct TokioScheduler {
        handle: Handle,
    }

    impl TokioScheduler {
        /// Uses the given runtime.
        pub fn new(handle: Handle) -> Self {
            Self { handle }
        }

        /// Uses the runtime of the calling context, if any.
        pub fn try_current() -> Option<Self> {
            Handle::try_current().ok().map(Self::new)
        }
    }

    impl Scheduler for TokioScheduler {
        fn schedule(&self, delay: Duration, task: Task) {
            self.handle.spawn(async move {
                tokio::time::sleep(delay).await;
                task();
            });
        }
    }
}

#[cfg(feature = "async")]
pub use self::tokio_scheduler::TokioScheduler;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    #[test]
    fn thread_scheduler_runs_after_delay() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let start = Instant::now();

        ThreadScheduler.schedule(
            Duration::from_millis(20),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        assert!(!ran.load(Ordering::SeqCst));
        while !ran.load(Ordering::SeqCst) {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}

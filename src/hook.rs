//! Hook registry for client events.

use crate::state::State;
use parking_lot::RwLock;
use std::sync::Arc;

type HookFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// A registry of callbacks fired by the client.
///
/// Hooks run on the thread that triggered the event; `on_restored` runs on
/// the scheduler's thread or task.
pub struct HookRegistry {
    on_out_of_service: RwLock<Option<HookFn>>,
    on_restored: RwLock<Option<HookFn>>,
    on_success: RwLock<Option<HookFn>>,
    on_failure: RwLock<Option<HookFn>>,
    on_rejected: RwLock<Option<HookFn>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates a new empty hook registry.
    pub fn new() -> Self {
        Self {
            on_out_of_service: RwLock::new(None),
            on_restored: RwLock::new(None),
            on_success: RwLock::new(None),
            on_failure: RwLock::new(None),
            on_rejected: RwLock::new(None),
        }
    }

    /// Sets the hook to call when the client goes out of service.
    pub fn set_on_out_of_service<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_out_of_service.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when the healing time elapsed and service
    /// resumes.
    pub fn set_on_restored<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_restored.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a request succeeds.
    pub fn set_on_success<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_success.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a request counts as a failure.
    pub fn set_on_failure<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_failure.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a request is rejected without being sent.
    pub fn set_on_rejected<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_rejected.write() = Some(Arc::new(f));
    }

    /// Executes the hook for a state transition.
    pub fn execute_state_transition_hook(&self, to: State) {
        let hook = match to {
            State::OutOfService => self.on_out_of_service.read().clone(),
            State::InService => self.on_restored.read().clone(),
        };

        if let Some(hook) = hook {
            hook();
        }
    }

    /// Executes the success hook.
    pub fn execute_success_hook(&self) {
        let hook = self.on_success.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Executes the failure hook.
    pub fn execute_failure_hook(&self) {
        let hook = self.on_failure.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Executes the rejection hook.
    pub fn execute_rejected_hook(&self) {
        let hook = self.on_rejected.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

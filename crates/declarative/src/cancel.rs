//! Cooperative cancellation

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    cancelled: bool,
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    signal: Condvar,
}

/// A cloneable cancellation flag shared between a caller and an operation
///
/// Cancellation is cooperative: the engine checks the token between units
/// and the sequencer wakes up from its waits.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and run registered callbacks
    ///
    /// Only the first call has an effect.
    pub fn cancel(&self) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.callbacks)
        };
        self.inner.signal.notify_all();

        log::debug!("Cancellation requested, running {} callback(s)", callbacks.len());
        for callback in callbacks.into_values() {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.lock().cancelled
    }

    /// Return `Err(Error::Cancelled)` once cancellation has been requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `callback` when cancellation is requested
    ///
    /// Runs immediately if the token is already cancelled. Dropping the
    /// returned registration unregisters the callback.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> CancelRegistration {
        let mut state = self.inner.state.lock();
        if state.cancelled {
            drop(state);
            callback();
            return CancelRegistration {
                inner: Weak::new(),
                id: 0,
            };
        }

        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Box::new(callback));
        CancelRegistration {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Block for up to `timeout`; returns `true` if cancelled
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.cancelled {
            if self.inner.signal.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.cancelled
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Keeps a cancellation callback registered while alive
#[must_use = "the callback is unregistered when the registration is dropped"]
pub struct CancelRegistration {
    inner: Weak<Inner>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.state.lock().callbacks.remove(&self.id);
        }
    }
}

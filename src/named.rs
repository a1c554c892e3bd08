//! Machine-wide named synchronization objects
//!
//! The sequencer and the change listeners coordinate through objects that
//! are found by name: liveness tokens, a mutex and manual-reset events.
//! [`ObjectNamespace`] is the seam; [`LocalNamespace`] implements it for
//! everything sharing one process (and one namespace instance).

use crate::error::{Error, Result};
use crate::signal::ManualResetEvent;
use declarative::CancellationToken;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How often a blocked acquire re-checks for an abandoned owner
const ABANDON_POLL: Duration = Duration::from_millis(50);

/// Keeps a named object alive
///
/// The object exists while any handle to it is alive.
pub struct NamedObject {
    name: String,
    _token: Arc<dyn Any + Send + Sync>,
}

impl NamedObject {
    pub fn new(name: impl Into<String>, token: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            _token: token,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for NamedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedObject").field("name", &self.name).finish()
    }
}

/// A named mutex whose owner is identified by its named object
///
/// A lock held by an owner whose named object no longer exists is
/// abandoned and may be taken by anyone.
pub trait AdvisoryLock: Send + Sync {
    /// Take the lock if it is free; never blocks
    fn try_acquire(&self, owner: &str) -> bool;

    /// Block until the lock is taken or `cancellation` fires
    ///
    /// Returns `false` if cancelled.
    fn acquire(&self, owner: &str, cancellation: &CancellationToken) -> bool;

    /// Release the lock if `owner` holds it
    fn release(&self, owner: &str);

    /// Current owner, if any
    fn owner(&self) -> Option<String>;
}

/// Create-or-open access to named objects
pub trait ObjectNamespace: Send + Sync {
    /// Create a liveness token; fails if the name is already alive
    fn create_object(&self, name: &str) -> Result<NamedObject>;

    fn object_exists(&self, name: &str) -> bool;

    /// Create the named mutex, or open it if it already exists
    fn create_mutex(&self, name: &str) -> Result<Arc<dyn AdvisoryLock>>;

    /// Create a new manual-reset event, initially not signaled
    fn create_event(&self, name: &str) -> Result<Arc<dyn ManualResetEvent>>;

    /// Open an existing event; `None` once its creator is gone
    fn open_event(&self, name: &str) -> Option<Arc<dyn ManualResetEvent>>;
}

/// Whether a process with this id is running
///
/// Used to recognize rows left behind by processes that died.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only checks that the process exists and may be signaled
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether a process with this id is running
#[cfg(not(unix))]
pub fn process_exists(_pid: u32) -> bool {
    true
}

// ============================================================================
// In-process implementation
// ============================================================================

#[derive(Default)]
struct Tables {
    objects: Mutex<HashMap<String, Weak<()>>>,
    mutexes: Mutex<HashMap<String, Arc<LocalMutex>>>,
    events: Mutex<HashMap<String, Weak<LocalEvent>>>,
}

impl Tables {
    fn object_exists(&self, name: &str) -> bool {
        self.objects
            .lock()
            .get(name)
            .is_some_and(|token| token.strong_count() > 0)
    }
}

/// Named objects shared by every clone of one namespace
#[derive(Clone, Default)]
pub struct LocalNamespace {
    tables: Arc<Tables>,
}

impl LocalNamespace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for LocalNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNamespace")
            .field("objects", &self.tables.objects.lock().len())
            .finish()
    }
}

impl ObjectNamespace for LocalNamespace {
    fn create_object(&self, name: &str) -> Result<NamedObject> {
        let mut objects = self.tables.objects.lock();
        if objects.get(name).is_some_and(|token| token.strong_count() > 0) {
            return Err(Error::named_object(name, "already exists"));
        }
        // Drop entries whose handles are gone
        objects.retain(|_, token| token.strong_count() > 0);

        let token = Arc::new(());
        objects.insert(name.to_string(), Arc::downgrade(&token));
        Ok(NamedObject::new(name, token))
    }

    fn object_exists(&self, name: &str) -> bool {
        self.tables.object_exists(name)
    }

    fn create_mutex(&self, name: &str) -> Result<Arc<dyn AdvisoryLock>> {
        let mut mutexes = self.tables.mutexes.lock();
        let mutex: Arc<dyn AdvisoryLock> = mutexes
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(LocalMutex {
                    inner: Arc::new(MutexInner::default()),
                    tables: Arc::downgrade(&self.tables),
                })
            })
            .clone();
        Ok(mutex)
    }

    fn create_event(&self, name: &str) -> Result<Arc<dyn ManualResetEvent>> {
        let mut events = self.tables.events.lock();
        if events.get(name).is_some_and(|event| event.strong_count() > 0) {
            return Err(Error::named_object(name, "already exists"));
        }
        events.retain(|_, event| event.strong_count() > 0);

        let event = Arc::new(LocalEvent::default());
        events.insert(name.to_string(), Arc::downgrade(&event));
        let event: Arc<dyn ManualResetEvent> = event;
        Ok(event)
    }

    fn open_event(&self, name: &str) -> Option<Arc<dyn ManualResetEvent>> {
        let event: Arc<dyn ManualResetEvent> = self.tables.events.lock().get(name)?.upgrade()?;
        Some(event)
    }
}

#[derive(Default)]
struct MutexInner {
    owner: Mutex<Option<String>>,
    released: Condvar,
}

struct LocalMutex {
    inner: Arc<MutexInner>,
    tables: Weak<Tables>,
}

impl LocalMutex {
    fn take_if_free(&self, current: &mut Option<String>, owner: &str) -> bool {
        match current.as_deref() {
            None => {}
            Some(holder) if holder == owner => return true,
            Some(holder) => {
                let alive = self
                    .tables
                    .upgrade()
                    .is_some_and(|tables| tables.object_exists(holder));
                if alive {
                    return false;
                }
                log::warn!("Taking mutex abandoned by {holder}");
            }
        }
        *current = Some(owner.to_string());
        true
    }
}

impl AdvisoryLock for LocalMutex {
    fn try_acquire(&self, owner: &str) -> bool {
        let mut current = self.inner.owner.lock();
        self.take_if_free(&mut current, owner)
    }

    fn acquire(&self, owner: &str, cancellation: &CancellationToken) -> bool {
        let inner = Arc::clone(&self.inner);
        let _registration = cancellation.on_cancel(move || {
            let _owner = inner.owner.lock();
            inner.released.notify_all();
        });

        let mut current = self.inner.owner.lock();
        loop {
            if cancellation.is_cancelled() {
                return false;
            }
            if self.take_if_free(&mut current, owner) {
                return true;
            }
            self.inner.released.wait_for(&mut current, ABANDON_POLL);
        }
    }

    fn release(&self, owner: &str) {
        let mut current = self.inner.owner.lock();
        if current.as_deref() == Some(owner) {
            *current = None;
            self.inner.released.notify_all();
        }
    }

    fn owner(&self) -> Option<String> {
        self.inner.owner.lock().clone()
    }
}

#[derive(Debug, Default)]
struct EventState {
    signaled: bool,
    /// Bumped on every `set`, so a waiter never misses a set followed by a reset
    generation: u64,
}

#[derive(Default)]
struct LocalEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl ManualResetEvent for LocalEvent {
    fn set(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    fn reset(&self) {
        self.state.lock().signaled = false;
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        let generation = state.generation;
        if state.signaled {
            return true;
        }
        // Spurious wake-ups loop until the deadline
        let deadline = std::time::Instant::now() + timeout;
        while !state.signaled && state.generation == generation {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.signaled || state.generation != generation;
            }
        }
        true
    }

    fn is_set(&self) -> bool {
        self.state.lock().signaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[cfg(unix)]
    #[test]
    fn test_process_exists() {
        assert!(process_exists(std::process::id()));
        assert!(!process_exists(0));
        assert!(!process_exists(u32::MAX));
    }

    #[test]
    fn test_object_lifetime() {
        let ns = LocalNamespace::new();
        let object = ns.create_object("item").unwrap();
        assert_eq!(object.name(), "item");
        assert!(ns.object_exists("item"));
        assert!(ns.create_object("item").is_err());

        drop(object);
        assert!(!ns.object_exists("item"));
        assert!(ns.create_object("item").is_ok());
    }

    #[test]
    fn test_mutex_is_shared_by_name() {
        let ns = LocalNamespace::new();
        let _a = ns.create_object("a").unwrap();
        let _b = ns.create_object("b").unwrap();
        let first = ns.create_mutex("m").unwrap();
        let second = ns.clone().create_mutex("m").unwrap();

        assert!(first.try_acquire("a"));
        assert!(first.try_acquire("a"));
        assert!(!second.try_acquire("b"));
        assert_eq!(second.owner().as_deref(), Some("a"));

        second.release("b");
        assert_eq!(first.owner().as_deref(), Some("a"));
        first.release("a");
        assert!(second.try_acquire("b"));
    }

    #[test]
    fn test_abandoned_mutex_can_be_taken() {
        let ns = LocalNamespace::new();
        let a = ns.create_object("a").unwrap();
        let _b = ns.create_object("b").unwrap();
        let mutex = ns.create_mutex("m").unwrap();

        assert!(mutex.try_acquire("a"));
        assert!(!mutex.try_acquire("b"));
        drop(a);
        assert!(mutex.try_acquire("b"));
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let ns = LocalNamespace::new();
        let _a = ns.create_object("a").unwrap();
        let _b = ns.create_object("b").unwrap();
        let mutex = ns.create_mutex("m").unwrap();
        assert!(mutex.try_acquire("a"));

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let acquired = mutex.acquire("b", &CancellationToken::new());
                tx.send(acquired).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        mutex.release("a");
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        waiter.join().unwrap();
        assert_eq!(mutex.owner().as_deref(), Some("b"));
    }

    #[test]
    fn test_acquire_cancelled() {
        let ns = LocalNamespace::new();
        let _a = ns.create_object("a").unwrap();
        let mutex = ns.create_mutex("m").unwrap();
        assert!(mutex.try_acquire("a"));

        let token = CancellationToken::new();
        let waiter = {
            let mutex = Arc::clone(&mutex);
            let token = token.clone();
            thread::spawn(move || mutex.acquire("b", &token))
        };

        token.cancel();
        assert!(!waiter.join().unwrap());
        assert_eq!(mutex.owner().as_deref(), Some("a"));
    }

    #[test]
    fn test_event_set_reset_wait() {
        let ns = LocalNamespace::new();
        let event = ns.create_event("e").unwrap();
        assert!(ns.create_event("e").is_err());
        assert!(!event.wait_timeout(Duration::from_millis(10)));

        let opened = ns.open_event("e").unwrap();
        opened.set();
        assert!(event.is_set());
        assert!(event.wait_timeout(Duration::from_millis(10)));
        event.reset();
        assert!(!opened.is_set());

        drop(event);
        drop(opened);
        assert!(ns.open_event("e").is_none());
    }

    #[test]
    fn test_event_wakes_waiter_even_if_reset() {
        let ns = LocalNamespace::new();
        let event = ns.create_event("e").unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                tx.send(()).unwrap();
                event.wait_timeout(Duration::from_secs(5))
            })
        };

        rx.recv().unwrap();
        // Give the waiter time to block; the generation check covers the race either way
        thread::sleep(Duration::from_millis(20));
        event.set();
        event.reset();
        assert!(waiter.join().unwrap());
    }
}

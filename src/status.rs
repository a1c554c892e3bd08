//! Set and unit status, shared across processes
//!
//! [`ConfigurationStatus`] is the handle everything that reads or writes
//! status goes through. Writes wake every change listener on the machine.
//! Callbacks registered here are driven by one [`ChangeListener`], created
//! with the first registration and dropped with the last.

use crate::error::{Error, Result};
use crate::named::ObjectNamespace;
use crate::sequencer::ConfigurationSequencer;
use crate::settings::Settings;
use crate::signal::{ChangeSignaler, ManualResetEvent, event_names};
use chrono::{DateTime, Utc};
use declarative::{ConfigurationSet, ResultInformation, SetState, UnitState};
use history::{ConfigurationDatabase, StatusItem};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// Prefix of change listener object names
pub const LISTENER_PREFIX: &str = "ConfigListener_";

// ============================================================================
// Change data
// ============================================================================

/// What happened to a set, as seen by processor-wide registrations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// First status seen for the set
    SetAdded,
    /// The set changed state while queued or applying
    SetStateChanged,
    /// The set left the queue
    SetRemoved,
}

#[derive(Debug, Clone)]
pub struct ConfigurationChange {
    pub kind: ChangeKind,
    pub set_instance_identifier: Uuid,
    pub state: SetState,
    /// The set as stored in history; `None` if it is no longer there
    pub set: Option<Arc<ConfigurationSet>>,
}

/// State carried by a [`SetChange`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Set(SetState),
    Unit(UnitState),
}

/// A change to one set or one of its units
#[derive(Debug, Clone, PartialEq)]
pub struct SetChange {
    pub set_instance_identifier: Uuid,
    pub state: ChangeState,
    /// Present for unit changes
    pub unit_instance_identifier: Option<Uuid>,
    pub result_information: Option<ResultInformation>,
}

type SetChangeHandler = Arc<dyn Fn(&SetChange) + Send + Sync>;
type ChangeHandler = Arc<dyn Fn(&ConfigurationChange) + Send + Sync>;

#[derive(Default)]
struct Registrations {
    next_id: u64,
    set_handlers: Vec<(u64, Uuid, SetChangeHandler)>,
    change_handlers: Vec<(u64, ChangeHandler)>,
}

impl Registrations {
    fn is_empty(&self) -> bool {
        self.set_handlers.is_empty() && self.change_handlers.is_empty()
    }

    fn has_set(&self, set_instance_identifier: &Uuid) -> bool {
        self.set_handlers
            .iter()
            .any(|(_, id, _)| id == set_instance_identifier)
    }

    fn set_handlers_for(&self, set_instance_identifier: &Uuid) -> Vec<SetChangeHandler> {
        self.set_handlers
            .iter()
            .filter(|(_, id, _)| id == set_instance_identifier)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect()
    }
}

// ============================================================================
// Listener
// ============================================================================

struct SetStatusEntry {
    set: Option<Arc<ConfigurationSet>>,
}

struct Cursor {
    change_identifier: i64,
    last_set_status: HashMap<Uuid, SetStatusEntry>,
}

struct ListenerShared {
    database: Arc<ConfigurationDatabase>,
    registrations: Arc<Mutex<Registrations>>,
    object_name: String,
    events: [Arc<dyn ManualResetEvent>; 2],
    stop: AtomicBool,
    /// Pull requests not yet covered by a pull; nonzero means one is running
    pending: AtomicUsize,
    cursor: Mutex<Cursor>,
}

impl ListenerShared {
    /// Pull and deliver new changes, at most one thread at a time
    ///
    /// A request that arrives while another thread is pulling makes that
    /// thread pull again instead of waiting.
    fn process_changes(&self) {
        if self.pending.fetch_add(1, Ordering::AcqRel) > 0 {
            return;
        }

        loop {
            let requested = self.pending.load(Ordering::Acquire);
            if let Err(e) = self.pull() {
                log::warn!("Change listener {} failed to read status: {e}", self.object_name);
            }
            if self.pending.fetch_sub(requested, Ordering::AcqRel) == requested {
                break;
            }
        }
    }

    fn pull(&self) -> history::Result<()> {
        let mut cursor = self.cursor.lock();
        let changes = self.database.get_status_since(cursor.change_identifier)?;
        if !changes.is_empty() {
            log::trace!(
                "{} read {} status changes after {}",
                self.object_name,
                changes.len(),
                cursor.change_identifier
            );
        }

        for change in changes {
            if change.is_set_status() {
                self.deliver_set_status(&mut cursor, &change);
            } else {
                self.deliver_unit_status(&change);
            }
            cursor.change_identifier = change.change_identifier;
        }
        Ok(())
    }

    fn deliver_unit_status(&self, change: &StatusItem) {
        let handlers = self
            .registrations
            .lock()
            .set_handlers_for(&change.set_instance_identifier);
        if handlers.is_empty() {
            return;
        }

        let data = SetChange {
            set_instance_identifier: change.set_instance_identifier,
            state: ChangeState::Unit(change.unit_state()),
            unit_instance_identifier: change.unit_instance_identifier,
            result_information: change.result_information.clone(),
        };
        for handler in handlers {
            handler(&data);
        }
    }

    fn deliver_set_status(&self, cursor: &mut Cursor, change: &StatusItem) {
        let state = change.set_state();
        let id = change.set_instance_identifier;

        let kind = if cursor.last_set_status.contains_key(&id) {
            if change.in_queue {
                ChangeKind::SetStateChanged
            } else {
                ChangeKind::SetRemoved
            }
        } else {
            cursor.last_set_status.insert(id, SetStatusEntry { set: None });
            ChangeKind::SetAdded
        };

        let (change_handlers, set_handlers) = {
            let registrations = self.registrations.lock();
            let change_handlers: Vec<ChangeHandler> = registrations
                .change_handlers
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect();
            (change_handlers, registrations.set_handlers_for(&id))
        };

        if !change_handlers.is_empty() {
            let set = match cursor.last_set_status.get_mut(&id) {
                Some(entry) => {
                    if entry.set.is_none() {
                        entry.set = self.load_set(&id);
                    }
                    entry.set.clone()
                }
                None => None,
            };
            let data = ConfigurationChange {
                kind,
                set_instance_identifier: id,
                state,
                set,
            };
            for handler in change_handlers {
                handler(&data);
            }
        }

        let data = SetChange {
            set_instance_identifier: id,
            state: ChangeState::Set(state),
            unit_instance_identifier: None,
            result_information: None,
        };
        for handler in set_handlers {
            handler(&data);
        }
    }

    fn load_set(&self, id: &Uuid) -> Option<Arc<ConfigurationSet>> {
        match self.database.get_set(id) {
            Ok(set) => set.map(Arc::new),
            Err(e) => {
                log::warn!("Failed to load set {id} for change notification: {e}");
                None
            }
        }
    }
}

/// Follows the status change log and fans changes out to registrations
///
/// A background thread waits on the listener's current event. When it
/// fires, the thread resets the other event, switches to it, and pulls.
pub struct ChangeListener {
    shared: Arc<ListenerShared>,
    thread: Option<JoinHandle<()>>,
}

impl ChangeListener {
    fn start(
        database: Arc<ConfigurationDatabase>,
        namespace: &dyn ObjectNamespace,
        registrations: Arc<Mutex<Registrations>>,
        wait_timeout: Duration,
    ) -> Result<Self> {
        let baseline = database.get_status_baseline()?;
        let last_set_status = baseline
            .sets
            .iter()
            .map(|item| (item.set_instance_identifier, SetStatusEntry { set: None }))
            .collect();

        let object_name = format!("{LISTENER_PREFIX}{}", Uuid::new_v4());
        let [first, second] = event_names(&object_name);
        let events = [namespace.create_event(&first)?, namespace.create_event(&second)?];
        database.add_listener(&object_name)?;
        log::debug!(
            "Started change listener {object_name} at change {}",
            baseline.change_identifier
        );

        let shared = Arc::new(ListenerShared {
            database,
            registrations,
            object_name,
            events,
            stop: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            cursor: Mutex::new(Cursor {
                change_identifier: baseline.change_identifier,
                last_set_status,
            }),
        });

        let spawned = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(shared.object_name.clone())
                .spawn(move || Self::run(&shared, wait_timeout))
        };

        // Constructed before the spawn result is checked so a failure still
        // removes the listener row on drop
        let mut listener = Self {
            shared,
            thread: None,
        };
        match spawned {
            Ok(thread) => {
                listener.thread = Some(thread);
                Ok(listener)
            }
            Err(e) => Err(Error::named_object(listener.object_name(), e.to_string())),
        }
    }

    fn run(shared: &ListenerShared, wait_timeout: Duration) {
        let mut current = 0;
        while !shared.stop.load(Ordering::Acquire) {
            if !shared.events[current].wait_timeout(wait_timeout) {
                continue;
            }
            if shared.stop.load(Ordering::Acquire) {
                break;
            }

            let next = 1 - current;
            shared.events[next].reset();
            current = next;
            shared.process_changes();
        }
    }

    pub fn object_name(&self) -> &str {
        &self.shared.object_name
    }

    /// Pull and deliver pending changes on the calling thread
    pub fn process_changes(&self) {
        self.shared.process_changes();
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        for event in &self.shared.events {
            event.set();
        }

        if let Some(thread) = self.thread.take() {
            // A handler may drop the last registration from the listener thread itself
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                log::warn!("Change listener {} thread panicked", self.shared.object_name);
            }
        }

        if let Err(e) = self.shared.database.remove_listener(&self.shared.object_name) {
            log::warn!(
                "Failed to remove change listener {}: {e}",
                self.shared.object_name
            );
        }
    }
}

// ============================================================================
// Status handle
// ============================================================================

struct StatusInner {
    database: Arc<ConfigurationDatabase>,
    namespace: Arc<dyn ObjectNamespace>,
    settings: Settings,
    registrations: Arc<Mutex<Registrations>>,
    listener: Mutex<Option<ChangeListener>>,
}

impl StatusInner {
    /// Drop the listener once nothing is registered; caller holds no locks
    fn unregister(&self, id: u64) {
        let stopped = {
            let mut listener = self.listener.lock();
            let mut registrations = self.registrations.lock();
            registrations.set_handlers.retain(|(handler_id, _, _)| *handler_id != id);
            registrations.change_handlers.retain(|(handler_id, _)| *handler_id != id);
            if registrations.is_empty() {
                listener.take()
            } else {
                None
            }
        };
        drop(stopped);
    }
}

/// Status reads, writes and change registrations
///
/// Cheap to clone; clones share registrations and the listener.
#[derive(Clone)]
pub struct ConfigurationStatus {
    inner: Arc<StatusInner>,
}

impl ConfigurationStatus {
    pub fn new(
        database: Arc<ConfigurationDatabase>,
        namespace: Arc<dyn ObjectNamespace>,
        settings: Settings,
    ) -> Self {
        Self {
            inner: Arc::new(StatusInner {
                database,
                namespace,
                settings,
                registrations: Arc::new(Mutex::new(Registrations::default())),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Status over the database the settings point at
    pub fn from_settings(settings: Settings, namespace: Arc<dyn ObjectNamespace>) -> Result<Self> {
        let options = settings
            .database_options()
            .map_err(Error::Settings)?;
        let database = Arc::new(ConfigurationDatabase::new(options));
        Ok(Self::new(database, namespace, settings))
    }

    pub fn database(&self) -> &Arc<ConfigurationDatabase> {
        &self.inner.database
    }

    pub fn namespace(&self) -> &Arc<dyn ObjectNamespace> {
        &self.inner.namespace
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// A sequencer over this status' database and namespace
    pub fn create_sequencer(&self) -> ConfigurationSequencer {
        ConfigurationSequencer::new(
            Arc::clone(&self.inner.database),
            Arc::clone(&self.inner.namespace),
            self.inner.settings.queue_poll_interval(),
        )
    }

    // Reads never create the database

    pub fn get_set_state(&self, set_instance_identifier: &Uuid) -> Result<SetState> {
        self.inner.database.ensure_opened(false)?;
        Ok(self.inner.database.get_set_state(set_instance_identifier)?)
    }

    pub fn get_set_first_apply(&self, set_instance_identifier: &Uuid) -> Result<Option<DateTime<Utc>>> {
        self.inner.database.ensure_opened(false)?;
        Ok(self.inner.database.get_set_first_apply(set_instance_identifier)?)
    }

    pub fn get_set_apply_begun(&self, set_instance_identifier: &Uuid) -> Result<Option<DateTime<Utc>>> {
        self.inner.database.ensure_opened(false)?;
        Ok(self.inner.database.get_set_apply_begun(set_instance_identifier)?)
    }

    pub fn get_set_apply_ended(&self, set_instance_identifier: &Uuid) -> Result<Option<DateTime<Utc>>> {
        self.inner.database.ensure_opened(false)?;
        Ok(self.inner.database.get_set_apply_ended(set_instance_identifier)?)
    }

    pub fn get_unit_state(&self, unit_instance_identifier: &Uuid) -> Result<UnitState> {
        self.inner.database.ensure_opened(false)?;
        Ok(self.inner.database.get_unit_state(unit_instance_identifier)?)
    }

    pub fn get_unit_result_information(
        &self,
        unit_instance_identifier: &Uuid,
    ) -> Result<Option<ResultInformation>> {
        self.inner.database.ensure_opened(false)?;
        Ok(self
            .inner
            .database
            .get_unit_result_information(unit_instance_identifier)?)
    }

    // Writes: open listeners, write, then wake them

    fn write_and_signal(
        &self,
        write: impl FnOnce(&ConfigurationDatabase) -> history::Result<()>,
    ) -> Result<()> {
        let database = &self.inner.database;
        database.ensure_opened(true)?;
        let signaler = ChangeSignaler::prepare(database, self.inner.namespace.as_ref())?;
        write(database)?;
        signaler.signal();
        Ok(())
    }

    pub fn update_set_state(&self, set_instance_identifier: &Uuid, state: SetState) -> Result<()> {
        self.write_and_signal(|db| db.update_set_state(set_instance_identifier, state))
    }

    pub fn update_set_in_queue(&self, set_instance_identifier: &Uuid, in_queue: bool) -> Result<()> {
        self.write_and_signal(|db| db.update_set_in_queue(set_instance_identifier, in_queue))
    }

    pub fn update_unit_state(
        &self,
        set_instance_identifier: &Uuid,
        unit_instance_identifier: &Uuid,
        state: UnitState,
        result: Option<&ResultInformation>,
    ) -> Result<()> {
        self.write_and_signal(|db| {
            db.update_unit_state(set_instance_identifier, unit_instance_identifier, state, result)
        })
    }

    // Registrations

    fn register(&self, add: impl FnOnce(&mut Registrations, u64)) -> Result<u64> {
        self.inner.database.ensure_opened(true)?;

        let mut listener = self.inner.listener.lock();
        if listener.is_none() {
            *listener = Some(ChangeListener::start(
                Arc::clone(&self.inner.database),
                self.inner.namespace.as_ref(),
                Arc::clone(&self.inner.registrations),
                self.inner.settings.listener_wait_timeout(),
            )?);
        }

        let mut registrations = self.inner.registrations.lock();
        let id = registrations.next_id;
        registrations.next_id += 1;
        add(&mut registrations, id);
        Ok(id)
    }

    /// Call `handler` for every status change of one set and its units
    pub fn register_for_set_change(
        &self,
        set_instance_identifier: Uuid,
        handler: impl Fn(&SetChange) + Send + Sync + 'static,
    ) -> Result<SetChangeRegistration> {
        let id = self.register(|registrations, id| {
            registrations
                .set_handlers
                .push((id, set_instance_identifier, Arc::new(handler)));
        })?;
        Ok(SetChangeRegistration {
            registration: Registration::new(&self.inner, id),
            set_instance_identifier,
        })
    }

    /// Call `handler` whenever any set is added, changes state or leaves the queue
    pub fn register_for_change(
        &self,
        handler: impl Fn(&ConfigurationChange) + Send + Sync + 'static,
    ) -> Result<ChangeRegistration> {
        let id = self.register(|registrations, id| {
            registrations.change_handlers.push((id, Arc::new(handler)));
        })?;
        Ok(ChangeRegistration {
            registration: Registration::new(&self.inner, id),
        })
    }

    pub fn has_set_change_registration(&self, set_instance_identifier: &Uuid) -> bool {
        self.inner.registrations.lock().has_set(set_instance_identifier)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    /// Deliver pending changes now instead of waiting for the listener thread
    pub fn process_changes(&self) {
        let shared = self
            .inner
            .listener
            .lock()
            .as_ref()
            .map(|listener| Arc::clone(&listener.shared));
        if let Some(shared) = shared {
            shared.process_changes();
        }
    }
}

impl std::fmt::Debug for ConfigurationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationStatus")
            .field("database", &self.inner.database)
            .field("listening", &self.is_listening())
            .finish()
    }
}

struct Registration {
    status: Weak<StatusInner>,
    id: u64,
}

impl Registration {
    fn new(status: &Arc<StatusInner>, id: u64) -> Self {
        Self {
            status: Arc::downgrade(status),
            id,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(status) = self.status.upgrade() {
            status.unregister(self.id);
        }
    }
}

/// Keeps a set change handler registered while alive
#[must_use = "the handler is unregistered when the registration is dropped"]
pub struct SetChangeRegistration {
    registration: Registration,
    set_instance_identifier: Uuid,
}

impl SetChangeRegistration {
    pub fn set_instance_identifier(&self) -> Uuid {
        self.set_instance_identifier
    }
}

impl std::fmt::Debug for SetChangeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetChangeRegistration")
            .field("id", &self.registration.id)
            .field("set", &self.set_instance_identifier)
            .finish()
    }
}

/// Keeps a processor-wide change handler registered while alive
#[must_use = "the handler is unregistered when the registration is dropped"]
pub struct ChangeRegistration {
    registration: Registration,
}

impl std::fmt::Debug for ChangeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeRegistration")
            .field("id", &self.registration.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::named::LocalNamespace;
    use declarative::{ConfigurationUnit, ResultSource, codes};
    use history::DatabaseOptions;
    use std::sync::mpsc;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn status(tmp: &TempDir) -> ConfigurationStatus {
        let _ = env_logger::builder().is_test(true).try_init();
        let settings = Settings {
            listener_wait_timeout_ms: 20,
            ..Settings::default()
        };
        let database = Arc::new(ConfigurationDatabase::new(DatabaseOptions::new(
            tmp.path().join("History").join("config.db"),
        )));
        ConfigurationStatus::new(database, Arc::new(LocalNamespace::new()), settings)
    }

    fn stored_set(status: &ConfigurationStatus) -> ConfigurationSet {
        status.database().ensure_opened(true).unwrap();
        let set = ConfigurationSet::new("watched")
            .with_units(vec![ConfigurationUnit::new("git", "Git/Install")]);
        status.database().write_set_history(&set).unwrap();
        set
    }

    #[test]
    fn test_reads_do_not_create_database() {
        let tmp = TempDir::new().unwrap();
        let status = status(&tmp);
        let id = Uuid::new_v4();

        assert_eq!(status.get_set_state(&id).unwrap(), SetState::Unknown);
        assert_eq!(status.get_unit_state(&id).unwrap(), UnitState::Unknown);
        assert!(status.get_set_first_apply(&id).unwrap().is_none());
        assert!(status.get_unit_result_information(&id).unwrap().is_none());
        assert!(!status.database().is_open());
        assert!(!tmp.path().join("History").exists());
    }

    #[test]
    fn test_writes_and_reads() {
        let tmp = TempDir::new().unwrap();
        let status = status(&tmp);
        let set = stored_set(&status);
        let unit = set.units[0].instance_identifier;

        status.update_set_in_queue(&set.instance_identifier, true).unwrap();
        status.update_set_state(&set.instance_identifier, SetState::InProgress).unwrap();
        let result = ResultInformation::new(codes::S_OK, ResultSource::None);
        status
            .update_unit_state(&set.instance_identifier, &unit, UnitState::Completed, Some(&result))
            .unwrap();

        assert_eq!(status.get_set_state(&set.instance_identifier).unwrap(), SetState::InProgress);
        assert_eq!(status.get_unit_state(&unit).unwrap(), UnitState::Completed);
        assert_eq!(status.get_unit_result_information(&unit).unwrap(), Some(result));
        assert!(status.get_set_apply_begun(&set.instance_identifier).unwrap().is_some());
        assert!(status.get_set_apply_ended(&set.instance_identifier).unwrap().is_none());
    }

    #[test]
    fn test_set_change_registration_receives_changes() {
        let tmp = TempDir::new().unwrap();
        let status = status(&tmp);
        let set = stored_set(&status);
        let unit = set.units[0].instance_identifier;

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let registration = status
            .register_for_set_change(set.instance_identifier, move |change| {
                tx.lock().send(change.clone()).unwrap();
            })
            .unwrap();
        assert!(status.is_listening());
        assert!(status.has_set_change_registration(&set.instance_identifier));
        assert_eq!(registration.set_instance_identifier(), set.instance_identifier);

        status.update_set_state(&set.instance_identifier, SetState::Pending).unwrap();
        let change = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(change.state, ChangeState::Set(SetState::Pending));
        assert_eq!(change.unit_instance_identifier, None);

        status
            .update_unit_state(&set.instance_identifier, &unit, UnitState::InProgress, None)
            .unwrap();
        let change = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(change.state, ChangeState::Unit(UnitState::InProgress));
        assert_eq!(change.unit_instance_identifier, Some(unit));
        assert_eq!(change.result_information, None);

        drop(registration);
        assert!(!status.is_listening());
        assert!(status.database().get_change_listeners().unwrap().is_empty());
    }

    #[test]
    fn test_change_registration_kinds() {
        let tmp = TempDir::new().unwrap();
        let status = status(&tmp);
        let set = stored_set(&status);
        let id = set.instance_identifier;

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _registration = status
            .register_for_change(move |change| {
                tx.lock().send(change.clone()).unwrap();
            })
            .unwrap();

        status.update_set_in_queue(&id, true).unwrap();
        let added = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(added.kind, ChangeKind::SetAdded);
        assert_eq!(added.set.as_ref().map(|s| s.name.as_str()), Some("watched"));

        status.update_set_state(&id, SetState::Completed).unwrap();
        let changed = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(changed.kind, ChangeKind::SetStateChanged);
        assert_eq!(changed.state, SetState::Completed);

        status.update_set_in_queue(&id, false).unwrap();
        let removed = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(removed.kind, ChangeKind::SetRemoved);
    }

    #[test]
    fn test_fan_out_to_every_registration() {
        let tmp = TempDir::new().unwrap();
        let status = status(&tmp);
        let set = stored_set(&status);

        let (tx, rx) = mpsc::channel();
        let registrations: Vec<_> = (0..3)
            .map(|n| {
                let tx = Mutex::new(tx.clone());
                status
                    .register_for_set_change(set.instance_identifier, move |_| {
                        tx.lock().send(n).unwrap();
                    })
                    .unwrap()
            })
            .collect();
        assert_eq!(status.database().get_change_listeners().unwrap().len(), 1);

        status.update_set_state(&set.instance_identifier, SetState::Pending).unwrap();
        let mut seen: Vec<i32> = (0..3).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);

        drop(registrations);
        assert!(!status.is_listening());
    }

    #[test]
    fn test_listener_in_other_status_instance() {
        // Two handles over one database and namespace, as two processes would have
        let tmp = TempDir::new().unwrap();
        let writer = status(&tmp);
        let set = stored_set(&writer);
        let reader = ConfigurationStatus::new(
            Arc::new(ConfigurationDatabase::new(DatabaseOptions::new(
                tmp.path().join("History").join("config.db"),
            ))),
            Arc::clone(writer.namespace()),
            writer.settings().clone(),
        );

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _registration = reader
            .register_for_set_change(set.instance_identifier, move |change| {
                tx.lock().send(change.state).unwrap();
            })
            .unwrap();

        writer.update_set_state(&set.instance_identifier, SetState::InProgress).unwrap();
        writer.update_set_state(&set.instance_identifier, SetState::Completed).unwrap();

        // Changes may be coalesced into one pull but are never lost or reordered
        let first = rx.recv_timeout(TIMEOUT).unwrap();
        let states = if first == ChangeState::Set(SetState::Completed) {
            vec![first]
        } else {
            vec![first, rx.recv_timeout(TIMEOUT).unwrap()]
        };
        assert_eq!(states.last(), Some(&ChangeState::Set(SetState::Completed)));
    }

    #[test]
    fn test_process_changes_on_demand() {
        let tmp = TempDir::new().unwrap();
        let status = status(&tmp);
        let set = stored_set(&status);

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _registration = status
            .register_for_set_change(set.instance_identifier, move |change| {
                tx.lock().send(change.state).unwrap();
            })
            .unwrap();

        // Written behind the listener's back; no signal is sent
        status
            .database()
            .update_set_state(&set.instance_identifier, SetState::Pending)
            .unwrap();
        status.process_changes();

        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChangeState::Set(SetState::Pending)
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pull_after_each_write_sees_every_unit_state() {
        let tmp = TempDir::new().unwrap();
        let status = status(&tmp);
        let set = stored_set(&status);
        let unit = set.units[0].instance_identifier;

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _registration = status
            .register_for_set_change(set.instance_identifier, move |change| {
                tx.lock().send(change.state).unwrap();
            })
            .unwrap();

        // Each write replaces the unit's row; pulling in between keeps every state
        let states = [UnitState::Pending, UnitState::InProgress, UnitState::Completed];
        for state in states {
            status
                .database()
                .update_unit_state(&set.instance_identifier, &unit, state, None)
                .unwrap();
            status.process_changes();
        }

        let seen: Vec<_> = (0..states.len())
            .map(|_| rx.recv_timeout(TIMEOUT).unwrap())
            .collect();
        let expected: Vec<_> = states.into_iter().map(ChangeState::Unit).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_overwritten_unit_state_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let status = status(&tmp);
        let set = stored_set(&status);
        let unit = set.units[0].instance_identifier;

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _registration = status
            .register_for_set_change(set.instance_identifier, move |change| {
                tx.lock().send(change.state).unwrap();
            })
            .unwrap();

        // Both writes land before any pull, so only the latest row is left
        let database = status.database();
        database
            .update_unit_state(&set.instance_identifier, &unit, UnitState::InProgress, None)
            .unwrap();
        database
            .update_unit_state(&set.instance_identifier, &unit, UnitState::Completed, None)
            .unwrap();
        status.process_changes();

        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChangeState::Unit(UnitState::Completed)
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_single_flight_gate_coalesces() {
        let tmp = TempDir::new().unwrap();
        let status = status(&tmp);
        let set = stored_set(&status);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _registration = status
            .register_for_set_change(set.instance_identifier, move |change| {
                tx.lock().send(change.state).unwrap();
            })
            .unwrap();

        status
            .database()
            .update_set_state(&set.instance_identifier, SetState::Pending)
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let status = status.clone();
                thread::spawn(move || status.process_changes())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        status.process_changes();

        // Every pull advances the shared cursor, so the change is delivered once
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            ChangeState::Set(SetState::Pending)
        );
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}

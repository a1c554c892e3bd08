//! Signaling side of change notification
//!
//! Every change listener owns a pair of named manual-reset events,
//! `<object_name>_0` and `<object_name>_1`. The listener waits on one of
//! them at a time and resets the other before switching to it. A status
//! writer opens every listener's pair before it writes, and sets both
//! after the write committed, so a listener never wakes before the data it
//! is woken for can be read.

use crate::error::Result;
use crate::named::{ObjectNamespace, process_exists};
use history::ConfigurationDatabase;
use std::sync::Arc;
use std::time::Duration;

/// A named event that stays signaled until reset
pub trait ManualResetEvent: Send + Sync {
    fn set(&self);

    fn reset(&self);

    /// Wait for the event; `false` on timeout
    fn wait_timeout(&self, timeout: Duration) -> bool;

    fn is_set(&self) -> bool;
}

/// Names of the two events of a listener
pub fn event_names(object_name: &str) -> [String; 2] {
    [format!("{object_name}_0"), format!("{object_name}_1")]
}

/// Wakes change listeners around one status mutation
#[derive(Default)]
pub struct ChangeSignaler {
    events: Vec<Arc<dyn ManualResetEvent>>,
}

impl ChangeSignaler {
    /// Open every registered listener's events
    ///
    /// Listeners whose events are gone, and whose owner cannot still be
    /// running, are removed from the database.
    pub fn prepare(database: &ConfigurationDatabase, namespace: &dyn ObjectNamespace) -> Result<Self> {
        let mut events = Vec::new();

        for listener in database.get_change_listeners()? {
            let [first, second] = event_names(&listener.object_name);
            if let (Some(a), Some(b)) = (namespace.open_event(&first), namespace.open_event(&second)) {
                events.push(a);
                events.push(b);
                continue;
            }

            let ours = listener.process_id == std::process::id();
            if ours || !process_exists(listener.process_id) {
                log::debug!("Removing stale change listener {}", listener.object_name);
                if let Err(e) = database.remove_listener(&listener.object_name) {
                    log::warn!(
                        "Failed to remove change listener {}: {e}",
                        listener.object_name
                    );
                }
            }
        }

        Ok(Self { events })
    }

    /// Number of listener events that will be set
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Wake the listeners; call only after the mutation committed
    pub fn signal(self) {
        for event in &self.events {
            event.set();
        }
    }
}

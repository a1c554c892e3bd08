//! One set apply at a time per machine
//!
//! Two pieces work together. The named mutex [`QUEUE_MUTEX_NAME`] says who
//! may apply right now. The `queue` table records waiting operations in
//! arrival order, each tied to a named object that lives exactly as long as
//! the operation does. An operation runs only while it holds the mutex *and*
//! is first in the queue; queue rows whose operation died are pruned when
//! the queue is inspected.

use crate::error::{Error, Result};
use crate::named::{AdvisoryLock, NamedObject, ObjectNamespace, process_exists};
use declarative::{CancellationToken, ConfigurationSet};
use history::{ConfigurationDatabase, QueueItem};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Name of the machine-wide apply mutex
pub const QUEUE_MUTEX_NAME: &str = "ConfigQueueApplyMutex";

/// Prefix of the per-operation queue object names
pub const QUEUE_ITEM_PREFIX: &str = "ConfigQueueItem_";

/// Queues and serializes one apply operation
///
/// Dropping the sequencer releases the mutex and removes the queue row.
pub struct ConfigurationSequencer {
    database: Arc<ConfigurationDatabase>,
    namespace: Arc<dyn ObjectNamespace>,
    poll_interval: Duration,
    queue_item: Option<NamedObject>,
    mutex: Option<Arc<dyn AdvisoryLock>>,
    holds_mutex: bool,
}

impl ConfigurationSequencer {
    pub fn new(
        database: Arc<ConfigurationDatabase>,
        namespace: Arc<dyn ObjectNamespace>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            database,
            namespace,
            poll_interval,
            queue_item: None,
            mutex: None,
            holds_mutex: false,
        }
    }

    /// Name of this operation's queue object, once enqueued
    pub fn object_name(&self) -> Option<&str> {
        self.queue_item.as_ref().map(NamedObject::name)
    }

    /// Whether this operation currently holds the apply mutex
    pub fn holds_mutex(&self) -> bool {
        self.holds_mutex
    }

    /// Add the operation to the queue
    ///
    /// Returns `true` if the caller must [`wait`](Self::wait); `false` if it
    /// already holds the mutex and is first in line.
    pub fn enqueue(&mut self, set: &ConfigurationSet) -> Result<bool> {
        let object_name = format!("{QUEUE_ITEM_PREFIX}{}", Uuid::new_v4());
        let queue_item = self.namespace.create_object(&object_name)?;
        self.database
            .add_queue_item(&set.instance_identifier, &object_name)?;
        self.queue_item = Some(queue_item);
        log::debug!("Queued set {} as {object_name}", set.instance_identifier);

        let mutex = self.namespace.create_mutex(QUEUE_MUTEX_NAME)?;
        self.mutex = Some(Arc::clone(&mutex));

        if mutex.try_acquire(&object_name) {
            self.holds_mutex = true;
            if self.is_front_of_queue()? {
                self.database.set_active_queue_item(&object_name)?;
                return Ok(false);
            }
            // Someone queued earlier is still alive; let it have the mutex
            self.release_mutex();
        }

        Ok(true)
    }

    /// Block until this operation may apply
    ///
    /// Returns [`Error::Cancelled`] if `cancellation` fires first.
    pub fn wait(&mut self, cancellation: &CancellationToken) -> Result<()> {
        let (Some(mutex), Some(object_name)) = (self.mutex.clone(), self.object_name().map(str::to_string))
        else {
            return Err(Error::named_object(QUEUE_MUTEX_NAME, "wait called before enqueue"));
        };

        loop {
            if !self.holds_mutex {
                if !mutex.acquire(&object_name, cancellation) {
                    return Err(Error::Cancelled);
                }
                self.holds_mutex = true;
            }

            if self.is_front_of_queue()? {
                self.database.set_active_queue_item(&object_name)?;
                log::debug!("{object_name} is at the front of the queue");
                return Ok(());
            }

            self.release_mutex();
            if cancellation.wait_timeout(self.poll_interval) {
                return Err(Error::Cancelled);
            }
        }
    }

    /// Whether this operation is first among the live queue entries
    ///
    /// Entries ahead of it whose operation is gone are removed.
    pub fn is_front_of_queue(&self) -> Result<bool> {
        let Some(object_name) = self.object_name() else {
            return Ok(false);
        };

        for item in self.database.get_queue_items()? {
            if item.object_name == object_name {
                return Ok(true);
            }
            if self.is_live(&item) {
                log::debug!("{object_name} is waiting behind {}", item.object_name);
                return Ok(false);
            }

            log::info!(
                "Removing abandoned queue entry {} (process {})",
                item.object_name,
                item.process_id
            );
            self.database.remove_queue_item(&item.object_name)?;
        }

        log::warn!("Queue entry {object_name} is missing; treating it as first");
        Ok(true)
    }

    fn is_live(&self, item: &QueueItem) -> bool {
        if item.process_id == std::process::id() {
            self.namespace.object_exists(&item.object_name)
        } else {
            process_exists(item.process_id)
        }
    }

    fn release_mutex(&mut self) {
        if let (true, Some(mutex), Some(object_name)) =
            (self.holds_mutex, self.mutex.as_ref(), self.queue_item.as_ref())
        {
            mutex.release(object_name.name());
        }
        self.holds_mutex = false;
    }
}

impl Drop for ConfigurationSequencer {
    fn drop(&mut self) {
        self.release_mutex();

        if let Some(queue_item) = self.queue_item.take() {
            if let Err(e) = self.database.remove_queue_item(queue_item.name()) {
                log::warn!("Failed to remove queue entry {}: {e}", queue_item.name());
            }
        }
    }
}

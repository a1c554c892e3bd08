//! Applying sets end to end
//!
//! [`ConfigurationProcessor`] ties the pieces together: history, the apply
//! queue, status recording and the apply engine itself.

use crate::error::{Error, Result};
use crate::status::ConfigurationStatus;
use declarative::{
    ApplySetResult, CancellationToken, ConfigurationSet, ConfigurationSetApplyProcessor,
    SetProcessorFactory, SetState, UnitResult,
};
use std::sync::Arc;

/// How [`ConfigurationProcessor::apply_set`] runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Validate the set's structure without touching the system, history or queue
    pub consistency_check_only: bool,
}

impl ApplyOptions {
    pub fn consistency_check() -> Self {
        Self {
            consistency_check_only: true,
        }
    }
}

pub struct ConfigurationProcessor {
    factory: Arc<dyn SetProcessorFactory>,
    status: ConfigurationStatus,
}

impl ConfigurationProcessor {
    pub fn new(factory: Arc<dyn SetProcessorFactory>, status: ConfigurationStatus) -> Self {
        Self { factory, status }
    }

    pub fn status(&self) -> &ConfigurationStatus {
        &self.status
    }

    /// Apply `set`, waiting for earlier applies on this machine to finish
    ///
    /// Unit failures are reported in the returned result. `Err` means the
    /// set could not be run at all: the provider session failed, the status
    /// store is unavailable, or `cancellation` fired.
    pub fn apply_set(
        &self,
        set: &ConfigurationSet,
        options: ApplyOptions,
        cancellation: &CancellationToken,
    ) -> Result<ApplySetResult> {
        let set_processor = self
            .factory
            .create_set_processor(set)
            .map_err(|e| Error::Apply(declarative::Error::SetProcessor(e)))?;

        if options.consistency_check_only {
            let mut progress = declarative::NoProgress;
            let mut apply = ConfigurationSetApplyProcessor::for_set(
                set,
                set_processor.as_ref(),
                &mut progress,
                cancellation,
            );
            apply.process(true)?;
            let result = apply.result();
            log::debug!(
                "Consistency check of set {} finished with {:#010x}",
                set.instance_identifier,
                result.result_code
            );
            return Ok(result);
        }

        let database = self.status.database();
        database.ensure_opened(true)?;
        database.write_set_history(set)?;

        let id = set.instance_identifier;
        let mut sequencer = self.status.create_sequencer();
        let must_wait = sequencer.enqueue(set)?;
        self.status.update_set_in_queue(&id, true)?;
        self.status.update_set_state(&id, SetState::Pending)?;

        if must_wait {
            log::info!("Set {id} is waiting for other configuration operations");
            if let Err(e) = sequencer.wait(cancellation) {
                self.end_early(set);
                return Err(e);
            }
        }

        self.status.update_set_state(&id, SetState::InProgress)?;
        log::info!("Applying set {} ({})", set.name, id);

        let status = &self.status;
        let mut record_progress = |result: &UnitResult| {
            let information = result.state.is_final().then_some(&result.result_information);
            if let Err(e) = status.update_unit_state(
                &id,
                &result.unit.instance_identifier,
                result.state,
                information,
            ) {
                log::warn!(
                    "Failed to record state of unit {}: {e}",
                    result.unit.identifier
                );
            }
        };

        let mut apply = ConfigurationSetApplyProcessor::for_set(
            set,
            set_processor.as_ref(),
            &mut record_progress,
            cancellation,
        );
        let outcome = apply.process(false);
        let result = apply.result();

        if let Err(e) = outcome {
            self.end_early(set);
            return Err(match e {
                declarative::Error::Cancelled => {
                    log::info!("Apply of set {id} was cancelled");
                    Error::Cancelled
                }
                other => other.into(),
            });
        }

        self.status.update_set_state(&id, SetState::Completed)?;
        self.status.update_set_in_queue(&id, false)?;
        drop(sequencer);

        let summary = result.summary();
        log::info!(
            "Set {id} finished with {:#010x}: {} applied, {} unchanged, {} checked, {} skipped, {} failed",
            result.result_code,
            summary.applied,
            summary.no_change,
            summary.checked,
            summary.skipped,
            summary.failed
        );
        Ok(result)
    }

    /// Mark a run that stopped before finishing as over and take it out of the queue
    fn end_early(&self, set: &ConfigurationSet) {
        let id = &set.instance_identifier;
        if let Err(e) = self.status.update_set_state(id, SetState::Completed) {
            log::warn!("Failed to record final state of set {id}: {e}");
        }
        if let Err(e) = self.status.update_set_in_queue(id, false) {
            log::warn!("Failed to take set {id} out of the queue: {e}");
        }
    }

    /// Every set this machine has applied
    pub fn get_set_history(&self) -> Result<Vec<ConfigurationSet>> {
        let database = self.status.database();
        database.ensure_opened(false)?;
        Ok(database.get_set_history()?)
    }

    pub fn remove_set_history(&self, set: &ConfigurationSet) -> Result<()> {
        let database = self.status.database();
        database.ensure_opened(false)?;
        Ok(database.remove_set_history(&set.instance_identifier)?)
    }
}

impl std::fmt::Debug for ConfigurationProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationProcessor")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

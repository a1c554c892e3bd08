//! Apply processor - validates a set's dependency graph and processes its
//! units in dependency and intent order

use crate::cancel::CancellationToken;
use crate::codes;
use crate::context::ProgressSink;
use crate::error::{Result, extract_result_information};
use crate::planner::{IdentifierMap, UnitInfo};
use crate::processor::SetProcessor;
use crate::set::ConfigurationSet;
use crate::types::{ApplySetResult, Intent, ResultSource, UnitResult, UnitState};
use crate::unit::ConfigurationUnit;

/// One intent pass of the ordering algorithm
struct IntentPass {
    name: &'static str,
    filter: fn(Intent) -> bool,
    /// Recorded on leftover units of other intents when this pass fails
    error_for_other_intents: i32,
    /// Overall result when a processed unit of this pass failed
    error_for_failures: i32,
}

/// Assert, then Inform, then Apply
const PASSES: [IntentPass; 3] = [
    IntentPass {
        name: "assert",
        filter: |intent| intent == Intent::Assert,
        error_for_other_intents: codes::ASSERTION_FAILED,
        error_for_failures: codes::ASSERTION_FAILED,
    },
    IntentPass {
        name: "inform",
        filter: |intent| intent == Intent::Inform,
        error_for_other_intents: codes::DEPENDENCY_UNSATISFIED,
        error_for_failures: codes::DEPENDENCY_UNSATISFIED,
    },
    IntentPass {
        name: "apply",
        filter: |intent| matches!(intent, Intent::Apply | Intent::Unknown),
        // No other intents remain after the apply pass
        error_for_other_intents: codes::E_FAIL,
        error_for_failures: codes::SET_APPLY_FAILED,
    },
];

/// Whether the ordering algorithm is validating or doing real work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Units are only marked preprocessed; no provider calls, no progress
    PreProcess,
    /// Units are processed through the set processor
    Process,
}

/// Applies the units of one set
///
/// The processor owns a snapshot of the units taken at construction, so the
/// caller's set may change while an apply is in flight.
pub struct ConfigurationSetApplyProcessor<'a> {
    set_processor: &'a dyn SetProcessor,
    progress: &'a mut dyn ProgressSink,
    cancellation: &'a CancellationToken,
    units: Vec<UnitInfo>,
    identifiers: IdentifierMap,
    result_code: i32,
    /// Results of group members, appended as their groups complete
    member_results: Vec<UnitResult>,
}

impl<'a> ConfigurationSetApplyProcessor<'a> {
    /// Create a processor over a snapshot of `units`
    pub fn new(
        units: &[ConfigurationUnit],
        set_processor: &'a dyn SetProcessor,
        progress: &'a mut dyn ProgressSink,
        cancellation: &'a CancellationToken,
    ) -> Self {
        Self {
            set_processor,
            progress,
            cancellation,
            units: units.iter().cloned().map(UnitInfo::new).collect(),
            identifiers: IdentifierMap::new(),
            result_code: codes::S_OK,
            member_results: Vec::new(),
        }
    }

    /// Create a processor for all top-level units of a set
    pub fn for_set(
        set: &ConfigurationSet,
        set_processor: &'a dyn SetProcessor,
        progress: &'a mut dyn ProgressSink,
        cancellation: &'a CancellationToken,
    ) -> Self {
        Self::new(&set.units, set_processor, progress, cancellation)
    }

    /// Validate the set and, unless `pre_process_only`, process every unit
    ///
    /// Unit failures are recorded in [`Self::result`]; `Err` is returned only
    /// when the operation was cancelled.
    pub fn process(&mut self, pre_process_only: bool) -> Result<()> {
        if self.pre_process() && !pre_process_only {
            self.process_all(Mode::Process)?;
        }
        Ok(())
    }

    /// Overall code plus one result per unit, in set order
    pub fn result(&self) -> ApplySetResult {
        ApplySetResult {
            result_code: self.result_code,
            unit_results: self
                .units
                .iter()
                .map(|info| info.result.clone())
                .chain(self.member_results.iter().cloned())
                .collect(),
        }
    }

    /// Validate identifiers and dependencies without touching the system
    ///
    /// Returns `false` if the set cannot be processed.
    pub fn pre_process(&mut self) -> bool {
        let mut valid = true;
        for index in 0..self.units.len() {
            if !self.add_unit_to_map(index) {
                valid = false;
            }
        }
        if !valid {
            self.result_code = codes::DUPLICATE_IDENTIFIER;
            return false;
        }

        for index in 0..self.units.len() {
            if !self.resolve_dependencies(index) {
                valid = false;
            }
        }
        if !valid {
            self.mark_dependents_unsatisfied();
            self.result_code = codes::MISSING_DEPENDENCY;
            return false;
        }

        // Simulate a fully successful run. Failing here means some units can
        // never become eligible: a cycle, or a dependency on a later intent.
        if !self.process_all(Mode::PreProcess).unwrap_or(false) {
            log::error!("Dependency graph cannot be satisfied in intent order");
            self.result_code = codes::SET_DEPENDENCY_CYCLE;
            return false;
        }

        true
    }

    fn add_unit_to_map(&mut self, index: usize) -> bool {
        let Some(existing) = self.identifiers.insert(&self.units[index].unit.identifier, index)
        else {
            return true;
        };

        log::error!(
            "Found duplicate identifier: {}",
            self.units[index].unit.identifier
        );
        self.units[existing].set_result(codes::DUPLICATE_IDENTIFIER, ResultSource::ConfigurationSet);
        if self.units[existing].result.state != UnitState::Completed {
            self.send_progress(existing, UnitState::Completed);
        }
        self.units[index].set_result(codes::DUPLICATE_IDENTIFIER, ResultSource::ConfigurationSet);
        self.send_progress(index, UnitState::Completed);
        false
    }

    fn resolve_dependencies(&mut self, index: usize) -> bool {
        let dependencies = self.units[index].unit.dependencies.clone();
        for dependency in dependencies.iter().filter(|d| !d.is_empty()) {
            match self.identifiers.resolve(dependency) {
                Some(target) => self.units[index].dependency_indices.push(target),
                None => {
                    log::error!("Found missing dependency: {dependency}");
                    let info = &mut self.units[index];
                    info.set_result(codes::MISSING_DEPENDENCY, ResultSource::ConfigurationSet);
                    info.result.result_information.details = dependency.clone();
                    self.send_progress(index, UnitState::Completed);
                    return false;
                }
            }
        }
        true
    }

    /// Mark every unit that transitively depends on a failed unit
    fn mark_dependents_unsatisfied(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            for index in 0..self.units.len() {
                let info = &self.units[index];
                if !info.result.is_success() {
                    continue;
                }
                let blocked = info
                    .dependency_indices
                    .iter()
                    .any(|&dep| !self.units[dep].result.is_success());
                if blocked {
                    self.units[index]
                        .set_result(codes::DEPENDENCY_UNSATISFIED, ResultSource::Precondition);
                    self.send_progress(index, UnitState::Skipped);
                    changed = true;
                }
            }
        }
    }

    /// Run the three intent passes; `Ok(false)` if one of them failed
    fn process_all(&mut self, mode: Mode) -> Result<bool> {
        let mut candidates: Vec<usize> = (0..self.units.len()).collect();
        for pass in &PASSES {
            if !self.process_intent(&mut candidates, mode, pass)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Process every candidate of one intent whose dependencies are satisfied
    ///
    /// Always takes the first eligible unit in declaration order, then
    /// rescans from the start. Leftovers of this intent never became
    /// eligible; they and, on any failure, all other leftovers are skipped.
    fn process_intent(
        &mut self,
        candidates: &mut Vec<usize>,
        mode: Mode,
        pass: &IntentPass,
    ) -> Result<bool> {
        let send_progress = mode == Mode::Process;
        let mut has_failure = false;

        while let Some(position) = candidates
            .iter()
            .position(|&index| self.is_eligible(index, mode, pass))
        {
            let index = candidates.remove(position);
            let succeeded = match mode {
                Mode::PreProcess => {
                    self.units[index].preprocessed = true;
                    true
                }
                Mode::Process => self.process_unit(index)?,
            };
            if !succeeded {
                has_failure = true;
            }
        }

        let mut has_remaining = false;
        for &index in candidates.iter() {
            if (pass.filter)(self.units[index].intent()) {
                has_remaining = true;
                self.skip_unit(index, codes::DEPENDENCY_UNSATISFIED, send_progress);
            }
        }

        if !has_failure && !has_remaining {
            return Ok(true);
        }

        for &index in candidates.iter() {
            if !(pass.filter)(self.units[index].intent()) {
                self.skip_unit(index, pass.error_for_other_intents, send_progress);
            }
        }

        self.result_code = if has_failure {
            pass.error_for_failures
        } else {
            codes::DEPENDENCY_UNSATISFIED
        };
        if send_progress {
            log::info!(
                "The {} pass failed: {}",
                pass.name,
                codes::describe(self.result_code)
            );
        }
        Ok(false)
    }

    fn is_eligible(&self, index: usize, mode: Mode, pass: &IntentPass) -> bool {
        let info = &self.units[index];
        (pass.filter)(info.intent())
            && info.dependency_indices.iter().all(|&dep| {
                let dependency = &self.units[dep];
                match mode {
                    Mode::PreProcess => dependency.preprocessed,
                    Mode::Process => dependency.has_processed_successfully(),
                }
            })
    }

    fn skip_unit(&mut self, index: usize, code: i32, send_progress: bool) {
        self.units[index].set_result(code, ResultSource::Precondition);
        if send_progress {
            self.send_progress(index, UnitState::Skipped);
        } else {
            self.units[index].set_state(UnitState::Skipped);
        }
    }

    /// Process one unit; `Ok(false)` if it failed
    fn process_unit(&mut self, index: usize) -> Result<bool> {
        self.cancellation.check()?;

        // Counts as processed even if creating the unit processor fails
        self.units[index].processed = true;

        if !self.units[index].unit.is_active {
            // Blocks dependents, but is not a failure of the set
            log::debug!("Skipping inactive unit {}", self.units[index].unit.identifier);
            self.units[index].set_result(codes::MANUALLY_SKIPPED, ResultSource::Precondition);
            self.send_progress(index, UnitState::Skipped);
            return Ok(true);
        }

        self.send_progress(index, UnitState::InProgress);
        let outcome = if self.units[index].unit.is_group() {
            self.run_group(index)
        } else {
            self.run_unit(index)
        };
        self.send_progress(index, UnitState::Completed);
        outcome
    }

    fn run_unit(&mut self, index: usize) -> Result<bool> {
        let created = self
            .set_processor
            .create_unit_processor(&self.units[index].unit);
        let mut processor = match created {
            Ok(processor) => processor,
            Err(e) => return Ok(self.record_error(index, &e)),
        };

        // Creating the processor may take a while
        self.cancellation.check()?;

        match self.units[index].intent() {
            Intent::Assert => match processor.test_settings() {
                Ok(true) => Ok(true),
                Ok(false) => {
                    self.units[index].set_result(codes::ASSERTION_FAILED, ResultSource::Precondition);
                    Ok(false)
                }
                Err(e) => Ok(self.record_error(index, &e)),
            },
            Intent::Inform => match processor.get_settings() {
                Ok(_) => Ok(true),
                Err(e) => Ok(self.record_error(index, &e)),
            },
            Intent::Apply | Intent::Unknown => match processor.test_settings() {
                Ok(true) => {
                    let info = &mut self.units[index];
                    info.set_result(codes::S_FALSE, ResultSource::None);
                    info.result.previously_in_desired_state = true;
                    Ok(true)
                }
                Ok(false) => {
                    self.cancellation.check()?;
                    match processor.apply_settings() {
                        Ok(outcome) => {
                            self.units[index].result.reboot_required = outcome.reboot_required;
                            Ok(true)
                        }
                        Err(e) => Ok(self.record_error(index, &e)),
                    }
                }
                Err(e) => Ok(self.record_error(index, &e)),
            },
        }
    }

    /// Process a group's members with a nested processor
    fn run_group(&mut self, index: usize) -> Result<bool> {
        let members = self.units[index].unit.units().to_vec();
        let nested_result = {
            let mut nested = ConfigurationSetApplyProcessor::new(
                &members,
                self.set_processor,
                &mut *self.progress,
                self.cancellation,
            );
            nested.process(false)?;
            nested.result()
        };

        let previously_in_desired_state = nested_result
            .unit_results
            .iter()
            .all(|r| r.previously_in_desired_state);
        let reboot_required = nested_result.reboot_required();
        let succeeded = nested_result.is_success();

        let info = &mut self.units[index];
        info.result.previously_in_desired_state = previously_in_desired_state;
        if succeeded {
            info.set_result(nested_result.result_code, ResultSource::None);
            info.result.reboot_required = reboot_required;
        } else {
            info.set_result(nested_result.result_code, ResultSource::UnitProcessing);
        }
        self.member_results.extend(nested_result.unit_results);
        Ok(succeeded)
    }

    /// Record a provider error on a unit; always a failure
    fn record_error(&mut self, index: usize, error: &anyhow::Error) -> bool {
        let info = &mut self.units[index];
        log::warn!("Unit {} failed: {error:#}", info.unit.identifier);
        info.result.result_information = extract_result_information(error);
        false
    }

    fn send_progress(&mut self, index: usize, state: UnitState) {
        self.units[index].set_state(state);
        self.progress.on_unit_state(&self.units[index].result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::error::{Error, UnitFailure};
    use crate::processor::UnitProcessor;
    use crate::types::ApplySettingsOutcome;
    use crate::unit::ValueSet;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, Default)]
    enum Behavior {
        /// Unsatisfied until applied
        #[default]
        NeedsApply,
        Satisfied,
        TestError,
        ApplyFailure(i32),
        ApplyError,
        Reboot,
        CreateError,
    }

    /// Provider stub recording every call as `"<op>:<identifier>"`
    #[derive(Default, Clone)]
    struct Stub {
        behaviors: HashMap<String, Behavior>,
        calls: Arc<Mutex<Vec<String>>>,
        applied: Arc<Mutex<HashSet<String>>>,
    }

    impl Stub {
        fn with(mut self, identifier: &str, behavior: Behavior) -> Self {
            self.behaviors.insert(identifier.to_string(), behavior);
            self
        }

        fn count(&self, call: &str) -> usize {
            self.calls.lock().iter().filter(|c| *c == call).count()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    struct StubUnit {
        identifier: String,
        behavior: Behavior,
        calls: Arc<Mutex<Vec<String>>>,
        applied: Arc<Mutex<HashSet<String>>>,
    }

    impl UnitProcessor for StubUnit {
        fn test_settings(&mut self) -> anyhow::Result<bool> {
            self.calls.lock().push(format!("test:{}", self.identifier));
            match self.behavior {
                Behavior::Satisfied => Ok(true),
                Behavior::TestError => anyhow::bail!("probe crashed"),
                _ => Ok(self.applied.lock().contains(&self.identifier)),
            }
        }

        fn get_settings(&mut self) -> anyhow::Result<ValueSet> {
            self.calls.lock().push(format!("get:{}", self.identifier));
            Ok(ValueSet::new())
        }

        fn apply_settings(&mut self) -> anyhow::Result<ApplySettingsOutcome> {
            self.calls.lock().push(format!("apply:{}", self.identifier));
            match self.behavior {
                Behavior::ApplyFailure(code) => {
                    Err(UnitFailure::new(code, "apply failed").with_details("stub").into())
                }
                Behavior::ApplyError => anyhow::bail!("boom"),
                behavior => {
                    self.applied.lock().insert(self.identifier.clone());
                    Ok(ApplySettingsOutcome {
                        reboot_required: matches!(behavior, Behavior::Reboot),
                    })
                }
            }
        }
    }

    impl SetProcessor for Stub {
        fn create_unit_processor(
            &self,
            unit: &ConfigurationUnit,
        ) -> anyhow::Result<Box<dyn UnitProcessor>> {
            let behavior = self
                .behaviors
                .get(&unit.identifier)
                .copied()
                .unwrap_or_default();
            if matches!(behavior, Behavior::CreateError) {
                anyhow::bail!("no provider for {}", unit.unit_type);
            }
            Ok(Box::new(StubUnit {
                identifier: unit.identifier.clone(),
                behavior,
                calls: Arc::clone(&self.calls),
                applied: Arc::clone(&self.applied),
            }))
        }
    }

    fn unit(identifier: &str) -> ConfigurationUnit {
        ConfigurationUnit::new(identifier, "Test/Resource")
    }

    fn run(units: &[ConfigurationUnit], stub: &Stub) -> ApplySetResult {
        let _ = env_logger::builder().is_test(true).try_init();
        let token = CancellationToken::new();
        let mut progress = NoProgress;
        let mut processor = ConfigurationSetApplyProcessor::new(units, stub, &mut progress, &token);
        processor.process(false).unwrap();
        processor.result()
    }

    fn code_of(result: &ApplySetResult, identifier: &str) -> i32 {
        result.find(identifier).unwrap().result_information.code
    }

    #[test]
    fn test_dependencies_processed_first() {
        let stub = Stub::default();
        let units = [unit("c").depends_on("B"), unit("b").depends_on("a"), unit("a")];

        let result = run(&units, &stub);

        assert_eq!(result.result_code, codes::S_OK);
        let applies: Vec<_> = stub
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("apply:"))
            .collect();
        assert_eq!(applies, ["apply:a", "apply:b", "apply:c"]);
        for r in &result.unit_results {
            assert_eq!(r.state, UnitState::Completed);
            assert!(r.is_success());
        }
    }

    #[test]
    fn test_siblings_follow_declaration_order() {
        let stub = Stub::default();
        let units = [unit("z"), unit("y"), unit("x")];

        run(&units, &stub);

        let applies: Vec<_> = stub
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("apply:"))
            .collect();
        assert_eq!(applies, ["apply:z", "apply:y", "apply:x"]);
    }

    #[test]
    fn test_duplicate_identifiers_mark_both() {
        let stub = Stub::default();
        let units = [unit("Foo"), unit("bar"), unit("  FOO  ")];

        let result = run(&units, &stub);

        assert_eq!(result.result_code, codes::DUPLICATE_IDENTIFIER);
        assert_eq!(result.unit_results[0].result_information.code, codes::DUPLICATE_IDENTIFIER);
        assert_eq!(result.unit_results[2].result_information.code, codes::DUPLICATE_IDENTIFIER);
        assert_eq!(result.unit_results[0].result_information.source, ResultSource::ConfigurationSet);
        assert_eq!(code_of(&result, "bar"), codes::S_OK);
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn test_empty_identifiers_do_not_collide() {
        let stub = Stub::default();
        let result = run(&[unit(""), unit("")], &stub);
        assert_eq!(result.result_code, codes::S_OK);
        assert_eq!(stub.count("apply:"), 2);
    }

    #[test]
    fn test_missing_dependency() {
        let stub = Stub::default();
        let units = [
            unit("a").depends_on("nope"),
            unit("b").depends_on("a"),
            unit("c").depends_on("b"),
            unit("d").depends_on(""),
        ];

        let result = run(&units, &stub);

        assert_eq!(result.result_code, codes::MISSING_DEPENDENCY);
        let a = result.find("a").unwrap();
        assert_eq!(a.result_information.code, codes::MISSING_DEPENDENCY);
        assert_eq!(a.result_information.details, "nope");
        assert_eq!(code_of(&result, "b"), codes::DEPENDENCY_UNSATISFIED);
        assert_eq!(code_of(&result, "c"), codes::DEPENDENCY_UNSATISFIED);
        assert_eq!(code_of(&result, "d"), codes::S_OK);
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn test_cycle_detected_before_processing() {
        let stub = Stub::default();
        let units = [unit("a").depends_on("b"), unit("b").depends_on("a"), unit("c")];

        let result = run(&units, &stub);

        assert_eq!(result.result_code, codes::SET_DEPENDENCY_CYCLE);
        assert_eq!(code_of(&result, "a"), codes::DEPENDENCY_UNSATISFIED);
        assert_eq!(code_of(&result, "b"), codes::DEPENDENCY_UNSATISFIED);
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn test_assert_failure_blocks_apply() {
        let stub = Stub::default();
        let units = [unit("install"), unit("check").with_intent(Intent::Assert)];

        let result = run(&units, &stub);

        assert_eq!(result.result_code, codes::ASSERTION_FAILED);
        assert_eq!(stub.count("apply:install"), 0);
        let check = result.find("check").unwrap();
        assert_eq!(check.result_information.code, codes::ASSERTION_FAILED);
        assert_eq!(check.result_information.source, ResultSource::Precondition);
        let install = result.find("install").unwrap();
        assert_eq!(install.result_information.code, codes::ASSERTION_FAILED);
        assert_eq!(install.state, UnitState::Skipped);
    }

    #[test]
    fn test_intent_order_is_total() {
        let stub = Stub::default().with("check", Behavior::Satisfied);
        let units = [
            unit("install"),
            unit("read").with_intent(Intent::Inform),
            unit("check").with_intent(Intent::Assert),
        ];

        let result = run(&units, &stub);

        assert!(result.is_success());
        assert_eq!(
            stub.calls(),
            ["test:check", "get:read", "test:install", "apply:install"]
        );
    }

    #[test]
    fn test_assert_depending_on_apply_never_runs() {
        let stub = Stub::default();
        let units = [
            unit("install"),
            unit("check").with_intent(Intent::Assert).depends_on("install"),
        ];

        let result = run(&units, &stub);

        // Rejected while validating, like a cycle
        assert_eq!(result.result_code, codes::SET_DEPENDENCY_CYCLE);
        assert_eq!(code_of(&result, "check"), codes::DEPENDENCY_UNSATISFIED);
        assert_eq!(code_of(&result, "install"), codes::ASSERTION_FAILED);
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn test_apply_is_idempotent() {
        let stub = Stub::default();
        let units = [unit("a")];

        let first = run(&units, &stub);
        assert_eq!(code_of(&first, "a"), codes::S_OK);
        assert!(!first.unit_results[0].previously_in_desired_state);

        let second = run(&units, &stub);
        assert!(second.is_success());
        assert_eq!(code_of(&second, "a"), codes::S_FALSE);
        assert!(second.unit_results[0].previously_in_desired_state);
        assert_eq!(stub.count("apply:a"), 1);
    }

    #[test]
    fn test_satisfied_unit_reports_no_op_every_time() {
        let stub = Stub::default().with("a", Behavior::Satisfied);
        for _ in 0..2 {
            let result = run(&[unit("a")], &stub);
            assert!(result.is_success());
            assert_eq!(code_of(&result, "a"), codes::S_FALSE);
        }
        assert_eq!(stub.count("apply:a"), 0);
    }

    #[test]
    fn test_apply_failure_stops_dependents() {
        let stub = Stub::default().with("a", Behavior::ApplyFailure(codes::GET_FAILED));
        let units = [unit("a"), unit("b").depends_on("a"), unit("c")];

        let result = run(&units, &stub);

        assert_eq!(result.result_code, codes::SET_APPLY_FAILED);
        let a = result.find("a").unwrap();
        assert_eq!(a.result_information.code, codes::GET_FAILED);
        assert_eq!(a.result_information.details, "stub");
        assert_eq!(a.state, UnitState::Completed);
        assert_eq!(code_of(&result, "b"), codes::DEPENDENCY_UNSATISFIED);
        // Independent units still run within the same pass
        assert_eq!(stub.count("apply:c"), 1);
    }

    #[test]
    fn test_generic_errors_become_e_fail() {
        let stub = Stub::default()
            .with("a", Behavior::ApplyError)
            .with("b", Behavior::TestError)
            .with("c", Behavior::CreateError);
        let result = run(&[unit("a"), unit("b"), unit("c")], &stub);

        assert_eq!(result.result_code, codes::SET_APPLY_FAILED);
        for id in ["a", "b", "c"] {
            let info = &result.find(id).unwrap().result_information;
            assert_eq!(info.code, codes::E_FAIL);
            assert_eq!(info.source, ResultSource::Internal);
        }
        assert_eq!(result.find("a").unwrap().result_information.description, "boom");
    }

    #[test]
    fn test_inactive_unit_blocks_dependents() {
        let stub = Stub::default();
        let units = [unit("a").with_active(false), unit("b").depends_on("a"), unit("c")];

        let result = run(&units, &stub);

        let a = result.find("a").unwrap();
        assert_eq!(a.result_information.code, codes::MANUALLY_SKIPPED);
        assert_eq!(a.state, UnitState::Skipped);
        assert_eq!(code_of(&result, "b"), codes::DEPENDENCY_UNSATISFIED);
        assert_eq!(result.result_code, codes::DEPENDENCY_UNSATISFIED);
        assert_eq!(stub.count("test:a"), 0);
        assert_eq!(stub.count("apply:c"), 1);
    }

    #[test]
    fn test_unknown_intent_runs_with_apply() {
        let stub = Stub::default();
        let result = run(&[unit("a").with_intent(Intent::Unknown)], &stub);
        assert!(result.is_success());
        assert_eq!(stub.count("apply:a"), 1);
    }

    #[test]
    fn test_reboot_required_recorded() {
        let stub = Stub::default().with("a", Behavior::Reboot);
        let result = run(&[unit("a"), unit("b")], &stub);
        assert!(result.find("a").unwrap().reboot_required);
        assert!(!result.find("b").unwrap().reboot_required);
        assert!(result.reboot_required());
    }

    #[test]
    fn test_group_members_processed_and_appended() {
        let stub = Stub::default()
            .with("m1", Behavior::Satisfied)
            .with("m2", Behavior::Reboot);
        let units = [
            unit("group").with_units(vec![unit("m2").depends_on("m1"), unit("m1")]),
            unit("after").depends_on("group"),
        ];

        let result = run(&units, &stub);

        assert!(result.is_success());
        let ids: Vec<_> = result
            .unit_results
            .iter()
            .map(|r| r.unit.identifier.as_str())
            .collect();
        assert_eq!(ids, ["group", "after", "m2", "m1"]);

        let group = result.find("group").unwrap();
        assert!(!group.previously_in_desired_state);
        assert!(group.reboot_required);
        assert_eq!(group.state, UnitState::Completed);
        assert_eq!(stub.count("apply:m2"), 1);
        assert_eq!(stub.count("apply:after"), 1);
    }

    #[test]
    fn test_failing_group_fails_set() {
        let stub = Stub::default().with("m1", Behavior::ApplyError);
        let units = [
            unit("group").with_units(vec![unit("m1")]),
            unit("after").depends_on("group"),
        ];

        let result = run(&units, &stub);

        assert_eq!(result.result_code, codes::SET_APPLY_FAILED);
        assert_eq!(code_of(&result, "group"), codes::SET_APPLY_FAILED);
        assert_eq!(code_of(&result, "after"), codes::DEPENDENCY_UNSATISFIED);
    }

    #[test]
    fn test_pre_process_only_touches_nothing() {
        let stub = Stub::default();
        let token = CancellationToken::new();
        let mut progress = NoProgress;
        let units = [unit("a"), unit("b").depends_on("a")];
        let mut processor = ConfigurationSetApplyProcessor::new(&units, &stub, &mut progress, &token);

        processor.process(true).unwrap();

        let result = processor.result();
        assert!(result.is_success());
        assert!(result.unit_results.iter().all(|r| r.state == UnitState::Pending));
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn test_progress_reports_transitions() {
        let stub = Stub::default();
        let token = CancellationToken::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let mut sink = move |result: &UnitResult| {
            sink_events
                .lock()
                .push((result.unit.identifier.clone(), result.state));
        };
        let units = [unit("a"), unit("b").with_active(false)];

        let mut processor = ConfigurationSetApplyProcessor::new(&units, &stub, &mut sink, &token);
        processor.process(false).unwrap();

        assert_eq!(
            *events.lock(),
            [
                ("a".to_string(), UnitState::InProgress),
                ("a".to_string(), UnitState::Completed),
                ("b".to_string(), UnitState::Skipped),
            ]
        );
    }

    #[test]
    fn test_cancellation_stops_processing() {
        let stub = Stub::default();
        let token = CancellationToken::new();
        let cancel = token.clone();
        let mut sink = move |result: &UnitResult| {
            if result.state == UnitState::InProgress {
                cancel.cancel();
            }
        };
        let units = [unit("a"), unit("b")];

        let mut processor = ConfigurationSetApplyProcessor::new(&units, &stub, &mut sink, &token);
        let outcome = processor.process(false);

        assert!(matches!(outcome, Err(Error::Cancelled)));
        assert!(stub.calls().is_empty());
        let result = processor.result();
        assert_eq!(result.find("a").unwrap().state, UnitState::Completed);
        assert_eq!(result.find("b").unwrap().state, UnitState::Pending);
    }

    #[test]
    fn test_snapshot_isolated_from_caller() {
        let stub = Stub::default();
        let token = CancellationToken::new();
        let mut progress = NoProgress;
        let mut set = ConfigurationSet::new("snapshot").with_units(vec![unit("a")]);

        let mut processor = ConfigurationSetApplyProcessor::for_set(&set, &stub, &mut progress, &token);
        set.units.push(unit("late"));
        processor.process(false).unwrap();

        assert_eq!(processor.result().unit_results.len(), 1);
    }
}

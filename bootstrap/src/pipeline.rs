//! Install pipeline engine.
//!
//! Steps run strictly in declaration order. Each step carries a retry
//! policy; a critical step that exhausts its retries terminates the run and
//! publishes a failure event naming the step, while an optional step's
//! exhaustion is logged and the pipeline moves on with that component
//! considered absent.

use crate::notify::Notifier;
use cmd_lib::*;
use fleetforge_common::protocol::{
    InstanceIdentity, NotificationEvent, StepReport, StepResult,
};
use fleetforge_common::retry::RetryPolicy;
use std::io::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Criticality {
    Critical,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    NotStarted,
    Running,
    Retrying,
    Succeeded,
    FailedCritical,
    FailedOptional,
}

pub type StepOp = Box<dyn FnMut() -> CmdResult>;

pub struct InstallStep {
    pub id: &'static str,
    pub criticality: Criticality,
    pub retry: RetryPolicy,
    pub op: StepOp,
}

impl InstallStep {
    pub fn critical(id: &'static str, retry: RetryPolicy, op: StepOp) -> Self {
        Self {
            id,
            criticality: Criticality::Critical,
            retry,
            op,
        }
    }

    pub fn optional(id: &'static str, retry: RetryPolicy, op: StepOp) -> Self {
        Self {
            id,
            criticality: Criticality::Optional,
            retry,
            op,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: &'static str,
    pub state: StepState,
    pub attempts: u32,
}

impl StepRecord {
    fn report(&self) -> StepReport {
        let result = match self.state {
            StepState::Succeeded => StepResult::Succeeded,
            StepState::FailedOptional => StepResult::FailedOptional,
            StepState::FailedCritical => StepResult::FailedCritical,
            _ => StepResult::Skipped,
        };
        StepReport {
            id: self.id.to_string(),
            result,
            attempts: self.attempts,
        }
    }
}

/// One pipeline execution. Exactly one exists per boot; a failed run is not
/// resumable and requires a fresh instance or fresh invocation.
pub struct PipelineRun {
    steps: Vec<InstallStep>,
    records: Vec<StepRecord>,
}

impl PipelineRun {
    pub fn new(steps: Vec<InstallStep>) -> Self {
        let records = steps
            .iter()
            .map(|s| StepRecord {
                id: s.id,
                state: StepState::NotStarted,
                attempts: 0,
            })
            .collect();
        Self { steps, records }
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn step_reports(&self) -> Vec<StepReport> {
        self.records.iter().map(|r| r.report()).collect()
    }

    /// Execute all steps in order. On critical exhaustion, publishes exactly
    /// one failure event naming the step and returns the underlying error.
    pub fn execute(
        &mut self,
        identity: &InstanceIdentity,
        notifier: &dyn Notifier,
    ) -> Result<(), Error> {
        let total = self.steps.len();
        for (idx, step) in self.steps.iter_mut().enumerate() {
            let record = &mut self.records[idx];
            info!("[{}/{}] step {}", idx + 1, total, step.id);
            record.state = StepState::Running;

            let last_err = loop {
                record.attempts += 1;
                match (step.op)() {
                    Ok(()) => {
                        record.state = StepState::Succeeded;
                        break None;
                    }
                    Err(e) if record.attempts < step.retry.max_attempts => {
                        let delay = step.retry.delay_after(record.attempts);
                        record.state = StepState::Retrying;
                        warn!(
                            "step {} attempt {}/{} unsuccessful: {e}; next try in {}s",
                            step.id,
                            record.attempts,
                            step.retry.max_attempts,
                            delay.as_secs()
                        );
                        std::thread::sleep(delay);
                        record.state = StepState::Running;
                    }
                    Err(e) => break Some(e),
                }
            };

            let Some(err) = last_err else { continue };

            match step.criticality {
                Criticality::Optional => {
                    record.state = StepState::FailedOptional;
                    warn!(
                        "optional step {} gave up after {} attempts: {err}; continuing without it",
                        step.id, record.attempts
                    );
                }
                Criticality::Critical => {
                    record.state = StepState::FailedCritical;
                    let detail = format!(
                        "critical step '{}' exhausted {} attempts: {err}",
                        step.id, record.attempts
                    );
                    error!("{detail}");
                    let event = NotificationEvent::failure(identity, &detail);
                    if let Err(notify_err) = notifier.publish(&event) {
                        warn!("could not publish step notification: {notify_err}");
                    }
                    return Err(Error::other(detail));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    struct RecordingNotifier {
        events: RefCell<Vec<NotificationEvent>>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                events: RefCell::new(Vec::new()),
            }
        }
    }

    impl Notifier for RecordingNotifier {
        fn publish(&self, event: &NotificationEvent) -> CmdResult {
            self.events.borrow_mut().push(event.clone());
            Ok(())
        }
    }

    fn identity() -> InstanceIdentity {
        InstanceIdentity {
            instance_id: "i-0test".to_string(),
            private_ip: "10.0.0.9".to_string(),
            public_ip: None,
            zone: "us-east-1a".to_string(),
            instance_class: "m6i.large".to_string(),
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::ZERO)
    }

    fn counting_op(counter: &Rc<RefCell<u32>>, results: &'static [bool]) -> StepOp {
        let counter = Rc::clone(counter);
        Box::new(move || {
            let mut n = counter.borrow_mut();
            let ok = results.get(*n as usize).copied().unwrap_or(false);
            *n += 1;
            if ok {
                Ok(())
            } else {
                Err(std::io::Error::other("boom"))
            }
        })
    }

    #[test]
    fn test_optional_exhaustion_never_halts_pipeline() {
        let later = Rc::new(RefCell::new(0u32));
        let failing = Rc::new(RefCell::new(0u32));
        let mut run = PipelineRun::new(vec![
            InstallStep::optional("doomed-optional", policy(3), counting_op(&failing, &[])),
            InstallStep::critical("later-step", policy(1), counting_op(&later, &[true])),
        ]);
        let notifier = RecordingNotifier::new();
        run.execute(&identity(), &notifier).unwrap();

        assert_eq!(*failing.borrow(), 3);
        assert_eq!(*later.borrow(), 1, "later step still executed");
        assert_eq!(run.records()[0].state, StepState::FailedOptional);
        assert_eq!(run.records()[1].state, StepState::Succeeded);
        assert!(notifier.events.borrow().is_empty());
    }

    #[test]
    fn test_critical_exhaustion_halts_and_notifies_once() {
        let never_runs = Rc::new(RefCell::new(0u32));
        let failing = Rc::new(RefCell::new(0u32));
        let mut run = PipelineRun::new(vec![
            InstallStep::critical("doomed-critical", policy(3), counting_op(&failing, &[])),
            InstallStep::critical("unreached", policy(1), counting_op(&never_runs, &[true])),
        ]);
        let notifier = RecordingNotifier::new();
        let err = run.execute(&identity(), &notifier).unwrap_err();

        assert!(err.to_string().contains("doomed-critical"));
        assert_eq!(*failing.borrow(), 3);
        assert_eq!(*never_runs.borrow(), 0, "pipeline halted before later step");
        assert_eq!(run.records()[0].state, StepState::FailedCritical);
        assert_eq!(run.records()[1].state, StepState::NotStarted);

        let events = notifier.events.borrow();
        assert_eq!(events.len(), 1, "exactly one step-level failure event");
        assert!(events[0].detail.contains("doomed-critical"));
    }

    #[test]
    fn test_retry_then_success() {
        let counter = Rc::new(RefCell::new(0u32));
        let mut run = PipelineRun::new(vec![InstallStep::critical(
            "flaky",
            policy(3),
            counting_op(&counter, &[false, true]),
        )]);
        let notifier = RecordingNotifier::new();
        run.execute(&identity(), &notifier).unwrap();

        assert_eq!(*counter.borrow(), 2);
        assert_eq!(run.records()[0].state, StepState::Succeeded);
        assert_eq!(run.records()[0].attempts, 2);
        assert!(notifier.events.borrow().is_empty());
    }

    #[test]
    fn test_steps_execute_in_declaration_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mk = |tag: &'static str, ok: bool| -> StepOp {
            let order = Rc::clone(&order);
            Box::new(move || {
                order.borrow_mut().push(tag);
                if ok {
                    Ok(())
                } else {
                    Err(std::io::Error::other("nope"))
                }
            })
        };
        let mut run = PipelineRun::new(vec![
            InstallStep::critical("a", policy(1), mk("a", true)),
            InstallStep::optional("b", policy(1), mk("b", false)),
            InstallStep::critical("c", policy(1), mk("c", true)),
        ]);
        run.execute(&identity(), &RecordingNotifier::new()).unwrap();
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_step_reports_reflect_terminal_states() {
        let mut run = PipelineRun::new(vec![
            InstallStep::critical("ok", policy(1), Box::new(|| Ok(()))),
            InstallStep::optional(
                "broken",
                policy(2),
                Box::new(|| Err(std::io::Error::other("x"))),
            ),
        ]);
        run.execute(&identity(), &RecordingNotifier::new()).unwrap();
        let reports = run.step_reports();
        assert_eq!(reports[0].result, StepResult::Succeeded);
        assert_eq!(reports[0].attempts, 1);
        assert_eq!(reports[1].result, StepResult::FailedOptional);
        assert_eq!(reports[1].attempts, 2);
    }
}

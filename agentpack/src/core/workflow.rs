//! Pure state machine for one workflow run.
//!
//! `Idle → Running(step) → Complete | Aborted(reason)`. The engine feeds step
//! results in; this module decides whether the run continues. It owns the step
//! ceiling, the stagnation heuristic and the progress history, and performs no
//! I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_STEPS: u32 = 20;
pub const DEFAULT_STAGNATION_THRESHOLD: u32 = 5;

/// Bounds applied to a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_steps: u32,
    pub stagnation_threshold: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            stagnation_threshold: DEFAULT_STAGNATION_THRESHOLD,
        }
    }
}

/// Outcome class of one executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Complete,
    Pending,
    Failed,
}

/// History entry for one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-indexed step number.
    pub step: u32,
    pub agent: String,
    pub trace_id: String,
    pub status: StepStatus,
    pub progress: Option<f64>,
    pub elapsed_ms: u64,
}

/// Why a run stopped without a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    InvalidResponse {
        step: u32,
        reason: String,
    },
    TraceMismatch {
        step: u32,
        expected: String,
        actual: Option<String>,
    },
    UnknownAgent {
        step: u32,
        agent: String,
    },
    Stagnant {
        step: u32,
        threshold: u32,
    },
    StepLimitExceeded {
        max_steps: u32,
    },
    StepTimeout {
        step: u32,
        agent: String,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowState {
    Idle,
    Running { step: u32 },
    Complete { result: Value },
    Aborted(AbortReason),
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Complete { .. } | WorkflowState::Aborted(_)
        )
    }
}

/// Tracks consecutive non-increasing progress values.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressTracker {
    last: Option<f64>,
    stagnant_steps: u32,
    threshold: u32,
}

impl ProgressTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            last: None,
            stagnant_steps: 0,
            threshold,
        }
    }

    /// Record a progress value. Returns true once the stagnation threshold is
    /// reached.
    ///
    /// The first value has nothing to compare against and never counts.
    pub fn observe(&mut self, value: f64) -> bool {
        if let Some(previous) = self.last {
            // NaN compares false and so counts as non-increasing.
            if value > previous {
                self.stagnant_steps = 0;
            } else {
                self.stagnant_steps += 1;
            }
        }
        self.last = Some(value);
        self.stagnant_steps >= self.threshold
    }

    pub fn stagnant_steps(&self) -> u32 {
        self.stagnant_steps
    }
}

/// State machine for one run. Terminal states are final.
#[derive(Debug, Clone)]
pub struct WorkflowMachine {
    limits: Limits,
    state: WorkflowState,
    tracker: ProgressTracker,
    history: Vec<StepRecord>,
}

impl WorkflowMachine {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            state: WorkflowState::Idle,
            tracker: ProgressTracker::new(limits.stagnation_threshold),
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn history(&self) -> &[StepRecord] {
        &self.history
    }

    pub fn into_parts(self) -> (WorkflowState, Vec<StepRecord>) {
        (self.state, self.history)
    }

    /// `Idle → Running(1)`.
    pub fn start(&mut self) -> Result<u32, String> {
        if self.state != WorkflowState::Idle {
            return Err(format!("cannot start from state {:?}", self.state));
        }
        self.state = WorkflowState::Running { step: 1 };
        Ok(1)
    }

    /// Step currently being executed, if running.
    pub fn current_step(&self) -> Option<u32> {
        match self.state {
            WorkflowState::Running { step } => Some(step),
            _ => None,
        }
    }

    /// The current step answered `complete`.
    pub fn complete(&mut self, record: StepRecord, result: Value) -> &WorkflowState {
        if self.current_step().is_none() {
            return &self.state;
        }
        self.history.push(record);
        self.state = WorkflowState::Complete { result };
        &self.state
    }

    /// The current step answered `pending`. Applies the stagnation check, then
    /// the step ceiling, then advances.
    pub fn pending(&mut self, record: StepRecord, progress: f64) -> &WorkflowState {
        let Some(step) = self.current_step() else {
            return &self.state;
        };
        self.history.push(record);
        if self.tracker.observe(progress) {
            self.state = WorkflowState::Aborted(AbortReason::Stagnant {
                step,
                threshold: self.limits.stagnation_threshold,
            });
        } else if step >= self.limits.max_steps {
            self.state = WorkflowState::Aborted(AbortReason::StepLimitExceeded {
                max_steps: self.limits.max_steps,
            });
        } else {
            self.state = WorkflowState::Running { step: step + 1 };
        }
        &self.state
    }

    /// The current step failed in a way that ends the run.
    pub fn abort(&mut self, record: Option<StepRecord>, reason: AbortReason) -> &WorkflowState {
        if self.state.is_terminal() {
            return &self.state;
        }
        if let Some(record) = record {
            self.history.push(record);
        }
        self.state = WorkflowState::Aborted(reason);
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(step: u32, status: StepStatus, progress: Option<f64>) -> StepRecord {
        StepRecord {
            step,
            agent: "root".to_string(),
            trace_id: format!("trace-{step}"),
            status,
            progress,
            elapsed_ms: 0,
        }
    }

    fn drive_constant_progress(limits: Limits, value: f64) -> WorkflowMachine {
        let mut machine = WorkflowMachine::new(limits);
        machine.start().expect("start");
        while let Some(step) = machine.current_step() {
            machine.pending(record(step, StepStatus::Pending, Some(value)), value);
        }
        machine
    }

    #[test]
    fn tracker_counts_consecutive_non_increasing_values() {
        let mut tracker = ProgressTracker::new(3);
        assert!(!tracker.observe(1.0));
        assert!(!tracker.observe(1.0));
        assert!(!tracker.observe(0.5));
        assert_eq!(tracker.stagnant_steps(), 2);
        assert!(!tracker.observe(2.0));
        assert_eq!(tracker.stagnant_steps(), 0);
        assert!(!tracker.observe(2.0));
        assert!(!tracker.observe(2.0));
        assert!(tracker.observe(2.0));
    }

    #[test]
    fn constant_progress_aborts_after_five_stagnant_steps() {
        let machine = drive_constant_progress(Limits::default(), 7.0);
        assert_eq!(
            machine.state(),
            &WorkflowState::Aborted(AbortReason::Stagnant {
                step: 6,
                threshold: 5
            })
        );
        // One baseline step plus five non-increasing ones.
        assert_eq!(machine.history().len(), 6);
    }

    #[test]
    fn increasing_progress_hits_step_ceiling() {
        let mut machine = WorkflowMachine::new(Limits::default());
        machine.start().expect("start");
        while let Some(step) = machine.current_step() {
            let progress = f64::from(step);
            machine.pending(record(step, StepStatus::Pending, Some(progress)), progress);
        }
        assert_eq!(
            machine.state(),
            &WorkflowState::Aborted(AbortReason::StepLimitExceeded { max_steps: 20 })
        );
        assert_eq!(machine.history().len(), 20);
    }

    #[test]
    fn complete_on_last_allowed_step_wins() {
        let limits = Limits {
            max_steps: 2,
            stagnation_threshold: 5,
        };
        let mut machine = WorkflowMachine::new(limits);
        machine.start().expect("start");
        machine.pending(record(1, StepStatus::Pending, Some(1.0)), 1.0);
        let state = machine.complete(record(2, StepStatus::Complete, None), json!(42));
        assert_eq!(state, &WorkflowState::Complete { result: json!(42) });
    }

    #[test]
    fn terminal_states_ignore_further_input() {
        let mut machine = WorkflowMachine::new(Limits::default());
        machine.start().expect("start");
        machine.complete(record(1, StepStatus::Complete, None), json!(1));
        machine.pending(record(2, StepStatus::Pending, Some(2.0)), 2.0);
        machine.abort(None, AbortReason::StepLimitExceeded { max_steps: 1 });
        assert_eq!(machine.state(), &WorkflowState::Complete { result: json!(1) });
        assert_eq!(machine.history().len(), 1);
        assert!(machine.start().is_err());
    }

    #[test]
    fn stagnation_wins_over_step_ceiling_on_same_step() {
        let limits = Limits {
            max_steps: 3,
            stagnation_threshold: 2,
        };
        let machine = drive_constant_progress(limits, 1.0);
        assert_eq!(
            machine.state(),
            &WorkflowState::Aborted(AbortReason::Stagnant {
                step: 3,
                threshold: 2
            })
        );
    }
}

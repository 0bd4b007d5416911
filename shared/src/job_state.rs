//! Job Lifecycle State Machine
//!
//! Defines the valid job state transitions. Only the job executor drives a
//! lifecycle; everything else observes snapshots.

use crate::JobState;

/// Events that can move a job between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// Worker picked the job up
    Start,
    /// The last step succeeded
    AllStepsCompleted,
    /// A step failed with no attempts left
    StepExhausted,
    /// Unrecoverable failure (unknown definition, broken invariant)
    FatalError,
    /// External stop request
    StopRequested,
    /// In-flight step finished or was abandoned after a stop request
    StopSettled,
}

/// Result of a transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and the state changed
    Success(JobState),
    /// Transition is not allowed from the current state
    Invalid { from: JobState, event: JobEvent },
}

/// Tracks the state of one job
#[derive(Debug, Clone)]
pub struct JobLifecycle {
    current: JobState,
}

impl Default for JobLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLifecycle {
    /// A freshly submitted job
    pub fn new() -> Self {
        Self {
            current: JobState::Created,
        }
    }

    /// Resume tracking from a known state
    pub fn from_state(state: JobState) -> Self {
        Self { current: state }
    }

    pub fn state(&self) -> JobState {
        self.current
    }

    /// Apply an event; the state is left untouched when the event is invalid
    pub fn process_event(&mut self, event: JobEvent) -> TransitionResult {
        match next_state(self.current, event) {
            Some(state) => {
                self.current = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current,
                event,
            },
        }
    }
}

fn next_state(from: JobState, event: JobEvent) -> Option<JobState> {
    use JobEvent::*;
    use JobState::*;

    match (from, event) {
        (Created, Start) => Some(Running),

        (Running, AllStepsCompleted) => Some(Completed),
        (Running, StepExhausted) => Some(StepFailed),
        (Running, FatalError) => Some(StepFailed),
        (Running, StopRequested) => Some(Stopping),

        // Repeated stop requests are absorbed
        (Stopping, StopRequested) => Some(Stopping),
        (Stopping, StopSettled) => Some(Stopped),

        _ => None,
    }
}

use fleet_shared::{codec::CodecError, CorrelationKey, JobId, JobState};
use std::time::Duration;
use thiserror::Error;

/// Orchestrator-wide result type
pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(Error, Debug)]
pub enum FleetError {
    // Transport and correlation
    /// The transport refused the publish, or was torn down while a request
    /// was pending.
    #[error("Channel unavailable for {topic}: {reason}")]
    ChannelUnavailable { topic: String, reason: String },

    /// No response before the deadline.
    #[error("Request {key} timed out after {timeout:?}")]
    RequestTimeout { key: CorrelationKey, timeout: Duration },

    /// The pending request was cancelled by a stop request.
    #[error("Request {key} was cancelled")]
    Cancelled { key: CorrelationKey },

    // Step definitions
    /// Registry miss. This is a configuration error and is never retried.
    #[error("Unknown step definition: {0}")]
    UnknownStepDefinition(String),

    #[error("Step definition registered twice: {0}")]
    DuplicateStepDefinition(String),

    #[error("Step {step} is missing required property {property}")]
    MissingProperty { step: String, property: String },

    /// A property value the step cannot use. Retrying cannot fix it.
    #[error("Step {step} has invalid property {property}: {reason}")]
    InvalidProperty {
        step: String,
        property: String,
        reason: String,
    },

    /// The step behaviour reported a failure.
    #[error("Step failed: {0}")]
    StepFailure(String),

    // Job control
    #[error("Job {job_id} is not running (state: {state:?})")]
    JobNotRunning { job_id: JobId, state: JobState },

    #[error("Job {0} not found")]
    JobNotFound(JobId),

    // Persistence
    #[error("Commit failed: {0}")]
    CommitFailure(String),

    /// Optimistic check failed: `key` changed after this transaction read it.
    #[error("Commit conflict on {key}")]
    CommitConflict { key: String },

    /// An after-commit hook failed. The transaction stays committed.
    #[error("After-commit hook #{index} failed: {reason}")]
    HookFailure { index: usize, reason: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl FleetError {
    pub fn channel(topic: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FleetError::ChannelUnavailable {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a step that failed with this error may be attempted again.
    ///
    /// Transport, timing and persistence failures are transient. Definition,
    /// control and invariant errors are permanent. `Cancelled` is neither:
    /// it only happens on the stop path and settles the job at STOPPED.
    pub fn is_retryable(&self) -> bool {
        match self {
            FleetError::ChannelUnavailable { .. } => true,
            FleetError::RequestTimeout { .. } => true,
            FleetError::StepFailure(_) => true,
            FleetError::CommitFailure(_) => true,
            FleetError::CommitConflict { .. } => true,
            FleetError::Codec(_) => true,

            FleetError::Cancelled { .. } => false,
            FleetError::UnknownStepDefinition(_) => false,
            FleetError::DuplicateStepDefinition(_) => false,
            FleetError::MissingProperty { .. } => false,
            FleetError::InvalidProperty { .. } => false,
            FleetError::JobNotRunning { .. } => false,
            FleetError::JobNotFound(_) => false,
            FleetError::HookFailure { .. } => false,
            FleetError::Invariant(_) => false,
        }
    }

    /// Errors that end the whole job immediately instead of failing a step.
    pub fn is_fatal_to_job(&self) -> bool {
        matches!(
            self,
            FleetError::UnknownStepDefinition(_) | FleetError::Invariant(_)
        )
    }
}

//! Fleet Shared Types
//!
//! Wire and persistence types shared between the fleet orchestrator and the
//! devices it drives, plus the job lifecycle state machine and the frame codec
//! used by stream transports.

pub mod codec;
pub mod job_state;

use std::time::{SystemTime, UNIX_EPOCH};

pub mod proto;

// Re-export commonly used types at crate root
pub use proto::*;

/// Identifier tying one outbound request to its inbound response.
pub type CorrelationKey = u64;

/// Identifier of a submitted job.
pub type JobId = u64;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Deployment defaults for the orchestrator
pub mod defaults {
    /// How long a correlated request waits for its response
    pub const REQUEST_TIMEOUT_MS: u64 = 3000;

    /// Deadlines are rounded up to this tick so they expire in batches
    pub const DEADLINE_GRANULARITY_MS: u64 = 10;

    /// Attempts per step before the job is marked STEP_FAILED
    pub const STEP_MAX_ATTEMPTS: u32 = 3;

    /// First retry delay for exponential step backoff
    pub const STEP_BACKOFF_INITIAL_MS: u64 = 100;

    /// Upper bound for exponential step backoff
    pub const STEP_BACKOFF_MAX_MS: u64 = 5000;

    /// Jobs allowed to execute steps at the same time
    pub const MAX_CONCURRENT_JOBS: usize = 16;

    /// Root level of every command and reply topic
    pub const TOPIC_PREFIX: &str = "fleet";
}

impl Message {
    /// Create a message for `topic` carrying `payload`
    pub fn new(
        topic: impl Into<String>,
        correlation_id: CorrelationKey,
        payload: impl Into<bytes::Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            correlation_id,
            sent_at_ms: now_ms(),
            payload: payload.into(),
            sender: String::new(),
        }
    }

    /// Tag the message with the identity of its sender
    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Build the reply to this message on `topic`, reusing its correlation id
    pub fn reply(&self, topic: impl Into<String>, payload: impl Into<bytes::Bytes>) -> Self {
        Self::new(topic, self.correlation_id, payload)
    }

    /// Payload interpreted as UTF-8 text, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl JobState {
    /// Whether no further transition can leave this state
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::StepFailed | JobState::Stopped
        )
    }
}

impl JobRecord {
    /// Protobuf bytes as written to the job store
    pub fn to_bytes(&self) -> bytes::Bytes {
        use prost::Message as _;
        self.encode_to_vec().into()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, codec::CodecError> {
        use prost::Message as _;
        Ok(Self::decode(buf)?)
    }
}

impl StepRecord {
    /// Ordered view of the recorded properties
    pub fn property_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|p| (p.name.as_str(), p.value.as_str()))
    }
}

//! Protobuf messages exchanged with devices and written to the job store

use bytes::Bytes;

/// Envelope for every publish/subscribe message
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(string, tag = "1")]
    pub topic: String,

    /// Correlation key; 0 for unsolicited messages
    #[prost(uint64, tag = "2")]
    pub correlation_id: u64,

    #[prost(uint64, tag = "3")]
    pub sent_at_ms: u64,

    #[prost(bytes = "bytes", tag = "4")]
    pub payload: Bytes,

    #[prost(string, tag = "5")]
    pub sender: String,
}

/// Lifecycle of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum JobState {
    Created = 0,
    Running = 1,
    StepFailed = 2,
    Completed = 3,
    Stopping = 4,
    Stopped = 5,
}

/// Runtime status of a single job step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum StepStatus {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Property {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(string, tag = "2")]
    pub value: String,
}

/// Persisted form of one job step
#[derive(Clone, PartialEq, prost::Message)]
pub struct StepRecord {
    #[prost(string, tag = "1")]
    pub definition_key: String,

    #[prost(enumeration = "StepStatus", tag = "2")]
    pub status: i32,

    #[prost(uint32, tag = "3")]
    pub attempts: u32,

    #[prost(string, tag = "4")]
    pub last_error: String,

    #[prost(message, repeated, tag = "5")]
    pub properties: Vec<Property>,
}

/// Persisted form of a job, written on every lifecycle transition
#[derive(Clone, PartialEq, prost::Message)]
pub struct JobRecord {
    #[prost(uint64, tag = "1")]
    pub id: u64,

    #[prost(string, tag = "2")]
    pub target: String,

    #[prost(enumeration = "JobState", tag = "3")]
    pub state: i32,

    #[prost(uint32, tag = "4")]
    pub current_step: u32,

    #[prost(message, repeated, tag = "5")]
    pub steps: Vec<StepRecord>,

    #[prost(string, tag = "6")]
    pub last_error: String,

    #[prost(uint64, tag = "7")]
    pub updated_at_ms: u64,
}

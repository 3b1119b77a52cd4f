//! Common imports for typical client usage.
//!
//! This module intentionally exports the most frequently used types so
//! application code needs fewer import lines.
pub use crate::{
    Client, ClientConfig, CleanupController, CleanupEvent, GenerationEvent, GenerationOptions,
    GenerationRequest, GenerationSession, GenerationState, HeartbeatController, HeartbeatEvent,
    HeartbeatOptions, JobLogEvent, JobLogSubscriber, JobLogSubscription, JobState, JobStatus,
    LogEntry, ReconnectPolicy, ReleasePolicy, StaticToken, StreamEvent, SubmitJobRequest,
    SubscriberState, TokenProvider,
};

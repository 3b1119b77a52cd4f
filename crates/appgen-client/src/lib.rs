//! Client core for an AI-driven application-generation product.
//!
//! Wraps the generation backend behind typed async APIs: job submission
//! and status polling, a reconnecting SSE subscription to job logs, a
//! single-shot code-generation stream that assembles files as they are
//! produced, and keep-alive/cleanup controllers for the ephemeral preview
//! sandbox. UI concerns stay outside; everything here is channels and
//! state machines.
//!
//! # Tailing a job's logs
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use appgen_client::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), appgen_client::ApiError> {
//! let client = Arc::new(Client::new(
//!     ClientConfig::new("https://api.example.com"),
//!     StaticToken::new("user-token"),
//! )?);
//!
//! let job = client.submit_job(SubmitJobRequest::new("a todo app")).await?;
//!
//! let subscriber = JobLogSubscriber::new(client.clone(), client.clone());
//! let mut logs = subscriber.subscribe(job.job_id);
//! while let Some(event) = logs.next_event().await {
//!     match event {
//!         JobLogEvent::Log(entry) => println!("{}", entry.message),
//!         JobLogEvent::State(SubscriberState::Closed(_)) => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// REST client, job types, and the seam traits the state machines consume.
pub mod api;
/// Auth token lookup seam.
pub mod auth;
/// Client configuration.
pub mod config;
/// Public error types.
pub mod errors;
/// Typed wire events and frame decoding.
pub mod events;
/// Single-shot code-generation stream session.
pub mod generation;
/// Reconnecting job-log subscriber.
pub mod job_log;
/// Process-wide tracing setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Sandbox keep-alive and cleanup controllers.
pub mod sandbox;
/// Incremental SSE frame decoding.
pub mod sse;
/// Authenticated event-stream transport.
pub mod transport;

pub use api::{
    ArtifactContent, ArtifactSummary, Client, JobHandle, JobState, JobStatus, JobStatusSource,
    LogStreamConnector, SandboxApi, SubmitJobRequest,
};
pub use auth::{NoToken, StaticToken, TokenProvider};
pub use config::ClientConfig;
pub use errors::{
    ApiError, CloseReason, GenerationFailure, SubscribeFailure, TransportError,
};
pub use events::{CompletePayload, FinalFile, LogEntry, LogLevel, StreamEvent};
pub use generation::{
    FileSet, GeneratedFile, GenerationEvent, GenerationOptions, GenerationOutcome,
    GenerationRequest, GenerationSession, GenerationState, ThinkingNote,
};
pub use job_log::{
    JobLogEvent, JobLogSubscriber, JobLogSubscription, ReconnectPolicy, SubscriberState,
};
pub use observability::init_observability;
pub use sandbox::{
    CleanupController, CleanupEvent, HeartbeatController, HeartbeatEvent, HeartbeatOptions,
    ReleasePolicy, SkipReason,
};
pub use sse::{SseDecoder, SseFrame};
pub use transport::{
    AbortHandle, EventStreamTransport, StreamHandle, StreamMethod, StreamRequest, TransportItem,
};

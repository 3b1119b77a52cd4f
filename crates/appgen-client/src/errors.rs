use crate::api::JobState;

/// Errors returned by plain REST operations (submit, poll, ping, release).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Request never produced an HTTP response.
    #[error("request error: {message}")]
    Request { message: String },
    /// Server answered with a non-success HTTP status.
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    /// Response envelope reported `success = false`.
    #[error("api rejected request: {message}")]
    Rejected { message: String },
    /// Response body did not match the expected shape.
    #[error("decode error: {message}")]
    Decode { message: String },
}

impl ApiError {
    pub(crate) fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

/// Errors raised while opening or reading an event stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("stream connect failed: {message}")]
    Connect { message: String },
    /// Server refused the stream with a non-success status.
    #[error("stream rejected with http {status}: {message}")]
    Http { status: u16, message: String },
    /// Response was not an event stream.
    #[error("unexpected content type: {content_type}")]
    ContentType { content_type: String },
    /// Reading the response body failed mid-stream.
    #[error("stream read failed: {message}")]
    Read { message: String },
}

impl TransportError {
    pub(crate) fn connect(message: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
        }
    }

    pub(crate) fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }
}

/// Terminal failures surfaced by the reconnecting job-log subscriber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeFailure {
    /// Every reconnect attempt in the budget failed.
    #[error("gave up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    /// The subscription was cancelled by the caller.
    #[error("subscription cancelled")]
    Cancelled,
}

/// Terminal failures surfaced by a code-generation stream session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationFailure {
    /// Stream could not be opened or died mid-flight.
    #[error("generation stream failed: {message}")]
    Transport { message: String },
    /// Server sent an `error` frame.
    #[error("generation failed: {message}")]
    Server { message: String },
    /// Stream ended without a `complete` frame; this endpoint cannot be
    /// resumed, so the partial result is discarded.
    #[error("generation stream disconnected before completion")]
    Disconnected,
    /// The wall-clock deadline elapsed. Reported distinctly from network
    /// errors so callers can offer a different recovery action.
    #[error("generation timed out")]
    TimedOut,
    /// The session was cancelled by the caller.
    #[error("generation cancelled")]
    Cancelled,
}

impl From<TransportError> for GenerationFailure {
    fn from(err: TransportError) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

/// Non-terminal notice that a job reached a terminal status server-side,
/// carried with the closing state change for context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Stream delivered its `complete` frame.
    Complete,
    /// Polling observed the job in a terminal status.
    JobTerminal(JobState),
    /// Caller cancelled the subscription.
    Cancelled,
    /// Reconnect budget was exhausted.
    GaveUp,
}

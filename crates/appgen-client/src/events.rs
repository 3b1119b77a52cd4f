//! Typed wire events shared by the job-log and code-generation streams.

use tracing::warn;

use crate::sse::SseFrame;

/// Severity tag carried by a [`LogEntry`].
///
/// `Heartbeat` entries are liveness markers; subscribers route them to the
/// heartbeat channel instead of the visible log list. Unknown wire values
/// fall back to `Info`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
    Heartbeat,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl<'de> serde::Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Absent, null, and unknown levels all read as Info; a level alone
        // must not poison an otherwise-valid frame.
        let raw: Option<String> = serde::Deserialize::deserialize(deserializer)?;
        Ok(match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("warn") | Some("warning") => Self::Warn,
            Some("error") => Self::Error,
            Some("success") => Self::Success,
            Some("heartbeat") => Self::Heartbeat,
            _ => Self::Info,
        })
    }
}

/// One line of execution narration from a backend job.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// ISO 8601 timestamp when the backend attached one.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Emitting agent role (`PLAYER`, `COACH`, `EXECUTOR`, `ARCHITECT`, `SYSTEM`).
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
}

impl LogEntry {
    /// True for liveness-marker entries that must not reach the log list.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self.level, LogLevel::Heartbeat)
    }
}

/// Final file record carried by a generation `complete` payload.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalFile {
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub file_type: Option<String>,
}

/// Payload of a `complete` frame.
///
/// The job-log stream sends `complete` with no structured payload; the
/// code-generation stream attaches the authoritative final file list.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CompletePayload {
    #[serde(default)]
    pub files: Option<Vec<FinalFile>>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Discriminated union of everything the streaming endpoints emit.
///
/// Exactly one variant per parsed frame. Event names this client does not
/// model land in `Status` so nothing on the wire is dropped or fatal.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    Log(LogEntry),
    Heartbeat,
    /// Server-reported stream failure (plain-text message).
    Error(String),
    Complete(Option<CompletePayload>),
    FileStart {
        path: String,
        file_type: Option<String>,
    },
    FileContent {
        path: String,
        chunk: String,
    },
    FileComplete {
        path: String,
    },
    Thinking {
        message: String,
        duration_ms: Option<u64>,
    },
    /// Fallback for unrecognized event names; carries the raw payload.
    Status {
        event: String,
        raw: String,
    },
}

#[derive(serde::Deserialize)]
struct ThinkingPayload {
    #[serde(default)]
    message: String,
    #[serde(default, alias = "durationMs")]
    duration: Option<u64>,
}

#[derive(serde::Deserialize)]
struct FilePayload {
    path: String,
    #[serde(default, alias = "fileType")]
    file_type: Option<String>,
    #[serde(default)]
    content: String,
}

/// Decodes one SSE frame into a typed event.
///
/// Returns `None` when a frame that requires structured data carries
/// malformed JSON; the caller skips it and the stream continues. These
/// skips are logged with the offending event name so a misbehaving
/// backend stays diagnosable.
pub fn decode_frame(frame: &SseFrame) -> Option<StreamEvent> {
    match frame.event.as_str() {
        "log" | "message" => match serde_json::from_str::<LogEntry>(&frame.data) {
            Ok(entry) => Some(StreamEvent::Log(entry)),
            Err(err) => {
                skip_malformed(&frame.event, &err);
                None
            }
        },
        "heartbeat" => Some(StreamEvent::Heartbeat),
        "error" => Some(StreamEvent::Error(frame.data.clone())),
        "complete" => {
            let payload = if frame.data.trim().is_empty() {
                None
            } else {
                // Log streams close with a bare "done" marker; only a JSON
                // object carries reconciliation data.
                serde_json::from_str::<CompletePayload>(&frame.data).ok()
            };
            Some(StreamEvent::Complete(payload))
        }
        "thinking" => match serde_json::from_str::<ThinkingPayload>(&frame.data) {
            Ok(payload) => Some(StreamEvent::Thinking {
                message: payload.message,
                duration_ms: payload.duration,
            }),
            Err(err) => {
                skip_malformed(&frame.event, &err);
                None
            }
        },
        "file-start" => match serde_json::from_str::<FilePayload>(&frame.data) {
            Ok(payload) => Some(StreamEvent::FileStart {
                path: payload.path,
                file_type: payload.file_type,
            }),
            Err(err) => {
                skip_malformed(&frame.event, &err);
                None
            }
        },
        "file-content" => match serde_json::from_str::<FilePayload>(&frame.data) {
            Ok(payload) => Some(StreamEvent::FileContent {
                path: payload.path,
                chunk: payload.content,
            }),
            Err(err) => {
                skip_malformed(&frame.event, &err);
                None
            }
        },
        "file-complete" => match serde_json::from_str::<FilePayload>(&frame.data) {
            Ok(payload) => Some(StreamEvent::FileComplete { path: payload.path }),
            Err(err) => {
                skip_malformed(&frame.event, &err);
                None
            }
        },
        other => Some(StreamEvent::Status {
            event: other.to_string(),
            raw: frame.data.clone(),
        }),
    }
}

fn skip_malformed(event: &str, err: &serde_json::Error) {
    warn!(event, error = %err, "skipping SSE frame with malformed payload");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn decodes_log_entry_with_level_and_role() {
        let event = decode_frame(&frame(
            "log",
            r#"{"timestamp":"2026-01-01T00:00:00Z","role":"PLAYER","message":"step 1","level":"info"}"#,
        ));
        let Some(StreamEvent::Log(entry)) = event else {
            panic!("expected log event");
        };
        assert_eq!(entry.message, "step 1");
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.role.as_deref(), Some("PLAYER"));
        assert!(!entry.is_heartbeat());
    }

    #[test]
    fn heartbeat_level_entry_is_flagged() {
        let event = decode_frame(&frame("log", r#"{"message":"ping","level":"heartbeat"}"#));
        let Some(StreamEvent::Log(entry)) = event else {
            panic!("expected log event");
        };
        assert!(entry.is_heartbeat());
    }

    #[test]
    fn unknown_log_level_defaults_to_info_not_failure() {
        let event = decode_frame(&frame("log", r#"{"message":"x","level":"verbose"}"#));
        assert!(matches!(event, Some(StreamEvent::Log(_))));
    }

    #[test]
    fn malformed_log_payload_is_skipped() {
        assert!(decode_frame(&frame("log", "{not json")).is_none());
    }

    #[test]
    fn error_frame_carries_plain_text() {
        let event = decode_frame(&frame("error", "sandbox crashed"));
        assert_eq!(event, Some(StreamEvent::Error("sandbox crashed".into())));
    }

    #[test]
    fn complete_without_payload() {
        assert_eq!(
            decode_frame(&frame("complete", "")),
            Some(StreamEvent::Complete(None))
        );
        // Log streams close with a bare marker string.
        assert_eq!(
            decode_frame(&frame("complete", "done")),
            Some(StreamEvent::Complete(None))
        );
    }

    #[test]
    fn complete_with_final_files() {
        let event = decode_frame(&frame(
            "complete",
            r#"{"files":[{"path":"src/App.tsx","content":"export {}","fileType":"tsx"}],"message":"ok"}"#,
        ));
        let Some(StreamEvent::Complete(Some(payload))) = event else {
            panic!("expected complete payload");
        };
        let files = payload.files.expect("files");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "src/App.tsx");
    }

    #[test]
    fn file_events_round_trip() {
        assert_eq!(
            decode_frame(&frame(
                "file-start",
                r#"{"path":"src/App.tsx","fileType":"tsx"}"#
            )),
            Some(StreamEvent::FileStart {
                path: "src/App.tsx".into(),
                file_type: Some("tsx".into()),
            })
        );
        assert_eq!(
            decode_frame(&frame(
                "file-content",
                r#"{"path":"src/App.tsx","content":"ab"}"#
            )),
            Some(StreamEvent::FileContent {
                path: "src/App.tsx".into(),
                chunk: "ab".into(),
            })
        );
        assert_eq!(
            decode_frame(&frame("file-complete", r#"{"path":"src/App.tsx"}"#)),
            Some(StreamEvent::FileComplete {
                path: "src/App.tsx".into(),
            })
        );
    }

    #[test]
    fn thinking_frame_with_duration() {
        assert_eq!(
            decode_frame(&frame("thinking", r#"{"message":"analyzing","duration":2000}"#)),
            Some(StreamEvent::Thinking {
                message: "analyzing".into(),
                duration_ms: Some(2000),
            })
        );
    }

    #[test]
    fn unrecognized_event_name_becomes_status() {
        let event = decode_frame(&frame("open", "connected"));
        assert_eq!(
            event,
            Some(StreamEvent::Status {
                event: "open".into(),
                raw: "connected".into(),
            })
        );
    }
}

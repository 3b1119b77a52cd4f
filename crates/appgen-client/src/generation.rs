//! Single-shot code-generation stream session.
//!
//! Unlike the job-log subscriber this session never reconnects: the
//! endpoint cannot resume a partial generation mid-stream, so a drop is
//! terminal. A hard wall-clock deadline bounds the whole session
//! regardless of activity.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::errors::GenerationFailure;
use crate::events::{CompletePayload, FinalFile, StreamEvent};
use crate::transport::{AbortHandle, StreamHandle, TransportItem, aborted};

const EVENT_BUFFER_CAPACITY: usize = 128;

/// Session states, in transition order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerationState {
    /// No session opened yet. Never emitted; callers may use it as their
    /// initial value before attaching.
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    /// Deadline elapsed. Reported separately from `Failed` so callers can
    /// offer retry instead of wait.
    TimedOut,
}

/// Request body for opening a generation stream.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub session_id: String,
    pub regenerate: bool,
    /// Always true; the non-streaming variant of the endpoint is not used
    /// by this client.
    pub streaming: bool,
}

impl GenerationRequest {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            regenerate: false,
            streaming: true,
        }
    }

    pub fn regenerate(mut self) -> Self {
        self.regenerate = true;
        self
    }
}

/// Session tuning.
#[derive(Clone, Copy, Debug)]
pub struct GenerationOptions {
    /// Dead-man deadline measured from session start, independent of
    /// activity.
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
        }
    }
}

/// One file accumulated from the generation stream.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
    pub file_type: Option<String>,
    pub completed: bool,
    /// Set by callers once the user edits the file post-generation; the
    /// session itself never touches it.
    pub edited: bool,
}

/// Append-only assembly of in-progress and completed files, keyed by path.
///
/// The live map is a best-effort view; the `complete` payload, when it
/// carries a file list, is ground truth and replaces it.
#[derive(Default)]
pub struct FileSet {
    order: Vec<String>,
    files: HashMap<String, GeneratedFile>,
}

impl FileSet {
    /// Inserts a fresh empty file, replacing any previous entry at `path`.
    pub fn start(&mut self, path: &str, file_type: Option<String>) {
        if !self.files.contains_key(path) {
            self.order.push(path.to_string());
        }
        self.files.insert(
            path.to_string(),
            GeneratedFile {
                path: path.to_string(),
                content: String::new(),
                file_type,
                completed: false,
                edited: false,
            },
        );
    }

    /// Appends a chunk; returns false when the chunk had nowhere to go.
    ///
    /// Chunks without a prior `start`, or arriving after completion, are
    /// absorbed as no-ops. These are logged apart from ordinary errors:
    /// they may indicate a backend race worth diagnosing.
    pub fn append(&mut self, path: &str, chunk: &str) -> bool {
        match self.files.get_mut(path) {
            Some(file) if !file.completed => {
                file.content.push_str(chunk);
                true
            }
            Some(_) => {
                warn!(path, "dropping content chunk for already-completed file");
                false
            }
            None => {
                warn!(path, "dropping content chunk with no preceding file-start");
                false
            }
        }
    }

    /// Freezes the file at `path`; later chunks for it are ignored.
    pub fn complete(&mut self, path: &str) {
        if let Some(file) = self.files.get_mut(path) {
            file.completed = true;
        } else {
            warn!(path, "file-complete for unknown path");
        }
    }

    /// Replaces the live view with the authoritative final list.
    pub fn reconcile(&mut self, finals: Vec<FinalFile>) {
        self.order.clear();
        self.files.clear();
        for file in finals {
            self.order.push(file.path.clone());
            self.files.insert(
                file.path.clone(),
                GeneratedFile {
                    path: file.path,
                    content: file.content,
                    file_type: file.file_type,
                    completed: true,
                    edited: false,
                },
            );
        }
    }

    pub fn get(&self, path: &str) -> Option<&GeneratedFile> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files in first-seen stream order.
    pub fn into_files(self) -> Vec<GeneratedFile> {
        let mut files = self.files;
        self.order
            .into_iter()
            .filter_map(|path| files.remove(&path))
            .collect()
    }
}

/// Current narration from the generating model.
#[derive(Clone, Debug, PartialEq)]
pub struct ThinkingNote {
    pub message: String,
    pub duration_ms: Option<u64>,
}

/// Events delivered to the consumer of a generation session.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationEvent {
    State(GenerationState),
    FileStarted { path: String },
    FileChunk { path: String, chunk: String },
    FileCompleted { path: String },
    Thinking(ThinkingNote),
    Status { event: String, raw: String },
}

/// Final result of a completed session.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOutcome {
    /// Files in stream order; reconciled against the `complete` payload
    /// when the server sent one.
    pub files: Vec<GeneratedFile>,
    pub message: Option<String>,
    /// Last narration observed before completion.
    pub thinking: Option<ThinkingNote>,
}

/// Live generation session handle.
pub struct GenerationSession {
    rx: mpsc::Receiver<GenerationEvent>,
    final_rx: oneshot::Receiver<Result<GenerationOutcome, GenerationFailure>>,
    abort: AbortHandle,
    saw_terminal: bool,
}

impl GenerationSession {
    /// Drives an already-open stream as a generation session.
    pub fn attach(handle: StreamHandle, options: GenerationOptions) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_CAPACITY);
        let (final_tx, final_rx) = oneshot::channel();
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort = AbortHandle::new(abort_tx);
        tokio::spawn(generation_task(handle, options, tx, final_tx, abort_rx));
        Self {
            rx,
            final_rx,
            abort,
            saw_terminal: false,
        }
    }

    /// Returns a handle that cancels the session.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Waits for the next event; `None` after the session ends.
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        let event = self.rx.recv().await;
        if let Some(GenerationEvent::State(
            GenerationState::Completed | GenerationState::Failed | GenerationState::TimedOut,
        )) = &event
        {
            self.saw_terminal = true;
        }
        event
    }

    /// Drains remaining events (if needed) and returns the final result.
    pub async fn finish(mut self) -> Result<GenerationOutcome, GenerationFailure> {
        while !self.saw_terminal {
            match self.rx.recv().await {
                Some(GenerationEvent::State(
                    GenerationState::Completed
                    | GenerationState::Failed
                    | GenerationState::TimedOut,
                )) => self.saw_terminal = true,
                Some(_) => {}
                None => break,
            }
        }
        match self.final_rx.await {
            Ok(result) => result,
            Err(_) => Err(GenerationFailure::Transport {
                message: "generation task ended without a final result".into(),
            }),
        }
    }
}

async fn generation_task(
    mut handle: StreamHandle,
    options: GenerationOptions,
    tx: mpsc::Sender<GenerationEvent>,
    final_tx: oneshot::Sender<Result<GenerationOutcome, GenerationFailure>>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let deadline = tokio::time::Instant::now() + options.timeout;
    let timeout = tokio::time::sleep_until(deadline);
    tokio::pin!(timeout);

    let _ = tx
        .send(GenerationEvent::State(GenerationState::Connecting))
        .await;

    let mut files = FileSet::default();
    let mut thinking: Option<ThinkingNote> = None;
    let mut streaming = false;

    loop {
        tokio::select! {
            _ = &mut timeout => {
                handle.abort_handle().abort();
                let _ = tx.send(GenerationEvent::State(GenerationState::TimedOut)).await;
                let _ = final_tx.send(Err(GenerationFailure::TimedOut));
                return;
            }
            _ = aborted(&mut abort_rx) => {
                handle.abort_handle().abort();
                let _ = tx.send(GenerationEvent::State(GenerationState::Failed)).await;
                let _ = final_tx.send(Err(GenerationFailure::Cancelled));
                return;
            }
            item = handle.next() => {
                let event = match item {
                    Some(TransportItem::Event(event)) => event,
                    Some(TransportItem::Disconnected) | None => {
                        let _ = tx.send(GenerationEvent::State(GenerationState::Failed)).await;
                        let _ = final_tx.send(Err(GenerationFailure::Disconnected));
                        return;
                    }
                    Some(TransportItem::Failed(err)) => {
                        let _ = tx.send(GenerationEvent::State(GenerationState::Failed)).await;
                        let _ = final_tx.send(Err(err.into()));
                        return;
                    }
                };
                if !streaming {
                    streaming = true;
                    let _ = tx.send(GenerationEvent::State(GenerationState::Streaming)).await;
                }
                match event {
                    StreamEvent::FileStart { path, file_type } => {
                        files.start(&path, file_type);
                        let _ = tx.send(GenerationEvent::FileStarted { path }).await;
                    }
                    StreamEvent::FileContent { path, chunk } => {
                        if files.append(&path, &chunk) {
                            let _ = tx.send(GenerationEvent::FileChunk { path, chunk }).await;
                        }
                    }
                    StreamEvent::FileComplete { path } => {
                        files.complete(&path);
                        let _ = tx.send(GenerationEvent::FileCompleted { path }).await;
                    }
                    StreamEvent::Thinking { message, duration_ms } => {
                        let note = ThinkingNote { message, duration_ms };
                        thinking = Some(note.clone());
                        let _ = tx.send(GenerationEvent::Thinking(note)).await;
                    }
                    StreamEvent::Status { event, raw } => {
                        let _ = tx.send(GenerationEvent::Status { event, raw }).await;
                    }
                    StreamEvent::Error(message) => {
                        let _ = tx.send(GenerationEvent::State(GenerationState::Failed)).await;
                        let _ = final_tx.send(Err(GenerationFailure::Server { message }));
                        return;
                    }
                    StreamEvent::Complete(payload) => {
                        let message = finalize(&mut files, payload);
                        let _ = tx.send(GenerationEvent::State(GenerationState::Completed)).await;
                        let _ = final_tx.send(Ok(GenerationOutcome {
                            files: files.into_files(),
                            message,
                            thinking,
                        }));
                        return;
                    }
                    StreamEvent::Log(_) | StreamEvent::Heartbeat => {
                        debug!("ignoring log-stream event on generation stream");
                    }
                }
            }
        }
    }
}

fn finalize(files: &mut FileSet, payload: Option<CompletePayload>) -> Option<String> {
    let Some(payload) = payload else {
        return None;
    };
    if let Some(finals) = payload.files {
        files.reconcile(finals);
    }
    payload.message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;

    fn scripted_handle(items: Vec<TransportItem>) -> StreamHandle {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            tx.try_send(item).expect("buffer sized for script");
        }
        StreamHandle::from_parts(rx, AbortHandle::dummy())
    }

    fn file_event(event: StreamEvent) -> TransportItem {
        TransportItem::Event(event)
    }

    mod file_set {
        use super::*;

        #[test]
        fn append_only_until_complete_then_frozen() {
            let mut files = FileSet::default();
            files.start("src/App.tsx", Some("tsx".into()));
            assert!(files.append("src/App.tsx", "ab"));
            assert!(files.append("src/App.tsx", "cd"));
            files.complete("src/App.tsx");

            let file = files.get("src/App.tsx").expect("file");
            assert_eq!(file.content, "abcd");
            assert!(file.completed);

            assert!(!files.append("src/App.tsx", "ef"));
            assert_eq!(files.get("src/App.tsx").expect("file").content, "abcd");
        }

        #[test]
        fn chunk_without_start_is_a_no_op() {
            let mut files = FileSet::default();
            assert!(!files.append("missing.ts", "x"));
            assert!(files.is_empty());
        }

        #[test]
        fn restart_replaces_existing_entry() {
            let mut files = FileSet::default();
            files.start("a.ts", None);
            files.append("a.ts", "old");
            files.start("a.ts", Some("ts".into()));
            let file = files.get("a.ts").expect("file");
            assert_eq!(file.content, "");
            assert!(!file.completed);
            assert_eq!(files.len(), 1);
        }

        #[test]
        fn reconcile_replaces_live_view() {
            let mut files = FileSet::default();
            files.start("a.ts", None);
            files.append("a.ts", "partial");
            files.reconcile(vec![FinalFile {
                path: "b.ts".into(),
                content: "whole".into(),
                file_type: Some("ts".into()),
            }]);
            assert!(files.get("a.ts").is_none());
            let file = files.get("b.ts").expect("file");
            assert_eq!(file.content, "whole");
            assert!(file.completed);
        }

        #[test]
        fn into_files_preserves_stream_order() {
            let mut files = FileSet::default();
            files.start("z.ts", None);
            files.start("a.ts", None);
            let order: Vec<_> = files.into_files().into_iter().map(|f| f.path).collect();
            assert_eq!(order, vec!["z.ts", "a.ts"]);
        }
    }

    #[tokio::test]
    async fn assembles_files_and_completes() {
        let handle = scripted_handle(vec![
            file_event(StreamEvent::Thinking {
                message: "planning".into(),
                duration_ms: Some(1200),
            }),
            file_event(StreamEvent::FileStart {
                path: "src/App.tsx".into(),
                file_type: Some("tsx".into()),
            }),
            file_event(StreamEvent::FileContent {
                path: "src/App.tsx".into(),
                chunk: "export".into(),
            }),
            file_event(StreamEvent::FileContent {
                path: "src/App.tsx".into(),
                chunk: " {}".into(),
            }),
            file_event(StreamEvent::FileComplete {
                path: "src/App.tsx".into(),
            }),
            file_event(StreamEvent::Complete(None)),
        ]);
        let session = GenerationSession::attach(handle, GenerationOptions::default());
        let outcome = session.finish().await.expect("completed");
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].content, "export {}");
        assert!(outcome.files[0].completed);
        assert_eq!(outcome.thinking.expect("thinking").message, "planning");
    }

    #[tokio::test]
    async fn complete_payload_is_ground_truth() {
        let handle = scripted_handle(vec![
            file_event(StreamEvent::FileStart {
                path: "a.ts".into(),
                file_type: None,
            }),
            file_event(StreamEvent::FileContent {
                path: "a.ts".into(),
                chunk: "partial".into(),
            }),
            file_event(StreamEvent::Complete(Some(CompletePayload {
                files: Some(vec![FinalFile {
                    path: "a.ts".into(),
                    content: "full content".into(),
                    file_type: Some("ts".into()),
                }]),
                message: Some("done".into()),
            }))),
        ]);
        let session = GenerationSession::attach(handle, GenerationOptions::default());
        let outcome = session.finish().await.expect("completed");
        assert_eq!(outcome.files[0].content, "full content");
        assert_eq!(outcome.message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn disconnect_without_complete_is_terminal_failure() {
        let handle = scripted_handle(vec![
            file_event(StreamEvent::FileStart {
                path: "a.ts".into(),
                file_type: None,
            }),
            TransportItem::Disconnected,
        ]);
        let session = GenerationSession::attach(handle, GenerationOptions::default());
        assert_eq!(
            session.finish().await,
            Err(GenerationFailure::Disconnected)
        );
    }

    #[tokio::test]
    async fn server_error_frame_fails_the_session() {
        let handle = scripted_handle(vec![file_event(StreamEvent::Error("boom".into()))]);
        let session = GenerationSession::attach(handle, GenerationOptions::default());
        assert_eq!(
            session.finish().await,
            Err(GenerationFailure::Server {
                message: "boom".into()
            })
        );
    }

    #[tokio::test]
    async fn transport_failure_maps_to_transport_error() {
        let handle = scripted_handle(vec![TransportItem::Failed(TransportError::connect(
            "refused",
        ))]);
        let session = GenerationSession::attach(handle, GenerationOptions::default());
        assert!(matches!(
            session.finish().await,
            Err(GenerationFailure::Transport { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_despite_steady_activity() {
        let (tx, rx) = mpsc::channel(8);
        let handle = StreamHandle::from_parts(rx, AbortHandle::dummy());
        tokio::spawn(async move {
            let start = file_event(StreamEvent::FileStart {
                path: "a.ts".into(),
                file_type: None,
            });
            if tx.send(start).await.is_err() {
                return;
            }
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                let chunk = file_event(StreamEvent::FileContent {
                    path: "a.ts".into(),
                    chunk: "x".into(),
                });
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        });

        let options = GenerationOptions {
            timeout: Duration::from_secs(600),
        };
        let started = tokio::time::Instant::now();
        let mut session = GenerationSession::attach(handle, options);

        let mut saw_timeout_state = false;
        while let Some(event) = session.next_event().await {
            if event == GenerationEvent::State(GenerationState::TimedOut) {
                saw_timeout_state = true;
                break;
            }
        }
        assert!(saw_timeout_state);
        assert_eq!(started.elapsed(), Duration::from_secs(600));
        assert_eq!(session.finish().await, Err(GenerationFailure::TimedOut));
    }

    #[tokio::test]
    async fn cancellation_is_terminal_and_idempotent() {
        let (_tx, rx) = mpsc::channel::<TransportItem>(1);
        let handle = StreamHandle::from_parts(rx, AbortHandle::dummy());
        let session = GenerationSession::attach(handle, GenerationOptions::default());
        let abort = session.abort_handle();
        abort.abort();
        abort.abort();
        assert_eq!(session.finish().await, Err(GenerationFailure::Cancelled));
    }
}

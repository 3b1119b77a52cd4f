//! Reconnecting subscriber for a job's SSE log stream.
//!
//! The stream has no resume offset: a reconnect is a fresh view, and
//! events emitted during the disconnect window are lost. The subscriber
//! therefore only reconnects while the job can still produce logs — a
//! status re-poll confirming a terminal job suppresses the reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::api::{JobStatusSource, LogStreamConnector};
use crate::errors::{CloseReason, SubscribeFailure};
use crate::events::{LogEntry, StreamEvent};
use crate::transport::{AbortHandle, TransportItem, aborted};

const EVENT_BUFFER_CAPACITY: usize = 128;

/// Backoff tuning for reconnect attempts.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive-failure budget; a successful re-open resets it.
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the retry following the n-th consecutive failure
    /// (0-based): `min(base * 2^n, max)`.
    fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Subscriber lifecycle states. Every transition is delivered to the
/// consumer as a [`JobLogEvent::State`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Open,
    /// Waiting out the backoff before reconnect attempt `attempt`
    /// (1-based), so a human can watch progress.
    Reconnecting { attempt: u32, delay: Duration },
    Closed(CloseReason),
}

/// Events delivered to the consumer of a log subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum JobLogEvent {
    State(SubscriberState),
    Log(LogEntry),
    /// Liveness signal — either a dedicated heartbeat frame or a log
    /// entry tagged with the heartbeat level. Never appended to logs.
    Heartbeat,
    /// Unmodeled wire event, passed through untouched.
    Status { event: String, raw: String },
    /// Server-reported stream failure; the stream usually drops after.
    ServerError(String),
    /// Terminal failure after the reconnect budget ran out.
    Failed(SubscribeFailure),
}

/// Live subscription handle.
pub struct JobLogSubscription {
    rx: mpsc::Receiver<JobLogEvent>,
    cancel: AbortHandle,
}

impl JobLogSubscription {
    /// Waits for the next event; `None` once the subscription is closed.
    pub async fn next_event(&mut self) -> Option<JobLogEvent> {
        self.rx.recv().await
    }

    /// Returns a handle that cancels the subscription, aborting any
    /// in-flight stream and suppressing scheduled reconnects.
    pub fn cancel_handle(&self) -> AbortHandle {
        self.cancel.clone()
    }
}

/// Opens reconnecting log subscriptions for job ids.
pub struct JobLogSubscriber {
    connector: Arc<dyn LogStreamConnector>,
    status: Arc<dyn JobStatusSource>,
    policy: ReconnectPolicy,
}

impl JobLogSubscriber {
    pub fn new(connector: Arc<dyn LogStreamConnector>, status: Arc<dyn JobStatusSource>) -> Self {
        Self {
            connector,
            status,
            policy: ReconnectPolicy::default(),
        }
    }

    /// Overrides the reconnect policy.
    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Subscribes to the log stream of `job_id`.
    pub fn subscribe(&self, job_id: impl Into<String>) -> JobLogSubscription {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel = AbortHandle::new(cancel_tx);
        tokio::spawn(subscribe_task(
            uuid::Uuid::new_v4(),
            self.connector.clone(),
            self.status.clone(),
            self.policy,
            job_id.into(),
            tx,
            cancel_rx,
        ));
        JobLogSubscription { rx, cancel }
    }
}

async fn subscribe_task(
    subscription_id: uuid::Uuid,
    connector: Arc<dyn LogStreamConnector>,
    status: Arc<dyn JobStatusSource>,
    policy: ReconnectPolicy,
    job_id: String,
    tx: mpsc::Sender<JobLogEvent>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    debug!(%subscription_id, %job_id, "subscribing to job logs");
    let mut failures: u32 = 0;
    let mut last_error = String::from("stream disconnected");

    if !send(&tx, JobLogEvent::State(SubscriberState::Connecting)).await {
        return;
    }

    loop {
        let mut handle = tokio::select! {
            _ = aborted(&mut cancel_rx) => {
                let _ = send(&tx, JobLogEvent::State(SubscriberState::Closed(CloseReason::Cancelled))).await;
                return;
            }
            handle = connector.connect_logs(&job_id) => handle,
        };

        let mut opened = false;
        let session_end = loop {
            let item = tokio::select! {
                _ = aborted(&mut cancel_rx) => {
                    handle.abort_handle().abort();
                    let _ = send(&tx, JobLogEvent::State(SubscriberState::Closed(CloseReason::Cancelled))).await;
                    return;
                }
                item = handle.next() => item,
            };
            match item {
                Some(TransportItem::Event(event)) => {
                    if !opened {
                        opened = true;
                        failures = 0;
                        if !send(&tx, JobLogEvent::State(SubscriberState::Open)).await {
                            return;
                        }
                    }
                    match event {
                        StreamEvent::Complete(_) => {
                            let _ = send(
                                &tx,
                                JobLogEvent::State(SubscriberState::Closed(CloseReason::Complete)),
                            )
                            .await;
                            return;
                        }
                        StreamEvent::Log(entry) if entry.is_heartbeat() => {
                            if !send(&tx, JobLogEvent::Heartbeat).await {
                                return;
                            }
                        }
                        StreamEvent::Log(entry) => {
                            if !send(&tx, JobLogEvent::Log(entry)).await {
                                return;
                            }
                        }
                        StreamEvent::Heartbeat => {
                            if !send(&tx, JobLogEvent::Heartbeat).await {
                                return;
                            }
                        }
                        StreamEvent::Error(message) => {
                            last_error = message.clone();
                            if !send(&tx, JobLogEvent::ServerError(message)).await {
                                return;
                            }
                        }
                        StreamEvent::Status { event, raw } => {
                            if !send(&tx, JobLogEvent::Status { event, raw }).await {
                                return;
                            }
                        }
                        StreamEvent::FileStart { .. }
                        | StreamEvent::FileContent { .. }
                        | StreamEvent::FileComplete { .. }
                        | StreamEvent::Thinking { .. } => {
                            debug!(%job_id, "ignoring generation event on log stream");
                        }
                    }
                }
                Some(TransportItem::Disconnected) | None => break SessionEnd::Disconnected,
                Some(TransportItem::Failed(err)) => {
                    last_error = err.to_string();
                    break SessionEnd::Failed;
                }
            }
        };
        debug!(%subscription_id, %job_id, ?session_end, failures, "log stream session ended");

        // Reconnect decision: a terminal job cannot produce more logs, so
        // a confirmed terminal status closes cleanly instead of retrying.
        match status.job_status(&job_id).await {
            Ok(snapshot) if snapshot.status.is_terminal() => {
                let _ = send(
                    &tx,
                    JobLogEvent::State(SubscriberState::Closed(CloseReason::JobTerminal(
                        snapshot.status,
                    ))),
                )
                .await;
                return;
            }
            Ok(_) => {}
            Err(err) => {
                // Cannot prove the job is terminal; the retry budget stays
                // the only bound.
                debug!(%job_id, error = %err, "status poll failed during reconnect decision");
            }
        }

        if failures >= policy.max_retries {
            warn!(%job_id, attempts = failures, "reconnect budget exhausted");
            let _ = send(
                &tx,
                JobLogEvent::Failed(SubscribeFailure::RetriesExhausted {
                    attempts: failures,
                    last_error: last_error.clone(),
                }),
            )
            .await;
            let _ = send(
                &tx,
                JobLogEvent::State(SubscriberState::Closed(CloseReason::GaveUp)),
            )
            .await;
            return;
        }

        let delay = policy.delay_for(failures);
        failures += 1;
        if !send(
            &tx,
            JobLogEvent::State(SubscriberState::Reconnecting {
                attempt: failures,
                delay,
            }),
        )
        .await
        {
            return;
        }
        tokio::select! {
            _ = aborted(&mut cancel_rx) => {
                let _ = send(&tx, JobLogEvent::State(SubscriberState::Closed(CloseReason::Cancelled))).await;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[derive(Debug)]
enum SessionEnd {
    Disconnected,
    Failed,
}

async fn send(tx: &mpsc::Sender<JobLogEvent>, event: JobLogEvent) -> bool {
    tx.send(event).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{JobState, JobStatus};
    use crate::errors::{ApiError, TransportError};
    use crate::transport::StreamHandle;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Script {
        Fail(TransportError),
        Items(Vec<TransportItem>),
    }

    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Script>>,
        connects: AtomicU32,
        connect_times: Mutex<Vec<tokio::time::Instant>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                connects: AtomicU32::new(0),
                connect_times: Mutex::new(Vec::new()),
            })
        }

        fn connects(&self) -> u32 {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LogStreamConnector for ScriptedConnector {
        async fn connect_logs(&self, _job_id: &str) -> StreamHandle {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connect_times
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Script::Fail(TransportError::connect("no script")));
            let (tx, rx) = mpsc::channel(32);
            match script {
                Script::Fail(err) => {
                    tx.try_send(TransportItem::Failed(err)).unwrap();
                }
                Script::Items(items) => {
                    for item in items {
                        tx.try_send(item).unwrap();
                    }
                }
            }
            StreamHandle::from_parts(rx, AbortHandle::dummy())
        }
    }

    struct FixedStatus(JobState);

    #[async_trait]
    impl JobStatusSource for FixedStatus {
        async fn job_status(&self, job_id: &str) -> Result<JobStatus, ApiError> {
            Ok(JobStatus {
                id: job_id.to_string(),
                status: self.0,
                current_round: None,
                max_rounds: None,
                contract_locked: None,
                sandbox_id: None,
                sandbox_url: None,
                last_error: None,
                started_at: None,
                completed_at: None,
            })
        }
    }

    fn log_item(message: &str) -> TransportItem {
        TransportItem::Event(StreamEvent::Log(LogEntry {
            timestamp: None,
            role: None,
            message: message.to_string(),
            level: crate::events::LogLevel::Info,
        }))
    }

    fn complete_item() -> TransportItem {
        TransportItem::Event(StreamEvent::Complete(None))
    }

    async fn drain(mut subscription: JobLogSubscription) -> Vec<JobLogEvent> {
        let mut events = Vec::new();
        while let Some(event) = subscription.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn happy_path_delivers_logs_in_order_then_closes() {
        let connector = ScriptedConnector::new(vec![Script::Items(vec![
            log_item("step 1"),
            log_item("step 2"),
            complete_item(),
        ])]);
        let subscriber = JobLogSubscriber::new(connector.clone(), Arc::new(FixedStatus(JobState::Running)));
        let events = drain(subscriber.subscribe("job-1")).await;

        let logs: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                JobLogEvent::Log(entry) => Some(entry.message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(logs, vec!["step 1", "step 2"]);
        assert_eq!(
            events.last(),
            Some(&JobLogEvent::State(SubscriberState::Closed(
                CloseReason::Complete
            )))
        );
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_then_recover_reconnects_once_without_error() {
        let connector = ScriptedConnector::new(vec![
            Script::Items(vec![log_item("step 1"), TransportItem::Disconnected]),
            Script::Items(vec![log_item("step 2"), complete_item()]),
        ]);
        let subscriber = JobLogSubscriber::new(connector.clone(), Arc::new(FixedStatus(JobState::Running)));
        let events = drain(subscriber.subscribe("job-1")).await;

        assert_eq!(connector.connects(), 2);
        assert!(events.iter().any(|event| matches!(
            event,
            JobLogEvent::State(SubscriberState::Reconnecting { attempt: 1, .. })
        )));
        assert!(!events
            .iter()
            .any(|event| matches!(event, JobLogEvent::Failed(_))));
        assert_eq!(
            events.last(),
            Some(&JobLogEvent::State(SubscriberState::Closed(
                CloseReason::Complete
            )))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_ceiling_stops_after_max_attempts_with_expected_backoff() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 10,
        };
        let connector = ScriptedConnector::new(Vec::new());
        let subscriber = JobLogSubscriber::new(connector.clone(), Arc::new(FixedStatus(JobState::Running)))
            .policy(policy);
        let events = drain(subscriber.subscribe("job-1")).await;

        // Initial connect plus the full reconnect budget.
        assert_eq!(connector.connects(), 1 + policy.max_retries);

        let times = connector.connect_times.lock().unwrap().clone();
        let gaps: Vec<Duration> = times.windows(2).map(|pair| pair[1] - pair[0]).collect();
        let expected: Vec<Duration> = (0..policy.max_retries)
            .map(|n| policy.delay_for(n))
            .collect();
        assert_eq!(gaps, expected);
        assert_eq!(
            expected.last(),
            Some(&Duration::from_millis(30_000)),
            "ceiling reached"
        );

        assert!(events.iter().any(|event| matches!(
            event,
            JobLogEvent::Failed(SubscribeFailure::RetriesExhausted { attempts: 10, .. })
        )));
        assert_eq!(
            events.last(),
            Some(&JobLogEvent::State(SubscriberState::Closed(
                CloseReason::GaveUp
            )))
        );
    }

    #[tokio::test]
    async fn terminal_job_status_suppresses_reconnect() {
        let connector = ScriptedConnector::new(vec![Script::Items(vec![
            log_item("step 1"),
            TransportItem::Disconnected,
        ])]);
        let subscriber = JobLogSubscriber::new(
            connector.clone(),
            Arc::new(FixedStatus(JobState::Completed)),
        );
        let events = drain(subscriber.subscribe("job-1")).await;

        assert_eq!(connector.connects(), 1);
        assert!(!events
            .iter()
            .any(|event| matches!(event, JobLogEvent::Failed(_))));
        assert_eq!(
            events.last(),
            Some(&JobLogEvent::State(SubscriberState::Closed(
                CloseReason::JobTerminal(JobState::Completed)
            )))
        );
    }

    #[tokio::test]
    async fn heartbeat_level_entries_route_to_heartbeat_channel() {
        let connector = ScriptedConnector::new(vec![Script::Items(vec![
            TransportItem::Event(StreamEvent::Log(LogEntry {
                timestamp: None,
                role: Some("SYSTEM".into()),
                message: "ping".into(),
                level: crate::events::LogLevel::Heartbeat,
            })),
            TransportItem::Event(StreamEvent::Heartbeat),
            log_item("real work"),
            complete_item(),
        ])]);
        let subscriber = JobLogSubscriber::new(connector, Arc::new(FixedStatus(JobState::Running)));
        let events = drain(subscriber.subscribe("job-1")).await;

        let heartbeats = events
            .iter()
            .filter(|event| matches!(event, JobLogEvent::Heartbeat))
            .count();
        let logs: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                JobLogEvent::Log(entry) => Some(entry.message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(heartbeats, 2);
        assert_eq!(logs, vec!["real work"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_suppresses_scheduled_reconnect() {
        let connector = ScriptedConnector::new(vec![Script::Items(vec![
            log_item("step 1"),
            TransportItem::Disconnected,
        ])]);
        let subscriber = JobLogSubscriber::new(connector.clone(), Arc::new(FixedStatus(JobState::Running)));
        let mut subscription = subscriber.subscribe("job-1");
        let cancel = subscription.cancel_handle();

        let mut events = Vec::new();
        while let Some(event) = subscription.next_event().await {
            let is_backoff = matches!(
                event,
                JobLogEvent::State(SubscriberState::Reconnecting { .. })
            );
            events.push(event);
            if is_backoff {
                cancel.abort();
                cancel.abort();
            }
        }

        assert_eq!(connector.connects(), 1, "no reconnect after cancel");
        assert_eq!(
            events.last(),
            Some(&JobLogEvent::State(SubscriberState::Closed(
                CloseReason::Cancelled
            )))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reopen_resets_the_failure_counter() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 2,
        };
        let connector = ScriptedConnector::new(vec![
            Script::Fail(TransportError::connect("refused")),
            Script::Fail(TransportError::connect("refused")),
            Script::Items(vec![log_item("back"), TransportItem::Disconnected]),
            Script::Items(vec![complete_item()]),
        ]);
        let subscriber = JobLogSubscriber::new(connector.clone(), Arc::new(FixedStatus(JobState::Running)))
            .policy(policy);
        let events = drain(subscriber.subscribe("job-1")).await;

        // Two failures exhaust the budget only if the counter never
        // resets; the successful third connect must start it over.
        assert_eq!(connector.connects(), 4);
        assert!(!events
            .iter()
            .any(|event| matches!(event, JobLogEvent::Failed(_))));
        assert_eq!(
            events.last(),
            Some(&JobLogEvent::State(SubscriberState::Closed(
                CloseReason::Complete
            )))
        );
    }
}

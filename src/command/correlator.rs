//! Request/response correlation for device commands
//!
//! Every outbound command gets a fresh correlation key and a pending entry.
//! The entry is removed exactly once: by the matching response, by its
//! deadline, by cancellation, or by channel teardown. Removal happens under
//! the pending-table lock, so whichever path gets there first wins and the
//! others find nothing to do.

use super::timeout::TimeoutSupervisor;
use crate::config::OrchestratorConfig;
use crate::error::{FleetError, Result};
use crate::transport::TransportChannel;
use bytes::Bytes;
use fleet_shared::{CorrelationKey, JobId, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sender identity stamped on every outbound command
const ORCHESTRATOR_ID: &str = "orchestrator";

/// A command to send to one device
#[derive(Debug, Clone)]
pub struct Request {
    pub target: String,
    pub command: String,
    pub payload: Bytes,
    /// Job on whose behalf the request is sent; stopping that job cancels it
    pub owner: Option<JobId>,
}

impl Request {
    pub fn new(
        target: impl Into<String>,
        command: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            target: target.into(),
            command: command.into(),
            payload: payload.into(),
            owner: None,
        }
    }

    pub fn owned_by(mut self, job_id: JobId) -> Self {
        self.owner = Some(job_id);
        self
    }
}

/// The inbound message that resolved a request
#[derive(Debug, Clone)]
pub struct Response {
    pub key: CorrelationKey,
    pub topic: String,
    pub sender: String,
    pub payload: Bytes,
    pub received_at: Instant,
}

impl Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

type Outcome = Result<Response>;

struct PendingRequest {
    target: String,
    reply_topic: String,
    owner: Option<JobId>,
    submitted_at: Instant,
    timeout: Duration,
    slot: oneshot::Sender<Outcome>,
}

type PendingTable = Arc<Mutex<HashMap<CorrelationKey, PendingRequest>>>;

fn lock_table(
    table: &Mutex<HashMap<CorrelationKey, PendingRequest>>,
) -> MutexGuard<'_, HashMap<CorrelationKey, PendingRequest>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle returned by [`Correlator::send`]
#[derive(Debug)]
pub struct PendingHandle {
    key: CorrelationKey,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingHandle {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the request is resolved by a response, its deadline,
    /// cancellation or channel teardown
    pub async fn wait(self) -> Result<Response> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // the slot is only dropped unsent if the correlator itself is gone
            Err(_) => Err(FleetError::Cancelled { key: self.key }),
        }
    }
}

/// How pending requests have been settled so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorStats {
    pub responses: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub teardowns: u64,
    /// Late, duplicate or unknown responses
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    responses: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    teardowns: AtomicU64,
    discarded: AtomicU64,
}

/// Matches device responses to the requests that caused them
pub struct Correlator {
    channel: Arc<dyn TransportChannel>,
    supervisor: TimeoutSupervisor,
    config: Arc<OrchestratorConfig>,
    next_key: AtomicU64,
    pending: PendingTable,
    counters: Arc<Counters>,
}

impl Correlator {
    /// Create a correlator, subscribe it to every reply topic and watch the
    /// channel for teardown
    pub async fn start(
        channel: Arc<dyn TransportChannel>,
        config: Arc<OrchestratorConfig>,
    ) -> Result<Arc<Self>> {
        let correlator = Arc::new(Self {
            channel: channel.clone(),
            supervisor: TimeoutSupervisor::new(config.deadline_granularity),
            config: config.clone(),
            next_key: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        });

        let weak: Weak<Self> = Arc::downgrade(&correlator);
        channel
            .subscribe(
                &config.reply_pattern(),
                Arc::new(move |message: Message| {
                    if let Some(correlator) = weak.upgrade() {
                        correlator.on_message(message);
                    }
                }),
            )
            .await?;

        let weak = Arc::downgrade(&correlator);
        tokio::spawn(async move {
            channel.closed().await;
            if let Some(correlator) = weak.upgrade() {
                let failed = correlator.close();
                warn!(
                    "[CORRELATOR] {} channel torn down, failed {} pending request(s)",
                    channel.name(),
                    failed
                );
            }
        });

        info!(
            "[CORRELATOR] Listening on {} via {}",
            config.reply_pattern(),
            correlator.channel.name()
        );
        Ok(correlator)
    }

    fn next_key(&self) -> CorrelationKey {
        self.next_key.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a pending request and publish it.
    ///
    /// If the channel refuses the publish the pending entry is withdrawn
    /// before this returns and the error is `ChannelUnavailable`.
    pub async fn send(&self, request: Request, timeout: Duration) -> Result<PendingHandle> {
        let key = self.next_key();
        let topic = self.config.command_topic(&request.target, &request.command);
        let deadline = self.supervisor.deadline_after(timeout);
        let (slot, rx) = oneshot::channel();

        // Registered before publishing so an immediate reply finds its entry.
        {
            let mut pending = lock_table(&self.pending);
            if pending.contains_key(&key) {
                return Err(FleetError::Invariant(format!(
                    "correlation key {} already pending",
                    key
                )));
            }
            pending.insert(
                key,
                PendingRequest {
                    reply_topic: self.config.reply_topic(&request.target),
                    target: request.target.clone(),
                    owner: request.owner,
                    submitted_at: Instant::now(),
                    timeout,
                    slot,
                },
            );
        }

        if let Err(e) = self
            .supervisor
            .schedule_at(key, deadline, self.timeout_callback(key))
        {
            lock_table(&self.pending).remove(&key);
            return Err(e);
        }

        let message = Message::new(topic.clone(), key, request.payload).from_sender(ORCHESTRATOR_ID);
        if let Err(e) = self.channel.publish(message).await {
            self.withdraw(key);
            return Err(match e {
                FleetError::ChannelUnavailable { .. } => e,
                other => FleetError::channel(topic, other),
            });
        }

        debug!(
            "[CORRELATOR] >>> {} to {} (key={}, timeout={:?})",
            request.command, request.target, key, timeout
        );

        Ok(PendingHandle { key, deadline, rx })
    }

    /// Send and wait for the response
    pub async fn request(&self, request: Request, timeout: Duration) -> Result<Response> {
        self.send(request, timeout).await?.wait().await
    }

    /// Send with the configured default timeout
    pub async fn request_default(&self, request: Request) -> Result<Response> {
        self.request(request, self.config.request_timeout).await
    }

    /// Delivery path for every inbound reply. Never blocks on the awaiting side.
    pub fn on_message(&self, message: Message) {
        let key = message.correlation_id;
        if key == 0 {
            debug!("[CORRELATOR] Ignoring uncorrelated message on {}", message.topic);
            return;
        }

        let entry = {
            let mut pending = lock_table(&self.pending);
            match pending.get(&key) {
                Some(p) if p.reply_topic != message.topic => {
                    warn!(
                        "[CORRELATOR] Response for {} arrived on {}, expected {}; ignored",
                        key, message.topic, p.reply_topic
                    );
                    return;
                }
                Some(_) => pending.remove(&key),
                None => None,
            }
        };

        let Some(request) = entry else {
            self.counters.discarded.fetch_add(1, Ordering::SeqCst);
            debug!(
                "[CORRELATOR] <<< Discarding response {} from {} (late, duplicate or unknown)",
                key, message.sender
            );
            return;
        };

        self.supervisor.cancel(key);
        self.counters.responses.fetch_add(1, Ordering::SeqCst);

        let received_at = Instant::now();
        debug!(
            "[CORRELATOR] <<< Response {} from {} after {:?}",
            key,
            request.target,
            received_at.duration_since(request.submitted_at)
        );

        let _ = request.slot.send(Ok(Response {
            key,
            topic: message.topic,
            sender: message.sender,
            payload: message.payload,
            received_at,
        }));
    }

    /// Cancel one pending request; its waiter gets `Cancelled`
    pub fn cancel(&self, key: CorrelationKey) -> bool {
        let entry = lock_table(&self.pending).remove(&key);
        match entry {
            Some(request) => {
                self.supervisor.cancel(key);
                self.counters.cancellations.fetch_add(1, Ordering::SeqCst);
                let _ = request.slot.send(Err(FleetError::Cancelled { key }));
                true
            }
            None => false,
        }
    }

    /// Cancel every pending request sent on behalf of `job_id`
    pub fn cancel_owned_by(&self, job_id: JobId) -> usize {
        let keys: Vec<CorrelationKey> = lock_table(&self.pending)
            .iter()
            .filter(|(_, p)| p.owner == Some(job_id))
            .map(|(key, _)| *key)
            .collect();

        let cancelled = keys.into_iter().filter(|key| self.cancel(*key)).count();
        if cancelled > 0 {
            info!(
                "[CORRELATOR] Cancelled {} request(s) of job {}",
                cancelled, job_id
            );
        }
        cancelled
    }

    /// Fail every pending request with `ChannelUnavailable`
    pub fn close(&self) -> usize {
        let drained: Vec<(CorrelationKey, PendingRequest)> =
            lock_table(&self.pending).drain().collect();

        let count = drained.len();
        for (key, request) in drained {
            self.supervisor.cancel(key);
            self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
            let _ = request.slot.send(Err(FleetError::channel(
                request.reply_topic,
                "channel torn down while request was pending",
            )));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock_table(&self.pending).len()
    }

    pub fn pending_count_for(&self, target: &str) -> usize {
        lock_table(&self.pending)
            .values()
            .filter(|p| p.target == target)
            .count()
    }

    pub fn stats(&self) -> CorrelatorStats {
        CorrelatorStats {
            responses: self.counters.responses.load(Ordering::SeqCst),
            timeouts: self.counters.timeouts.load(Ordering::SeqCst),
            cancellations: self.counters.cancellations.load(Ordering::SeqCst),
            teardowns: self.counters.teardowns.load(Ordering::SeqCst),
            discarded: self.counters.discarded.load(Ordering::SeqCst),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Remove an entry whose publish failed; nobody is waiting on it yet
    fn withdraw(&self, key: CorrelationKey) {
        lock_table(&self.pending).remove(&key);
        self.supervisor.cancel(key);
    }

    // Runs on the supervisor task with the deadline queue locked. Takes only
    // the pending-table lock, which no path holds while touching the queue.
    fn timeout_callback(&self, key: CorrelationKey) -> Box<dyn FnOnce() + Send> {
        let table = self.pending.clone();
        let counters = self.counters.clone();

        Box::new(move || {
            let entry = lock_table(&table).remove(&key);
            if let Some(request) = entry {
                counters.timeouts.fetch_add(1, Ordering::SeqCst);
                warn!(
                    "[TIMEOUT] Request {} to {} timed out after {:?}",
                    key, request.target, request.timeout
                );
                let _ = request.slot.send(Err(FleetError::RequestTimeout {
                    key,
                    timeout: request.timeout,
                }));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedDevice;
    use crate::transport::MemoryBroker;

    async fn setup(granularity: Duration) -> (Arc<MemoryBroker>, Arc<Correlator>) {
        let broker = Arc::new(MemoryBroker::new());
        let config = Arc::new(OrchestratorConfig::default().with_deadline_granularity(granularity));
        let correlator = Correlator::start(broker.clone(), config)
            .await
            .expect("start correlator");
        (broker, correlator)
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_before_deadline_wins() {
        let (broker, correlator) = setup(Duration::ZERO).await;
        let device = SimulatedDevice::new("edge-1", "1.0").with_reply_delay(Duration::from_millis(20));
        device.attach(broker.clone(), "fleet").await.expect("attach");

        let response = correlator
            .request(Request::new("edge-1", "status", ""), Duration::from_millis(100))
            .await
            .expect("request");
        assert_eq!(response.text(), "version=1.0");
        assert_eq!(response.sender, "edge-1");

        // well past the original deadline: the timeout must never fire
        tokio::time::sleep(Duration::from_millis(500)).await;
        let stats = correlator.stats();
        assert_eq!(stats.responses, 1);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator.supervisor.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_discarded() {
        let (broker, correlator) = setup(Duration::ZERO).await;
        let device = SimulatedDevice::new("edge-1", "1.0").with_reply_delay(Duration::from_millis(300));
        device.attach(broker.clone(), "fleet").await.expect("attach");

        let err = correlator
            .request(Request::new("edge-1", "status", ""), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::RequestTimeout { .. }));

        // let the late reply arrive
        tokio::time::sleep(Duration::from_millis(400)).await;
        let stats = correlator.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.responses, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_unavailable_registers_nothing() {
        let (broker, correlator) = setup(Duration::ZERO).await;
        broker.set_available(false);

        let err = correlator
            .send(Request::new("edge-1", "status", ""), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::ChannelUnavailable { .. }));
        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator.supervisor.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_owned_by_only_touches_that_job() {
        let (_broker, correlator) = setup(Duration::ZERO).await;

        let mine = correlator
            .send(Request::new("edge-1", "deploy", "").owned_by(1), Duration::from_secs(5))
            .await
            .expect("send");
        let other = correlator
            .send(Request::new("edge-2", "deploy", "").owned_by(2), Duration::from_secs(5))
            .await
            .expect("send");

        assert_eq!(correlator.cancel_owned_by(1), 1);
        assert!(matches!(mine.wait().await, Err(FleetError::Cancelled { .. })));
        assert_eq!(correlator.pending_count_for("edge-2"), 1);

        let other_key = other.key();
        let err = other.wait().await.unwrap_err();
        assert!(matches!(err, FleetError::RequestTimeout { key, .. } if key == other_key));

        let stats = correlator.stats();
        assert_eq!((stats.cancellations, stats.timeouts), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_stays_pending() {
        let (_broker, correlator) = setup(Duration::from_millis(10)).await;

        let handle = correlator
            .send(Request::new("edge-1", "status", ""), Duration::MAX)
            .await
            .expect("send");
        assert_eq!(correlator.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(correlator.stats().timeouts, 0);

        assert!(correlator.cancel(handle.key()));
        assert!(matches!(handle.wait().await, Err(FleetError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_teardown_fails_pending_requests() {
        let (broker, correlator) = setup(Duration::ZERO).await;

        let handle = correlator
            .send(Request::new("edge-1", "status", ""), Duration::from_secs(30))
            .await
            .expect("send");
        broker.close();

        let err = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("teardown never reached waiter")
            .unwrap_err();
        assert!(matches!(err, FleetError::ChannelUnavailable { .. }));
        assert_eq!(correlator.stats().teardowns, 1);
    }

    #[tokio::test]
    async fn test_reply_from_wrong_target_is_ignored() {
        let (_broker, correlator) = setup(Duration::ZERO).await;
        let handle = correlator
            .send(Request::new("edge-1", "status", ""), Duration::from_secs(5))
            .await
            .expect("send");
        let key = handle.key();

        correlator.on_message(Message::new("fleet/edge-9/reply", key, "spoofed"));
        assert_eq!(correlator.pending_count(), 1);

        correlator.on_message(Message::new("fleet/edge-1/reply", key, "version=2"));
        let response = handle.wait().await.expect("resolved");
        assert_eq!(response.text(), "version=2");

        // duplicate delivery after resolution
        correlator.on_message(Message::new("fleet/edge-1/reply", key, "version=2"));
        assert_eq!(correlator.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_every_request_settles_exactly_once() {
        let (broker, correlator) = setup(Duration::from_millis(1)).await;
        // replies land around the deadline so both paths race
        let device = SimulatedDevice::new("edge-1", "1.0").with_reply_delay(Duration::from_millis(10));
        device.attach(broker.clone(), "fleet").await.expect("attach");

        let mut waits = Vec::new();
        for i in 0..64u64 {
            let correlator = correlator.clone();
            waits.push(tokio::spawn(async move {
                let timeout = Duration::from_millis(5 + (i % 10));
                correlator
                    .request(Request::new("edge-1", "status", ""), timeout)
                    .await
            }));
        }

        let mut ok = 0;
        let mut timed_out = 0;
        for wait in waits {
            match wait.await.expect("task panicked") {
                Ok(_) => ok += 1,
                Err(FleetError::RequestTimeout { .. }) => timed_out += 1,
                Err(other) => panic!("unexpected outcome: {}", other),
            }
        }

        let stats = correlator.stats();
        assert_eq!(ok + timed_out, 64);
        assert_eq!(stats.responses, ok);
        assert_eq!(stats.timeouts, timed_out);
        assert_eq!(correlator.pending_count(), 0);
    }
}

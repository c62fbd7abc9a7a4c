//! One provider session on a dedicated task
//!
//! Callers talk to the task through an unbounded channel and get their
//! answer on a oneshot. The task drains the channel into a priority heap and
//! runs exactly one provider call at a time. It retires itself after the idle
//! timeout, after a fatal error, or when every handle has been dropped.

use super::{
    AtomicState, ConnectionError, ConnectionSettings, ConnectionSlot, ConnectionState, Request,
    RequestError, RequestPayload, RequestPriority, Response,
};
use crate::classifier::{ErrorClassifier, ErrorKind};
use crate::metrics::ProviderCallMetrics;
use crate::provider::{ProviderConnector, ProviderError, ProviderSession};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

type Reply = oneshot::Sender<Result<Response, RequestError>>;

struct Envelope {
    request: Request,
    reply: Reply,
}

struct Queued {
    priority: RequestPriority,
    seq: u64,
    envelope: Envelope,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence number (FIFO).
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Shared {
    state: AtomicState,
    last_activity: Mutex<Instant>,
    pending: AtomicUsize,
    shutdown: Notify,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicState::new(ConnectionState::Connecting),
            last_activity: Mutex::new(Instant::now()),
            pending: AtomicUsize::new(0),
            shutdown: Notify::new(),
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to one provider session running on its own task
pub struct Connection {
    identity: i32,
    settings: ConnectionSettings,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Envelope>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("endpoint", &self.settings.endpoint)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Connection {
    /// Spawn the session task and wait for its handshake.
    ///
    /// Returns once the connection is `Healthy`; a failed or timed-out
    /// handshake leaves the task `Closed` and is reported as
    /// [`ConnectionError::Handshake`].
    pub async fn open(
        connector: Arc<dyn ProviderConnector>,
        identity: i32,
        settings: ConnectionSettings,
        classifier: Arc<ErrorClassifier>,
    ) -> Result<Self, ConnectionError> {
        let shared = Arc::new(Shared::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), ProviderError>>();

        let worker_shared = Arc::clone(&shared);
        let endpoint = settings.endpoint.clone();
        let handshake_timeout = settings.handshake_timeout;
        let idle_timeout = settings.idle_timeout;
        let request_timeout = settings.request_timeout;
        let span = info_span!("connection", identity, endpoint = %endpoint);

        let task = tokio::spawn(
            async move {
                let handshake =
                    timeout(handshake_timeout, connector.connect(identity, &endpoint)).await;
                let session = match handshake {
                    Ok(Ok(session)) => session,
                    Ok(Err(error)) => {
                        worker_shared.state.set(ConnectionState::Closed);
                        let _ = ready_tx.send(Err(error));
                        return;
                    }
                    Err(_) => {
                        worker_shared.state.set(ConnectionState::Closed);
                        let _ = ready_tx.send(Err(ProviderError::message(format!(
                            "handshake timed out after {handshake_timeout:?}"
                        ))));
                        return;
                    }
                };

                worker_shared.touch();
                worker_shared.state.set(ConnectionState::Healthy);
                if ready_tx.send(Ok(())).is_err() {
                    // Opener went away; nothing can reach this session.
                    worker_shared.state.set(ConnectionState::Stale);
                }

                Worker {
                    identity,
                    session,
                    rx,
                    shared: worker_shared,
                    classifier,
                    idle_timeout,
                    request_timeout,
                    queue: BinaryHeap::new(),
                    seq: 0,
                }
                .run()
                .await;
            }
            .instrument(span),
        );

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(identity, endpoint = %settings.endpoint, "Connection established");
                Ok(Self {
                    identity,
                    settings,
                    shared,
                    tx,
                    task: Mutex::new(Some(task)),
                })
            }
            Ok(Err(error)) => Err(ConnectionError::Handshake { identity, error }),
            Err(_) => Err(ConnectionError::Handshake {
                identity,
                error: ProviderError::message("connection task ended during handshake"),
            }),
        }
    }

    /// Queue a request and wait for its answer.
    ///
    /// The request timeout covers both the wait in the queue and the provider
    /// round trip. On timeout the caller stops waiting and the task abandons
    /// the call if it is still running.
    pub async fn submit(&self, request: Request) -> Result<Response, RequestError> {
        if self.state() != ConnectionState::Healthy {
            return Err(RequestError::ConnectionClosed);
        }

        let (reply, answer) = oneshot::channel();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Envelope { request, reply }).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(RequestError::ConnectionClosed);
        }

        match timeout(self.settings.request_timeout, answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ConnectionClosed),
            Err(_) => {
                warn!(
                    identity = self.identity,
                    timeout_secs = self.settings.request_timeout.as_secs(),
                    "Request timed out"
                );
                Err(RequestError::Timeout(self.settings.request_timeout))
            }
        }
    }

    /// Client identity of the session
    pub fn identity(&self) -> i32 {
        self.identity
    }

    /// Provider endpoint
    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Requests queued or in flight
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// `Healthy` and its task is still alive
    pub fn is_healthy(&self) -> bool {
        if self.state() != ConnectionState::Healthy || self.tx.is_closed() {
            return false;
        }
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Snapshot for status reporting
    pub fn slot(&self) -> ConnectionSlot {
        ConnectionSlot {
            identity: self.identity,
            endpoint: self.settings.endpoint.clone(),
            state: self.state(),
            last_activity_age: Instant::now().saturating_duration_since(self.shared.last_activity()),
            idle_timeout: self.settings.idle_timeout,
            pending: self.pending(),
        }
    }

    /// Ask the task to finish and wait for it, aborting after the stop timeout
    pub async fn stop(&self) {
        self.shared
            .state
            .transition(ConnectionState::Healthy, ConnectionState::Stale);
        self.shared.shutdown.notify_one();

        let handle = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut handle) = handle else {
            return;
        };

        match timeout(self.settings.stop_timeout, &mut handle).await {
            Ok(_) => debug!(identity = self.identity, "Connection stopped"),
            Err(_) => {
                warn!(
                    identity = self.identity,
                    timeout_secs = self.settings.stop_timeout.as_secs(),
                    "Connection did not stop in time, aborting its task"
                );
                handle.abort();
                self.shared.state.set(ConnectionState::Closed);
            }
        }
    }
}

struct Worker {
    identity: i32,
    session: Box<dyn ProviderSession>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<Shared>,
    classifier: Arc<ErrorClassifier>,
    idle_timeout: Duration,
    request_timeout: Duration,
    queue: BinaryHeap<Queued>,
    seq: u64,
}

impl Worker {
    async fn run(mut self) {
        let reason = self.serve().await;

        if self.shared.state.get() != ConnectionState::Closed {
            self.shared.state.set(ConnectionState::Stale);
        }
        self.rx.close();

        let mut abandoned = 0usize;
        while let Some(queued) = self.queue.pop() {
            let _ = queued.envelope.reply.send(Err(RequestError::ConnectionClosed));
            abandoned += 1;
        }
        while let Ok(envelope) = self.rx.try_recv() {
            let _ = envelope.reply.send(Err(RequestError::ConnectionClosed));
            abandoned += 1;
        }
        self.shared.pending.fetch_sub(abandoned, Ordering::AcqRel);

        self.session.disconnect().await;
        self.shared.state.set(ConnectionState::Closed);
        info!(identity = self.identity, reason, abandoned, "Connection closed");
    }

    async fn serve(&mut self) -> &'static str {
        loop {
            if self.shared.state.get() != ConnectionState::Healthy {
                return "stopped";
            }

            while let Ok(envelope) = self.rx.try_recv() {
                self.enqueue(envelope);
            }
            if let Some(next) = self.queue.pop() {
                if let Some(reason) = self.process(next.envelope).await {
                    return reason;
                }
                continue;
            }

            let deadline = self.shared.last_activity() + self.idle_timeout;
            tokio::select! {
                biased;
                _ = self.shared.shutdown.notified() => return "stopped",
                received = self.rx.recv() => match received {
                    Some(envelope) => self.enqueue(envelope),
                    None => return "dropped",
                },
                _ = sleep_until(deadline) => {
                    if self.shared.last_activity() + self.idle_timeout <= Instant::now() {
                        info!(
                            identity = self.identity,
                            idle_secs = self.idle_timeout.as_secs(),
                            "Connection idle, retiring"
                        );
                        self.shared
                            .state
                            .transition(ConnectionState::Healthy, ConnectionState::Stale);
                        return "idle";
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, envelope: Envelope) {
        self.seq += 1;
        self.queue.push(Queued {
            priority: envelope.request.priority,
            seq: self.seq,
            envelope,
        });
    }

    /// Run one request. Returns the exit reason when the session must close.
    ///
    /// The request counts as pending until just before its reply is sent.
    async fn process(&mut self, mut envelope: Envelope) -> Option<&'static str> {
        if envelope.reply.is_closed() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            debug!(identity = self.identity, "Skipping request abandoned by its caller");
            return None;
        }

        let category = envelope.request.category;
        let call_metrics = ProviderCallMetrics::start(category);
        let request_timeout = self.request_timeout;
        let outcome = {
            let session = self.session.as_mut();
            let payload = &envelope.request.payload;
            let reply = &mut envelope.reply;
            tokio::select! {
                result = timeout(request_timeout, execute(session, payload)) => Some(result),
                _ = reply.closed() => None,
            }
        };
        self.shared.touch();

        let (answer, exit) = match outcome {
            None => {
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                call_metrics.finish("abandoned");
                debug!(identity = self.identity, "Caller abandoned an in-flight request");
                return None;
            }
            Some(Err(_)) => {
                call_metrics.finish("timeout");
                (Err(RequestError::Timeout(request_timeout)), None)
            }
            Some(Ok(Ok(response))) => {
                call_metrics.finish("ok");
                (Ok(response), None)
            }
            Some(Ok(Err(error))) => {
                let classification = self.classifier.classify(error.code, &error.message);
                call_metrics.finish(classification.kind.as_str());
                let exit = if classification.kind == ErrorKind::Fatal {
                    Some("fatal")
                } else if error.disconnected {
                    Some("disconnected")
                } else {
                    None
                };
                if let Some(reason) = exit {
                    warn!(
                        identity = self.identity,
                        code = ?error.code,
                        message = %error.message,
                        reason,
                        "Session unusable, marking connection stale"
                    );
                    self.shared
                        .state
                        .transition(ConnectionState::Healthy, ConnectionState::Stale);
                } else {
                    debug!(
                        identity = self.identity,
                        code = ?error.code,
                        kind = classification.kind.as_str(),
                        "Provider rejected request"
                    );
                }
                (
                    Err(RequestError::Provider {
                        error,
                        classification,
                    }),
                    exit,
                )
            }
        };

        self.shared.pending.fetch_sub(1, Ordering::AcqRel);
        let _ = envelope.reply.send(answer);
        exit
    }
}

async fn execute(
    session: &mut dyn ProviderSession,
    payload: &RequestPayload,
) -> Result<Response, ProviderError> {
    match payload {
        RequestPayload::Historical {
            symbol,
            granularity,
            range,
        } => session
            .fetch_historical(symbol, *granularity, *range)
            .await
            .map(Response::Bars),
        RequestPayload::HeadTimestamp { symbol } => session
            .head_timestamp(symbol)
            .await
            .map(Response::HeadTimestamp),
    }
}

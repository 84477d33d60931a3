//! Channel groups: bounded worker pools, one per message kind.
//!
//! A group owns two bounded queues. Classifiers feed `incoming` with
//! non-blocking sends; the group's workers drain it, run their
//! type-specific processing, and forward into `sending`, which the
//! kind's consumer pool consumes. The forward is a blocking send on
//! purpose: when the pool saturates, backpressure propagates to the
//! workers rather than dropping messages.
//!
//! Workers are supervised. A panicking worker is logged and relaunched;
//! the message it held is lost (the relay is at-most-once).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::Classifier;
use crate::message::{DeliveryError, Message};

/// Default capacity of a group's incoming and sending queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Worker-local counters exposed through [`Worker::metrics`].
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Messages the worker has processed.
    pub flow: u64,
    /// How long the worker has existed.
    pub uptime: Duration,
}

/// A cooperating worker on a channel group.
///
/// `handle` runs on the worker's task for every message it dequeues and
/// may keep worker-local state behind atomics.
pub trait Worker: Send + Sync + 'static {
    /// Type-specific processing hook.
    fn handle(&self, message: &Message);

    /// Snapshot of worker-local counters, when the worker keeps any.
    fn metrics(&self) -> Option<WorkerMetrics> {
        None
    }
}

/// Constructor for a group's workers.
pub type WorkerFactory = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

/// Worker with no per-message processing.
pub struct BaseWorker;

impl Worker for BaseWorker {
    fn handle(&self, _message: &Message) {}
}

/// Worker counting its message flow.
pub struct MetricsWorker {
    flow: AtomicU64,
    created_at: Instant,
}

impl MetricsWorker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flow: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }
}

impl Default for MetricsWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker for MetricsWorker {
    fn handle(&self, _message: &Message) {
        self.flow.fetch_add(1, Ordering::Relaxed);
    }

    fn metrics(&self) -> Option<WorkerMetrics> {
        Some(WorkerMetrics {
            flow: self.flow.load(Ordering::Relaxed),
            uptime: self.created_at.elapsed(),
        })
    }
}

/// External observer of a running group, e.g. a metrics poller.
pub trait GroupManager: Send + Sync + 'static {
    /// Start observing. Implementations typically spawn a task that ends
    /// when the group stops.
    fn start_manage(&self, group: Arc<ChannelGroup>);
}

/// Group manager that periodically logs every worker's flow counter.
pub struct FlowLogManager {
    period: Duration,
}

impl FlowLogManager {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl GroupManager for FlowLogManager {
    fn start_manage(&self, group: Arc<ChannelGroup>) {
        let period = self.period;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = group.stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for (index, metrics) in group.metrics().into_iter().enumerate() {
                    if let Some(metrics) = metrics {
                        info!(
                            kind = group.kind(),
                            worker = index,
                            flow = metrics.flow,
                            uptime_secs = metrics.uptime.as_secs(),
                            "channel flow"
                        );
                    }
                }
            }
        });
    }
}

struct WorkerSlot {
    worker: Arc<dyn Worker>,
    running: Arc<AtomicBool>,
}

/// A fixed pool of workers handling one message kind.
pub struct ChannelGroup {
    kind: String,
    incoming_tx: Mutex<Option<flume::Sender<Arc<Message>>>>,
    incoming_rx: flume::Receiver<Arc<Message>>,
    sending_tx: flume::Sender<Arc<Message>>,
    sending_rx: Mutex<Option<flume::Receiver<Arc<Message>>>>,
    workers: Vec<WorkerSlot>,
    manager: Option<Arc<dyn GroupManager>>,
    stop: CancellationToken,
}

impl ChannelGroup {
    /// Create a group with `worker_count` workers built by `factory` and
    /// queues bounded at `queue_capacity` (clamped to at least 1).
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        factory: WorkerFactory,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Arc<Self> {
        Self::with_manager(kind, factory, worker_count, queue_capacity, None)
    }

    /// Like [`ChannelGroup::new`], with an attached group manager.
    #[must_use]
    pub fn with_manager(
        kind: impl Into<String>,
        factory: WorkerFactory,
        worker_count: usize,
        queue_capacity: usize,
        manager: Option<Arc<dyn GroupManager>>,
    ) -> Arc<Self> {
        let capacity = queue_capacity.max(1);
        let (incoming_tx, incoming_rx) = flume::bounded(capacity);
        let (sending_tx, sending_rx) = flume::bounded(capacity);

        let workers = (0..worker_count)
            .map(|_| WorkerSlot {
                worker: factory(),
                running: Arc::new(AtomicBool::new(false)),
            })
            .collect();

        Arc::new(Self {
            kind: kind.into(),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx,
            sending_tx,
            sending_rx: Mutex::new(Some(sending_rx)),
            workers,
            manager,
            stop: CancellationToken::new(),
        })
    }

    /// The message kind this group handles.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Number of workers, running or not.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The attached group manager, if any.
    #[must_use]
    pub fn manager(&self) -> Option<Arc<dyn GroupManager>> {
        self.manager.clone()
    }

    /// Non-blocking enqueue into `incoming`, used by classifiers. Gives
    /// the message back when the queue is full or the group stopped.
    pub(crate) fn try_enqueue(&self, message: Arc<Message>) -> Result<(), Arc<Message>> {
        let slot = self.incoming_tx.lock().unwrap();
        let Some(tx) = slot.as_ref() else {
            return Err(message);
        };
        tx.try_send(message).map_err(flume::TrySendError::into_inner)
    }

    /// Take the consuming half of the `sending` queue. The kind's
    /// consumer pool claims this exactly once at relay start.
    #[must_use]
    pub fn take_sending(&self) -> Option<flume::Receiver<Arc<Message>>> {
        self.sending_rx.lock().unwrap().take()
    }

    /// Start every worker and register the group with every classifier.
    pub fn start_channels(self: Arc<Self>, classifiers: &[Arc<Classifier>]) {
        for slot in &self.workers {
            if slot.running.swap(true, Ordering::SeqCst) {
                debug!(kind = %self.kind, "worker already started");
                continue;
            }
            spawn_worker(
                WorkerContext {
                    kind: self.kind.clone(),
                    incoming: self.incoming_rx.clone(),
                    sending: self.sending_tx.clone(),
                    stop: self.stop.clone(),
                },
                slot.worker.clone(),
                slot.running.clone(),
            );
        }

        for classifier in classifiers {
            classifier.register(self.clone());
        }
    }

    /// Unregister from classifiers, stop every worker, then fail every
    /// message still queued in `incoming` with a shutdown error.
    pub fn stop_channels(&self, classifiers: &[Arc<Classifier>]) {
        for classifier in classifiers {
            classifier.unregister(self);
        }

        for slot in &self.workers {
            slot.running.store(false, Ordering::SeqCst);
        }
        self.stop.cancel();
        drop(self.incoming_tx.lock().unwrap().take());

        while let Ok(message) = self.incoming_rx.try_recv() {
            message.finish(Err(DeliveryError::Shutdown));
        }
    }

    /// Per-worker metric snapshots, in worker order.
    #[must_use]
    pub fn metrics(&self) -> Vec<Option<WorkerMetrics>> {
        self.workers.iter().map(|slot| slot.worker.metrics()).collect()
    }

    /// Number of workers whose loop is currently running.
    #[must_use]
    pub fn running_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.running.load(Ordering::SeqCst))
            .count()
    }
}

/// Everything a worker loop touches, detached from the group so the
/// supervisor can relaunch the loop without keeping the group alive.
#[derive(Clone)]
struct WorkerContext {
    kind: String,
    incoming: flume::Receiver<Arc<Message>>,
    sending: flume::Sender<Arc<Message>>,
    stop: CancellationToken,
}

/// Run a worker loop under a supervisor that relaunches it after a panic.
fn spawn_worker(context: WorkerContext, worker: Arc<dyn Worker>, running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        loop {
            let task = tokio::spawn(worker_loop(
                context.clone(),
                worker.clone(),
                running.clone(),
            ));
            match task.await {
                Err(join_err) if join_err.is_panic() => {
                    warn!(kind = %context.kind, "channel worker fault, restarting");
                    continue;
                }
                _ => break,
            }
        }
        running.store(false, Ordering::SeqCst);
    });
}

async fn worker_loop(context: WorkerContext, worker: Arc<dyn Worker>, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let message = tokio::select! {
            biased;
            _ = context.stop.cancelled() => break,
            received = context.incoming.recv_async() => match received {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        message.on_received();
        worker.handle(&message);

        // Blocking forward: this is the pipeline's backpressure point.
        tokio::select! {
            biased;
            _ = context.stop.cancelled() => {
                message.finish(Err(DeliveryError::Shutdown));
                break;
            }
            sent = context.sending.send_async(message.clone()) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TEXT_MESSAGE;

    fn metrics_group(workers: usize, capacity: usize) -> Arc<ChannelGroup> {
        ChannelGroup::new(
            TEXT_MESSAGE,
            Arc::new(|| Arc::new(MetricsWorker::new()) as _),
            workers,
            capacity,
        )
    }

    #[tokio::test]
    async fn test_workers_forward_to_sending() {
        let group = metrics_group(2, 10);
        let sending = group.take_sending().unwrap();
        group.clone().start_channels(&[]);

        let message = Arc::new(Message::text("hi").with_target("a"));
        group.try_enqueue(message).unwrap();

        let forwarded = sending.recv_async().await.unwrap();
        assert_eq!(forwarded.target(), "a");

        let flow: u64 = group.metrics().iter().flatten().map(|m| m.flow).sum();
        assert_eq!(flow, 1);
    }

    #[tokio::test]
    async fn test_zero_workers_start_and_stop_cleanly() {
        let group = metrics_group(0, 2);
        group.clone().start_channels(&[]);
        assert_eq!(group.running_workers(), 0);

        // Nothing drains incoming, so the queue fills and overflows.
        assert!(group
            .try_enqueue(Arc::new(Message::text("1").with_target("a")))
            .is_ok());
        assert!(group
            .try_enqueue(Arc::new(Message::text("2").with_target("a")))
            .is_ok());
        assert!(group
            .try_enqueue(Arc::new(Message::text("3").with_target("a")))
            .is_err());

        group.stop_channels(&[]);
    }

    #[tokio::test]
    async fn test_stop_drains_incoming_with_shutdown() {
        let group = metrics_group(0, 4);
        group.clone().start_channels(&[]);

        let message = Message::text("queued").with_target("a");
        let waiter = message.waiter();
        group.try_enqueue(Arc::new(message)).unwrap();

        group.stop_channels(&[]);

        assert_eq!(
            waiter.wait(Duration::from_millis(50)).await,
            Err(DeliveryError::Shutdown)
        );
        // A stopped group rejects further enqueues.
        assert!(group
            .try_enqueue(Arc::new(Message::text("late").with_target("a")))
            .is_err());
    }

    #[tokio::test]
    async fn test_worker_restarts_after_panic() {
        struct FaultyWorker {
            seen: AtomicU64,
        }

        impl Worker for FaultyWorker {
            fn handle(&self, _message: &Message) {
                if self.seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("injected worker fault");
                }
            }

            fn metrics(&self) -> Option<WorkerMetrics> {
                Some(WorkerMetrics {
                    flow: self.seen.load(Ordering::SeqCst),
                    uptime: Duration::ZERO,
                })
            }
        }

        let group = ChannelGroup::new(
            TEXT_MESSAGE,
            Arc::new(|| {
                Arc::new(FaultyWorker {
                    seen: AtomicU64::new(0),
                }) as _
            }),
            1,
            10,
        );
        let sending = group.take_sending().unwrap();
        group.clone().start_channels(&[]);

        // First message is lost to the panic, second flows through the
        // relaunched worker.
        group
            .try_enqueue(Arc::new(Message::text("boom").with_target("a")))
            .unwrap();
        group
            .try_enqueue(Arc::new(Message::text("ok").with_target("a")))
            .unwrap();

        let survivor = tokio::time::timeout(Duration::from_secs(2), sending.recv_async())
            .await
            .unwrap()
            .unwrap();
        match survivor.body() {
            crate::message::Body::Text(text) => assert_eq!(text, "ok"),
            other => panic!("unexpected body: {other:?}"),
        }
    }
}

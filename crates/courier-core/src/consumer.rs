//! Consumer pools: per-kind dispatch from a group's sending queue to
//! subscriber receivers.
//!
//! The pool keeps a free list of reusable [`Consumer`] dispatchers and a
//! map of target id → [`ReceiverList`]. Receiver lookup runs under the
//! map's sharded locks and never blocks on consumer recycling, which has
//! its own lock. Fan-out to receiver inboxes is non-blocking: a full
//! inbox drops that copy and fails the message, siblings are unaffected.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::message::{DeliveryError, Message};

/// Default capacity of a receiver's inbox.
pub const DEFAULT_RECEIVER_CAPACITY: usize = 20;

/// Extension seam invoked by the pool on subscription and dispatch events.
pub trait PoolHooks: Send + Sync + 'static {
    /// A receiver registered under an id the pool had not seen before.
    fn on_new_receiver(&self, id: &str) {
        let _ = id;
    }

    /// No receiver list exists for a dispatch target. The default fails
    /// the message so the publisher observes the miss; overrides may
    /// hand the message to offline storage instead.
    fn on_target_miss(&self, message: &Arc<Message>, target: &str) {
        message.finish(Err(DeliveryError::TargetMiss(target.to_owned())));
    }
}

/// The no-op hook set.
pub struct DefaultHooks;

impl PoolHooks for DefaultHooks {}

enum Delivery {
    Delivered,
    Busy,
    Closed,
}

/// A subscriber's inbox handle, pool side.
///
/// The inbox channel is the sole handoff point between dispatch and the
/// subscription broker. `stop` is idempotent: the channel is closed
/// exactly once, guarded by a CAS on the active flag.
pub struct Receiver {
    id: String,
    active: AtomicBool,
    tx: Mutex<Option<flume::Sender<Arc<Message>>>>,
}

impl Receiver {
    fn new(id: impl Into<String>, capacity: usize) -> (Arc<Self>, flume::Receiver<Arc<Message>>) {
        let (tx, rx) = flume::bounded(capacity);
        let receiver = Arc::new(Self {
            id: id.into(),
            active: AtomicBool::new(true),
            tx: Mutex::new(Some(tx)),
        });
        (receiver, rx)
    }

    /// Target id this receiver is registered under.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the receiver still accepts deliveries.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Close the inbox. Idempotent; the consuming side observes end of
    /// stream once buffered messages are drained.
    pub fn stop(&self) {
        if self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            drop(self.tx.lock().unwrap().take());
        }
    }

    fn try_deliver(&self, message: &Arc<Message>) -> Delivery {
        let slot = self.tx.lock().unwrap();
        let Some(tx) = slot.as_ref() else {
            return Delivery::Closed;
        };
        match tx.try_send(message.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(flume::TrySendError::Full(_)) => Delivery::Busy,
            Err(flume::TrySendError::Disconnected(_)) => Delivery::Closed,
        }
    }
}

/// All receivers registered under one target id.
#[derive(Default)]
pub struct ReceiverList {
    members: Mutex<Vec<Arc<Receiver>>>,
}

impl ReceiverList {
    fn new(first: Arc<Receiver>) -> Arc<Self> {
        let list = Arc::new(Self::default());
        list.add(first);
        list
    }

    /// Append a receiver.
    pub fn add(&self, receiver: Arc<Receiver>) {
        self.members.lock().unwrap().push(receiver);
    }

    /// Stop and drop every member.
    pub fn clear(&self) {
        for receiver in self.members.lock().unwrap().drain(..) {
            receiver.stop();
        }
    }

    /// Drop a single member, leaving siblings untouched.
    pub fn remove(&self, receiver: &Arc<Receiver>) {
        self.members
            .lock()
            .unwrap()
            .retain(|member| !Arc::ptr_eq(member, receiver));
    }

    /// Number of members, stopped ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    /// Whether the list has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking send to every member. Holding the list lock across
    /// the sends is fine, they never suspend. Returns how many inboxes
    /// accepted the message.
    fn fan_out(&self, message: &Arc<Message>) -> usize {
        let members = self.members.lock().unwrap();
        let mut delivered = 0;
        for member in members.iter() {
            match member.try_deliver(message) {
                Delivery::Delivered => delivered += 1,
                Delivery::Busy => {
                    warn!(recipient = member.id(), id = message.id(), "message dropped, receiver inbox is busy");
                    message.finish(Err(DeliveryError::ReceiverBusy(member.id().to_owned())));
                }
                Delivery::Closed => {}
            }
        }
        delivered
    }
}

/// The consuming side of a registered receiver, handed to the broker.
pub struct Subscription {
    pub(crate) handle: Arc<Receiver>,
    pub(crate) rx: flume::Receiver<Arc<Message>>,
}

impl Subscription {
    /// Target id the subscription listens on.
    #[must_use]
    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Pool-side handle, used to stop the subscription.
    #[must_use]
    pub fn handle(&self) -> Arc<Receiver> {
        self.handle.clone()
    }

    /// Receive the next message; `None` once the receiver is stopped and
    /// drained.
    pub async fn recv(&self) -> Option<Arc<Message>> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking receive.
    #[must_use]
    pub fn try_recv(&self) -> Option<Arc<Message>> {
        self.rx.try_recv().ok()
    }

    /// Stop the underlying receiver.
    pub fn stop(&self) {
        self.handle.stop();
    }
}

/// A reusable dispatcher. Lazily spawns its task on first use; the task
/// loops on a single-slot work channel, so a consumer never handles two
/// messages concurrently.
pub struct Consumer {
    tx: mpsc::Sender<Arc<Message>>,
    rx: Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    running: AtomicBool,
}

impl Consumer {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            running: AtomicBool::new(false),
        })
    }

    async fn consume(self: Arc<Self>, pool: Arc<PoolInner>, message: Arc<Message>) {
        if !self.running.swap(true, Ordering::SeqCst) {
            let taken = self.rx.lock().unwrap().take();
            if let Some(mut rx) = taken {
                let pool = pool.clone();
                let consumer = self.clone();
                tokio::spawn(async move {
                    while let Some(message) = rx.recv().await {
                        let outcome =
                            catch_unwind(AssertUnwindSafe(|| dispatch(&pool, &message)));
                        if outcome.is_err() {
                            warn!("consumer dispatch fault");
                        }
                        pool.recycle(consumer.clone());
                    }
                });
            }
        }

        let _ = self.tx.send(message).await;
    }
}

/// Resolve the message's targets and fan out to their receiver lists.
fn dispatch(pool: &Arc<PoolInner>, message: &Arc<Message>) {
    let mut delivered = 0;

    for target in message.targets() {
        match pool.receivers.get(target) {
            Some(list) => delivered += list.fan_out(message),
            None => {
                let hooks = pool.hooks.clone();
                let message = message.clone();
                let target = target.to_owned();
                tokio::spawn(async move {
                    debug!(recipient = %target, id = message.id(), "message target miss");
                    hooks.on_target_miss(&message, &target);
                });
            }
        }
    }

    if delivered > 0 {
        // Acknowledge delivery. A busy drop that already claimed the
        // completion wins, this is a no-op then.
        message.finish(Ok(()));
    }
}

struct PoolInner {
    kind: String,
    receiver_capacity: usize,
    stopped: AtomicBool,
    stop: CancellationToken,
    idle: Mutex<Vec<Arc<Consumer>>>,
    receivers: DashMap<String, Arc<ReceiverList>>,
    hooks: Arc<dyn PoolHooks>,
}

impl PoolInner {
    fn get(&self) -> Arc<Consumer> {
        self.idle.lock().unwrap().pop().unwrap_or_else(Consumer::new)
    }

    fn recycle(&self, consumer: Arc<Consumer>) {
        self.idle.lock().unwrap().push(consumer);
    }
}

/// Per-kind dispatcher pool reading a group's sending queue.
#[derive(Clone)]
pub struct ConsumerPool {
    inner: Arc<PoolInner>,
}

impl ConsumerPool {
    /// Create a pool for one message kind.
    #[must_use]
    pub fn new(kind: impl Into<String>, hooks: Arc<dyn PoolHooks>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                kind: kind.into(),
                receiver_capacity: DEFAULT_RECEIVER_CAPACITY,
                stopped: AtomicBool::new(false),
                stop: CancellationToken::new(),
                idle: Mutex::new(Vec::new()),
                receivers: DashMap::new(),
                hooks,
            }),
        }
    }

    /// The message kind this pool dispatches.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Start the supervised reader over the group's sending queue.
    pub fn start(&self, sending: flume::Receiver<Arc<Message>>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let task = tokio::spawn(reader_loop(inner.clone(), sending.clone()));
                match task.await {
                    Err(join_err) if join_err.is_panic() => {
                        warn!(kind = %inner.kind, "consumer pool reader fault, restarting");
                        continue;
                    }
                    _ => break,
                }
            }
        });
    }

    /// Dispatch one message through a pooled consumer.
    pub async fn consume(&self, message: Arc<Message>) {
        let consumer = self.inner.get();
        consumer.consume(self.inner.clone(), message).await;
    }

    /// Register a receiver for `id`.
    ///
    /// With `race` set, any previously registered receivers for the id
    /// are stopped and the new receiver becomes the sole subscriber.
    /// Without it, the receiver joins the existing fan-out set. The
    /// first registration for an id fires `on_new_receiver`
    /// asynchronously.
    pub fn receive_messages(&self, id: &str, race: bool) -> Subscription {
        let (receiver, rx) = Receiver::new(id, self.inner.receiver_capacity);

        match self.inner.receivers.entry(id.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                let list = entry.get().clone();
                drop(entry);
                if race {
                    list.clear();
                }
                list.add(receiver.clone());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(ReceiverList::new(receiver.clone()));
                let hooks = self.inner.hooks.clone();
                let id = id.to_owned();
                tokio::spawn(async move {
                    hooks.on_new_receiver(&id);
                });
            }
        }

        Subscription {
            handle: receiver,
            rx,
        }
    }

    /// Stop a receiver and remove it from its list, leaving siblings
    /// untouched.
    pub fn close_receiver(&self, receiver: &Arc<Receiver>) {
        receiver.stop();
        if let Some(list) = self.inner.receivers.get(receiver.id()) {
            list.remove(receiver);
        }
    }

    /// The receiver list registered for `id`, if any.
    #[must_use]
    pub fn receivers(&self, id: &str) -> Option<Arc<ReceiverList>> {
        self.inner.receivers.get(id).map(|entry| entry.clone())
    }

    /// Stop the reader and close every registered receiver.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.stop.cancel();

        for entry in self.inner.receivers.iter() {
            entry.value().clear();
        }
        self.inner.receivers.clear();
    }
}

async fn reader_loop(inner: Arc<PoolInner>, sending: flume::Receiver<Arc<Message>>) {
    loop {
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }

        let message = tokio::select! {
            biased;
            _ = inner.stop.cancelled() => break,
            received = sending.recv_async() => match received {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        let consumer = inner.get();
        consumer.consume(inner.clone(), message).await;
    }
}

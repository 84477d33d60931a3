//! The relay engine: composes classifiers, channel groups, consumer
//! pools, the user manager, and the file proxies into one instance.
//!
//! A relay is instance-scoped so several independent relays can coexist
//! in one process (and in tests). Publishing assigns a strictly
//! increasing message id and routes through the classifier picked by
//! `id mod classifier_count`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::info;

use crate::broker::Broker;
use crate::classifier::{Classifier, DEFAULT_CLASSIFIER_COUNT};
use crate::consumer::{ConsumerPool, DefaultHooks, PoolHooks, Receiver, Subscription};
use crate::group::{ChannelGroup, GroupManager, WorkerFactory, DEFAULT_QUEUE_CAPACITY};
use crate::message::{DeliveryWaiter, Message, FILE_MESSAGE, PICTURE_MESSAGE, TEXT_MESSAGE};
use crate::parser::{FileParser, PictureParser, TextParser};
use crate::proxy::{FileProxy, DEFAULT_FILE_ROOT};
use crate::user::{User, UserError, UserManager};

/// Default period of the user expiry sweep.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Errors from relay operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    /// No channel is configured for the requested message kind.
    #[error("no message kind {0} registered")]
    UnknownKind(String),
}

/// Fatal configuration errors raised by [`RelayBuilder::build`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The builder holds no channel specs.
    #[error("no channels configured")]
    NoChannels,

    /// No secret key was provided for the user manager.
    #[error("secret key is not set")]
    MissingSecretKey,
}

struct ChannelSpec {
    kind: String,
    factory: WorkerFactory,
    worker_count: usize,
    queue_capacity: usize,
    manager: Option<Arc<dyn GroupManager>>,
}

/// Builder wiring a relay instance before it starts.
pub struct RelayBuilder {
    channels: Vec<ChannelSpec>,
    classifier_count: usize,
    hooks: Arc<dyn PoolHooks>,
    host: String,
    file_root: String,
    secret_key: Option<String>,
    sweep_period: Duration,
}

impl RelayBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            classifier_count: DEFAULT_CLASSIFIER_COUNT,
            hooks: Arc::new(DefaultHooks),
            host: "http://localhost".to_owned(),
            file_root: DEFAULT_FILE_ROOT.to_owned(),
            secret_key: None,
            sweep_period: DEFAULT_SWEEP_PERIOD,
        }
    }

    /// Add a channel group for a message kind.
    #[must_use]
    pub fn channel(
        mut self,
        kind: impl Into<String>,
        factory: WorkerFactory,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Self {
        self.channels.push(ChannelSpec {
            kind: kind.into(),
            factory,
            worker_count,
            queue_capacity,
            manager: None,
        });
        self
    }

    /// Attach a group manager to the most closely matching channel spec.
    #[must_use]
    pub fn group_manager(mut self, kind: &str, manager: Arc<dyn GroupManager>) -> Self {
        if let Some(spec) = self.channels.iter_mut().find(|spec| spec.kind == kind) {
            spec.manager = Some(manager);
        }
        self
    }

    /// Number of classifiers; clamped to at least one.
    #[must_use]
    pub fn classifier_count(mut self, count: usize) -> Self {
        self.classifier_count = count.max(DEFAULT_CLASSIFIER_COUNT);
        self
    }

    /// Pool hook set shared by every consumer pool.
    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn PoolHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Externally visible host used in staged file URLs. An `http://`
    /// scheme is prepended when missing.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// URL root segment of the file proxies.
    #[must_use]
    pub fn file_root(mut self, root: impl Into<String>) -> Self {
        self.file_root = root.into();
        self
    }

    /// Shared secret required to register users.
    #[must_use]
    pub fn secret_key(mut self, secret: impl Into<String>) -> Self {
        self.secret_key = Some(secret.into());
        self
    }

    /// Period of the user expiry sweep.
    #[must_use]
    pub fn expire_sweep_period(mut self, period: Duration) -> Self {
        self.sweep_period = period;
        self
    }

    /// Construct the relay.
    ///
    /// # Errors
    ///
    /// Fails when no channels are configured or the secret key is
    /// missing; both are fatal configuration faults.
    pub fn build(self) -> Result<Relay, BuildError> {
        if self.channels.is_empty() {
            return Err(BuildError::NoChannels);
        }
        let secret = self.secret_key.ok_or(BuildError::MissingSecretKey)?;

        let host = if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host
        } else {
            format!("http://{}", self.host)
        };

        let classifiers: Vec<Arc<Classifier>> = (0..self.classifier_count)
            .map(|_| Arc::new(Classifier::new()))
            .collect();

        let mut groups = HashMap::new();
        let mut pools = HashMap::new();
        for spec in self.channels {
            let capacity = if spec.queue_capacity < 1 {
                info!(
                    kind = %spec.kind,
                    default = DEFAULT_QUEUE_CAPACITY,
                    "queue capacity below minimum, using default"
                );
                DEFAULT_QUEUE_CAPACITY
            } else {
                spec.queue_capacity
            };

            let group = ChannelGroup::with_manager(
                spec.kind.clone(),
                spec.factory,
                spec.worker_count,
                capacity,
                spec.manager,
            );
            pools.insert(
                spec.kind.clone(),
                ConsumerPool::new(spec.kind.clone(), self.hooks.clone()),
            );
            groups.insert(spec.kind, group);
        }

        Ok(Relay {
            next_id: AtomicU64::new(0),
            started: AtomicBool::new(false),
            classifiers,
            groups,
            pools,
            users: Arc::new(UserManager::new(secret)),
            picture_proxy: Arc::new(FileProxy::new(&host, &self.file_root)),
            file_proxy: Arc::new(FileProxy::new(&host, &self.file_root)),
            sweep_period: self.sweep_period,
        })
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An instant-messaging relay instance.
pub struct Relay {
    next_id: AtomicU64,
    started: AtomicBool,
    classifiers: Vec<Arc<Classifier>>,
    groups: HashMap<String, Arc<ChannelGroup>>,
    pools: HashMap<String, ConsumerPool>,
    users: Arc<UserManager>,
    picture_proxy: Arc<FileProxy>,
    file_proxy: Arc<FileProxy>,
    sweep_period: Duration,
}

impl Relay {
    /// Start the pipeline: consumer pools, channel groups, group
    /// managers, and the user expiry sweep. Idempotent.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        for (kind, group) in &self.groups {
            if let Some(sending) = group.take_sending() {
                self.pools[kind].start(sending);
            }
            group.clone().start_channels(&self.classifiers);
            if let Some(manager) = group.manager() {
                manager.start_manage(group.clone());
            }
        }

        self.users.start_expire_check(self.sweep_period);
        info!(
            kinds = self.groups.len(),
            classifiers = self.classifiers.len(),
            "relay started"
        );
    }

    /// Publish a message: assign the next id, pick the classifier by
    /// `id mod classifier_count`, and hand the message over. The
    /// returned waiter resolves with the delivery outcome.
    pub fn send(&self, mut message: Message) -> DeliveryWaiter {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        message.set_id(id);

        let waiter = message.waiter();
        let index = (id % self.classifiers.len() as u64) as usize;
        self.classifiers[index].classify(Arc::new(message));
        waiter
    }

    /// Register a receiver for `id` on the pool handling `kind`.
    ///
    /// # Errors
    ///
    /// Fails when no channel is configured for the kind.
    pub fn receive_messages(
        &self,
        id: &str,
        kind: &str,
        race: bool,
    ) -> Result<Subscription, RelayError> {
        let pool = self
            .pools
            .get(kind)
            .ok_or_else(|| RelayError::UnknownKind(kind.to_owned()))?;
        Ok(pool.receive_messages(id, race))
    }

    /// Stop a receiver and drop it from its pool's list.
    pub fn close_receiver(&self, kind: &str, receiver: &Arc<Receiver>) {
        if let Some(pool) = self.pools.get(kind) {
            pool.close_receiver(receiver);
        }
    }

    /// A broker pre-wired with the standard text, picture, and file
    /// parsers against this relay's proxies.
    #[must_use]
    pub fn broker(&self) -> Broker {
        let mut broker = Broker::new();
        broker.add_parser(TEXT_MESSAGE, Arc::new(TextParser));
        broker.add_parser(
            PICTURE_MESSAGE,
            Arc::new(PictureParser::new(self.picture_proxy.clone())),
        );
        broker.add_parser(
            FILE_MESSAGE,
            Arc::new(FileParser::new(self.file_proxy.clone())),
        );
        broker
    }

    /// Validate a check-code against the user manager.
    ///
    /// # Errors
    ///
    /// Fails for unknown codes and disabled users.
    pub fn validate(&self, check_code: &str) -> Result<Arc<User>, UserError> {
        self.users.validate(check_code)
    }

    /// The relay's user manager.
    #[must_use]
    pub fn users(&self) -> &Arc<UserManager> {
        &self.users
    }

    /// Fetch-and-consume a staged file from either proxy.
    #[must_use]
    pub fn fetch_file(&self, hash: &str) -> Option<Bytes> {
        self.picture_proxy
            .fetch(hash)
            .or_else(|| self.file_proxy.fetch(hash))
    }

    /// The channel group for a kind, when configured.
    #[must_use]
    pub fn group(&self, kind: &str) -> Option<Arc<ChannelGroup>> {
        self.groups.get(kind).cloned()
    }

    /// Stop the pipeline: groups first, then pools (closing every
    /// receiver), then the expiry sweep.
    pub fn stop(&self) {
        for group in self.groups.values() {
            group.stop_channels(&self.classifiers);
        }
        for pool in self.pools.values() {
            pool.stop();
        }
        self.users.stop();
        info!("relay stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{BaseWorker, MetricsWorker};
    use crate::message::DeliveryError;
    use std::sync::atomic::AtomicUsize;

    fn base_factory() -> WorkerFactory {
        Arc::new(|| Arc::new(BaseWorker) as _)
    }

    fn started_relay() -> Relay {
        let relay = RelayBuilder::new()
            .channel(TEXT_MESSAGE, base_factory(), 1, 10)
            .channel(FILE_MESSAGE, base_factory(), 1, 10)
            .secret_key("s")
            .build()
            .unwrap();
        relay.start();
        relay
    }

    #[test]
    fn test_build_requires_channels_and_secret() {
        assert_eq!(
            RelayBuilder::new().secret_key("s").build().err(),
            Some(BuildError::NoChannels)
        );
        assert_eq!(
            RelayBuilder::new()
                .channel(TEXT_MESSAGE, base_factory(), 1, 10)
                .build()
                .err(),
            Some(BuildError::MissingSecretKey)
        );
    }

    #[tokio::test]
    async fn test_ids_are_strictly_increasing() {
        let relay = started_relay();
        let _sink = relay.receive_messages("a", TEXT_MESSAGE, false).unwrap();

        let mut last = 0;
        for _ in 0..50 {
            let message = Message::text("x").with_sender("a").with_target("a");
            relay.send(message);
            let id = relay.next_id.load(Ordering::Relaxed);
            assert!(id > last);
            last = id;
        }

        relay.stop();
    }

    #[tokio::test]
    async fn test_end_to_end_delivery() {
        let relay = started_relay();
        let subscription = relay.receive_messages("alice", TEXT_MESSAGE, false).unwrap();

        let waiter = relay.send(
            Message::text("hi")
                .with_sender("alice")
                .with_target("alice"),
        );
        assert_eq!(waiter.wait(Duration::from_secs(1)).await, Ok(()));

        let delivered = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(delivered.id() > 0);
        assert_eq!(delivered.sender(), "alice");

        relay.stop();
    }

    #[tokio::test]
    async fn test_group_message_fans_out_with_miss_callback() {
        struct CountingHooks {
            misses: AtomicUsize,
        }

        impl PoolHooks for CountingHooks {
            fn on_target_miss(&self, message: &Arc<Message>, target: &str) {
                self.misses.fetch_add(1, Ordering::SeqCst);
                message.finish(Err(DeliveryError::TargetMiss(target.to_owned())));
            }
        }

        let hooks = Arc::new(CountingHooks {
            misses: AtomicUsize::new(0),
        });
        let relay = RelayBuilder::new()
            .channel(TEXT_MESSAGE, base_factory(), 1, 10)
            .hooks(hooks.clone())
            .secret_key("s")
            .build()
            .unwrap();
        relay.start();

        let b = relay.receive_messages("b", TEXT_MESSAGE, false).unwrap();
        let c = relay.receive_messages("c", TEXT_MESSAGE, false).unwrap();

        relay.send(
            Message::text("all")
                .with_sender("a")
                .with_target("b;c;d")
                .with_group("team"),
        );

        for subscription in [&b, &c] {
            let delivered = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivered.group_name(), Some("team"));
            assert!(subscription.try_recv().is_none());
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hooks.misses.load(Ordering::SeqCst), 1);

        relay.stop();
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_fast() {
        let relay = started_relay();

        assert_eq!(
            relay.receive_messages("a", "Nope", false).err(),
            Some(RelayError::UnknownKind("Nope".into()))
        );

        let waiter = relay.send(Message::picture(vec![1u8], "png").with_target("a"));
        assert_eq!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(DeliveryError::UnknownKind(PICTURE_MESSAGE.into()))
        );

        relay.stop();
    }

    #[tokio::test]
    async fn test_stop_cascades_to_receivers() {
        let relay = started_relay();
        let subscription = relay.receive_messages("a", TEXT_MESSAGE, false).unwrap();

        relay.stop();
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_metrics_flow_through_groups() {
        let relay = RelayBuilder::new()
            .channel(
                TEXT_MESSAGE,
                Arc::new(|| Arc::new(MetricsWorker::new()) as _),
                2,
                10,
            )
            .secret_key("s")
            .build()
            .unwrap();
        relay.start();

        let subscription = relay.receive_messages("a", TEXT_MESSAGE, false).unwrap();
        for _ in 0..5 {
            relay.send(Message::text("x").with_sender("a").with_target("a"));
        }
        for _ in 0..5 {
            assert!(tokio::time::timeout(Duration::from_secs(1), subscription.recv())
                .await
                .unwrap()
                .is_some());
        }

        let flow: u64 = relay
            .group(TEXT_MESSAGE)
            .unwrap()
            .metrics()
            .iter()
            .flatten()
            .map(|m| m.flow)
            .sum();
        assert_eq!(flow, 5);

        relay.stop();
    }
}

//! Subscription broker: multiplexes a subscriber's typed receivers into
//! one outbound stream of framed bytes.
//!
//! One broker serves one client connection. It registers a receiver per
//! configured parser kind, then folds each inbound message through the
//! filter chain, parses survivors into frames, and pushes the encoded
//! bytes into the connection's outbound channel. The session ends when
//! any receiver closes or the transport side drops the outbound
//! channel; either way every receiver is stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future;
use futures_util::stream::{self, SelectAll, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_protocol::{codec, Frame};

use crate::consumer::{Receiver, Subscription};
use crate::message::Message;
use crate::relay::Relay;

/// Transforms a batch of messages, dropping or rewriting entries.
/// Surviving messages keep their order.
pub trait MessageFilter: Send + Sync + 'static {
    fn filter(&self, messages: Vec<Arc<Message>>) -> Vec<Arc<Message>>;
}

/// Turns messages of one kind into wire frames.
pub trait MessageParser: Send + Sync + 'static {
    fn parse(&self, messages: &[Arc<Message>]) -> Vec<Frame>;
}

/// Broker setup errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Not a single receiver could be registered for the subscriber.
    #[error("no usable receiver for subscriber {0}")]
    NoReceiver(String),
}

/// Per-connection subscription configuration.
pub struct Broker {
    parsers: HashMap<String, Arc<dyn MessageParser>>,
    filters: Arc<Mutex<Vec<Arc<dyn MessageFilter>>>>,
    race: bool,
}

impl Broker {
    /// Create a broker with no parsers or filters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
            filters: Arc::new(Mutex::new(Vec::new())),
            race: false,
        }
    }

    /// Register a parser for a message kind. The broker subscribes to
    /// exactly the kinds it has parsers for.
    pub fn add_parser(&mut self, kind: impl Into<String>, parser: Arc<dyn MessageParser>) {
        self.parsers.insert(kind.into(), parser);
    }

    /// Opt into takeover subscription: registering evicts any previous
    /// receivers for the subscriber id.
    pub fn set_race(&mut self, race: bool) {
        self.race = race;
    }

    /// Append a filter. Filters run in registration order.
    pub fn add_filter(&self, filter: Arc<dyn MessageFilter>) {
        self.filters.lock().unwrap().push(filter);
    }

    /// Drop all filters.
    pub fn clear_filters(&self) {
        self.filters.lock().unwrap().clear();
    }

    /// Register a receiver per parser kind and return the streaming
    /// session.
    ///
    /// # Errors
    ///
    /// Fails when no receiver at all could be registered; the caller
    /// maps this to a server error before streaming begins.
    pub fn attach(&self, subscriber: &str, relay: &Relay) -> Result<BrokerSession, BrokerError> {
        let mut subscriptions = Vec::with_capacity(self.parsers.len());

        for kind in self.parsers.keys() {
            match relay.receive_messages(subscriber, kind, self.race) {
                Ok(subscription) => subscriptions.push(subscription),
                Err(err) => {
                    warn!(kind = %kind, subscriber, error = %err, "failed to init receiver");
                }
            }
        }

        if subscriptions.is_empty() {
            return Err(BrokerError::NoReceiver(subscriber.to_owned()));
        }

        Ok(BrokerSession {
            subscriber: subscriber.to_owned(),
            subscriptions,
            parsers: self.parsers.clone(),
            filters: self.filters.clone(),
        })
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

enum Inbound {
    Message(Arc<Message>),
    Closed,
}

/// A running subscription: the registered receivers plus the parser and
/// filter configuration captured at attach time.
pub struct BrokerSession {
    subscriber: String,
    subscriptions: Vec<Subscription>,
    parsers: HashMap<String, Arc<dyn MessageParser>>,
    filters: Arc<Mutex<Vec<Arc<dyn MessageFilter>>>>,
}

impl BrokerSession {
    /// Subscriber id the session serves.
    #[must_use]
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// Run the multiplex loop, writing encoded frames into `out` until
    /// a receiver closes or the outbound channel is dropped.
    pub async fn serve(self, out: mpsc::Sender<Bytes>) {
        let handles: Vec<Arc<Receiver>> = self
            .subscriptions
            .iter()
            .map(Subscription::handle)
            .collect();

        // Each receiver stream is terminated with a close marker so a
        // single closing receiver ends the whole session.
        let mut inbound = SelectAll::new();
        for subscription in self.subscriptions {
            inbound.push(
                subscription
                    .rx
                    .into_stream()
                    .map(Inbound::Message)
                    .chain(stream::once(future::ready(Inbound::Closed)))
                    .boxed(),
            );
        }

        loop {
            let next = tokio::select! {
                _ = out.closed() => None,
                next = inbound.next() => next,
            };

            let Some(Inbound::Message(message)) = next else {
                break;
            };

            let mut batch = vec![message];
            {
                let filters = self.filters.lock().unwrap();
                for filter in filters.iter() {
                    batch = filter.filter(batch);
                    if batch.is_empty() {
                        break;
                    }
                }
            }
            let Some(first) = batch.first() else {
                continue;
            };

            let Some(parser) = self.parsers.get(first.kind()) else {
                continue;
            };

            let mut disconnected = false;
            for frame in parser.parse(&batch) {
                if out.send(codec::encode(&frame)).await.is_err() {
                    disconnected = true;
                    break;
                }
            }
            if disconnected {
                break;
            }
        }

        for handle in handles {
            handle.stop();
        }
        debug!(subscriber = %self.subscriber, "subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{ConsumerPool, DefaultHooks};
    use crate::group::BaseWorker;
    use crate::message::TEXT_MESSAGE;
    use crate::parser::TextParser;
    use crate::relay::RelayBuilder;
    use crate::user::{ReceiveMode, UserFilter};
    use std::time::Duration;

    fn relay() -> Relay {
        RelayBuilder::new()
            .channel(
                TEXT_MESSAGE,
                Arc::new(|| Arc::new(BaseWorker) as _),
                1,
                10,
            )
            .secret_key("s")
            .build()
            .unwrap()
    }

    fn text_broker() -> Broker {
        let mut broker = Broker::new();
        broker.add_parser(TEXT_MESSAGE, Arc::new(TextParser));
        broker
    }

    #[tokio::test]
    async fn test_attach_without_kind_fails() {
        let relay = relay();
        let mut broker = Broker::new();
        broker.add_parser("NoSuchKind", Arc::new(TextParser));

        assert!(matches!(
            broker.attach("alice", &relay),
            Err(BrokerError::NoReceiver(_))
        ));
    }

    #[tokio::test]
    async fn test_serve_encodes_delivered_messages() {
        let relay = relay();
        relay.start();

        let broker = text_broker();
        let session = broker.attach("alice", &relay).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(session.serve(tx));

        let waiter = relay.send(
            Message::text("hi")
                .with_sender("alice")
                .with_target("alice"),
        );
        assert_eq!(waiter.wait(Duration::from_secs(1)).await, Ok(()));

        let bytes = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame = codec::decode(&bytes).unwrap();
        assert_eq!(frame.kind, TEXT_MESSAGE);
        assert_eq!(frame.content, "hi");
        assert_eq!(
            frame.meta.get(courier_protocol::meta::SENDER).map(String::as_str),
            Some("alice")
        );

        relay.stop();
    }

    #[tokio::test]
    async fn test_filters_run_in_order_and_drop() {
        let relay = relay();
        relay.start();

        let broker = text_broker();
        let filter = Arc::new(UserFilter::new(ReceiveMode::DefaultReject));
        filter.seed("RL:carol");
        broker.add_filter(filter);

        let session = broker.attach("alice", &relay).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(session.serve(tx));

        relay.send(Message::text("no").with_sender("dave").with_target("alice"));
        relay.send(Message::text("yes").with_sender("carol").with_target("alice"));

        let bytes = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame = codec::decode(&bytes).unwrap();
        assert_eq!(frame.content, "yes");
        assert!(rx.try_recv().is_err());

        relay.stop();
    }

    #[tokio::test]
    async fn test_file_message_is_staged_and_consumed_once() {
        let relay = RelayBuilder::new()
            .channel(
                crate::message::FILE_MESSAGE,
                Arc::new(|| Arc::new(BaseWorker) as _),
                1,
                10,
            )
            .host("127.0.0.1:8324")
            .secret_key("s")
            .build()
            .unwrap();
        relay.start();

        let broker = relay.broker();
        let session = broker.attach("alice", &relay).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(session.serve(tx));

        let waiter = relay.send(
            Message::file(Bytes::from_static(b"twelve bytes"), "report.pdf")
                .with_sender("bob")
                .with_target("alice"),
        );
        assert_eq!(waiter.wait(Duration::from_secs(1)).await, Ok(()));

        let bytes = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame = codec::decode(&bytes).unwrap();
        assert_eq!(frame.kind, crate::message::FILE_MESSAGE);
        assert!(frame.content.starts_with("http://127.0.0.1:8324/IM_TEMP_FILE/"));
        assert!(frame.content.ends_with("/report.pdf"));

        let hash = frame.content.split('/').rev().nth(1).unwrap();
        assert_eq!(
            relay.fetch_file(hash),
            Some(Bytes::from_static(b"twelve bytes"))
        );
        assert_eq!(relay.fetch_file(hash), None);

        relay.stop();
    }

    #[tokio::test]
    async fn test_closed_receiver_ends_session() {
        let pool = ConsumerPool::new(TEXT_MESSAGE, Arc::new(DefaultHooks));
        let subscription = pool.receive_messages("alice", false);
        let session = BrokerSession {
            subscriber: "alice".to_owned(),
            subscriptions: vec![subscription],
            parsers: HashMap::new(),
            filters: Arc::new(Mutex::new(Vec::new())),
        };

        let (tx, _rx) = mpsc::channel(1);
        let serving = tokio::spawn(session.serve(tx));

        // Racing takeover closes the first receiver; the session ends.
        let _takeover = pool.receive_messages("alice", true);
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_transport_drop_stops_receivers() {
        let relay = relay();
        relay.start();

        let broker = text_broker();
        let session = broker.attach("alice", &relay).unwrap();
        let handle = session.subscriptions[0].handle();

        let (tx, rx) = mpsc::channel(1);
        let serving = tokio::spawn(session.serve(tx));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(!handle.is_active());

        relay.stop();
    }
}

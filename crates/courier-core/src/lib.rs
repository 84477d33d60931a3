//! # courier-core
//!
//! The routing core of the courier instant-messaging relay.
//!
//! Messages flow through a staged, bounded pipeline:
//!
//! ```text
//! ┌───────────┐    ┌────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ Publisher │───▶│ Classifier │───▶│ ChannelGroup │───▶│ ConsumerPool │
//! └───────────┘    └────────────┘    │   workers    │    │   dispatch   │
//!                                    └──────────────┘    └──────┬───────┘
//!                                                               ▼
//!                   ┌────────┐       ┌─────────────┐     ┌───────────┐
//!                   │ client │◀──────│   Broker    │◀────│ Receivers │
//!                   └────────┘       │ mux+filters │     └───────────┘
//!                                    └─────────────┘
//! ```
//!
//! - Classifiers enqueue without blocking and drop on full queues.
//! - Group workers forward with backpressure toward the consumer pools.
//! - Dispatch fans out to subscriber inboxes without blocking.
//! - The broker multiplexes a subscriber's typed receivers into one
//!   stream of encoded frames, applying per-user filters.
//!
//! The crate also carries the relay's lifecycle services: the user
//! manager (check-code credentials with scheduled expiry) and the file
//! proxy (single-consumption staging of binary payloads behind URLs).

pub mod broker;
pub mod classifier;
pub mod consumer;
pub mod group;
pub mod message;
pub mod parser;
pub mod proxy;
pub mod relay;
pub mod user;

pub use broker::{Broker, BrokerError, BrokerSession, MessageFilter, MessageParser};
pub use classifier::Classifier;
pub use consumer::{ConsumerPool, DefaultHooks, PoolHooks, Receiver, ReceiverList, Subscription};
pub use group::{
    BaseWorker, ChannelGroup, FlowLogManager, GroupManager, MetricsWorker, Worker, WorkerFactory,
    WorkerMetrics,
};
pub use message::{
    Body, DeliveryError, DeliveryWaiter, Message, FILE_MESSAGE, PICTURE_MESSAGE, TEXT_MESSAGE,
};
pub use parser::{FileParser, PictureParser, TextParser};
pub use proxy::{FileProxy, DEFAULT_FILE_ROOT};
pub use relay::{BuildError, Relay, RelayBuilder, RelayError};
pub use user::{ListKind, ReceiveMode, User, UserError, UserFilter, UserManager};

//! Message classifier: routes published messages to the channel group
//! registered for their kind.
//!
//! The classifier must never become the bottleneck that stalls
//! publishers, so it only ever performs a non-blocking enqueue. A full
//! group queue fails the message with a busy error that the publisher
//! observes through its wait handle.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::group::ChannelGroup;
use crate::message::{DeliveryError, Message};

/// Minimum number of classifiers a relay runs.
pub const DEFAULT_CLASSIFIER_COUNT: usize = 1;

/// A set of kind → group registrations.
#[derive(Default)]
pub struct Classifier {
    groups: RwLock<HashMap<String, Arc<ChannelGroup>>>,
}

impl Classifier {
    /// Create an empty classifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group under its kind. Idempotent.
    pub fn register(&self, group: Arc<ChannelGroup>) {
        self.groups
            .write()
            .unwrap()
            .insert(group.kind().to_owned(), group);
    }

    /// Remove the registration for the group's kind. Idempotent.
    pub fn unregister(&self, group: &ChannelGroup) {
        self.groups.write().unwrap().remove(group.kind());
    }

    /// Route a message to its group's incoming queue.
    ///
    /// Unknown kinds and full queues terminate the message immediately;
    /// the classifier never blocks.
    pub fn classify(&self, message: Arc<Message>) {
        let groups = self.groups.read().unwrap();

        let Some(group) = groups.get(message.kind()) else {
            let kind = message.kind().to_owned();
            message.finish(Err(DeliveryError::UnknownKind(kind)));
            return;
        };

        if let Err(message) = group.try_enqueue(message) {
            warn!(kind = message.kind(), id = message.id(), "message discarded, channel group is busy");
            let kind = message.kind().to_owned();
            message.finish(Err(DeliveryError::GroupBusy(kind)));
        }
    }

    /// Number of registered groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.read().unwrap().len()
    }

    /// Whether no group is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{BaseWorker, ChannelGroup};
    use crate::message::TEXT_MESSAGE;
    use std::time::Duration;

    fn text_group(workers: usize, capacity: usize) -> Arc<ChannelGroup> {
        ChannelGroup::new(
            TEXT_MESSAGE,
            Arc::new(|| Arc::new(BaseWorker) as _),
            workers,
            capacity,
        )
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let classifier = Classifier::new();
        let message = Message::text("hi").with_target("a");
        let waiter = message.waiter();

        classifier.classify(Arc::new(message));

        assert_eq!(
            waiter.wait(Duration::from_millis(50)).await,
            Err(DeliveryError::UnknownKind(TEXT_MESSAGE.into()))
        );
    }

    #[tokio::test]
    async fn test_full_queue_drops_with_busy() {
        let classifier = Classifier::new();
        // No workers, so nothing drains the queue.
        let group = text_group(0, 2);
        classifier.register(group);

        for _ in 0..2 {
            let message = Message::text("hi").with_target("a");
            classifier.classify(Arc::new(message));
        }

        let overflow = Message::text("hi").with_target("a");
        let waiter = overflow.waiter();
        classifier.classify(Arc::new(overflow));

        assert_eq!(
            waiter.wait(Duration::from_millis(50)).await,
            Err(DeliveryError::GroupBusy(TEXT_MESSAGE.into()))
        );
    }

    #[test]
    fn test_register_unregister_idempotent() {
        let classifier = Classifier::new();
        let group = text_group(0, 1);

        classifier.register(group.clone());
        classifier.register(group.clone());
        assert_eq!(classifier.len(), 1);

        classifier.unregister(&group);
        classifier.unregister(&group);
        assert!(classifier.is_empty());
    }
}

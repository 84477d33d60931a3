//! Message model and completion semantics.
//!
//! A [`Message`] is the unit of work flowing through the pipeline. It is
//! created by a publisher, gets its id assigned by the relay, traverses
//! classifier → channel group → consumer pool, and terminates when some
//! stage acknowledges it: delivery, drop, reject, or shutdown. The
//! acknowledgement travels through a single-shot completion slot, so a
//! publisher that never awaits it cannot block the pipeline.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Type tag of plain text messages.
pub const TEXT_MESSAGE: &str = "TextMessage";
/// Type tag of picture messages.
pub const PICTURE_MESSAGE: &str = "PictureMessage";
/// Type tag of file messages.
pub const FILE_MESSAGE: &str = "FileMessage";

/// Terminal outcomes a publisher can observe through [`DeliveryWaiter::wait`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// No channel group is registered for the message kind.
    #[error("no channel group registered for message kind {0}")]
    UnknownKind(String),

    /// The group's incoming queue was full; the message was dropped.
    #[error("channel group {0} is busy, message dropped")]
    GroupBusy(String),

    /// A receiver's inbox was full; that delivery was dropped.
    #[error("receiver queue for {0} is busy, message dropped")]
    ReceiverBusy(String),

    /// No receiver is registered for a dispatch target.
    #[error("no receiver registered for target {0}")]
    TargetMiss(String),

    /// The message was still queued when its stage stopped.
    #[error("channel group stopped while the message was queued")]
    Shutdown,

    /// The bounded wait elapsed before any acknowledgement.
    #[error("timed out waiting for delivery")]
    Timeout,
}

/// Typed payload of a message.
#[derive(Debug, Clone)]
pub enum Body {
    /// Plain text content.
    Text(String),
    /// Image bytes plus the file suffix used when staging them.
    Picture {
        data: Bytes,
        suffix: String,
    },
    /// Arbitrary bytes plus the original file name.
    File {
        data: Bytes,
        filename: String,
    },
}

impl Body {
    /// The type tag used for classification and parser lookup.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Text(_) => TEXT_MESSAGE,
            Body::Picture { .. } => PICTURE_MESSAGE,
            Body::File { .. } => FILE_MESSAGE,
        }
    }
}

type CompletionResult = Result<(), DeliveryError>;

/// Single-shot acknowledgement slot shared by every stage touching the
/// message. The first `finish` wins; everything after is a no-op.
#[derive(Debug)]
struct Completion {
    tx: Mutex<Option<oneshot::Sender<CompletionResult>>>,
    rx: Mutex<Option<oneshot::Receiver<CompletionResult>>>,
}

impl Completion {
    fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }
}

/// A unit of work addressed to one or more recipients.
#[derive(Debug)]
pub struct Message {
    id: u64,
    sender: String,
    target: String,
    is_group: bool,
    group_name: Option<String>,
    body: Body,
    completion: Completion,
}

impl Message {
    /// Create a text message.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self::from_body(Body::Text(content.into()))
    }

    /// Create a picture message.
    #[must_use]
    pub fn picture(data: impl Into<Bytes>, suffix: impl Into<String>) -> Self {
        Self::from_body(Body::Picture {
            data: data.into(),
            suffix: suffix.into(),
        })
    }

    /// Create a file message.
    #[must_use]
    pub fn file(data: impl Into<Bytes>, filename: impl Into<String>) -> Self {
        Self::from_body(Body::File {
            data: data.into(),
            filename: filename.into(),
        })
    }

    /// Create a message from an already-built body.
    #[must_use]
    pub fn from_body(body: Body) -> Self {
        Self {
            id: 0,
            sender: String::new(),
            target: String::new(),
            is_group: false,
            group_name: None,
            body,
            completion: Completion::new(),
        }
    }

    /// Set the publishing user id.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Set the target spec: a single id, or a `;`-separated list for
    /// group messages.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Mark the message as a group message carrying the given group name.
    #[must_use]
    pub fn with_group(mut self, name: impl Into<String>) -> Self {
        self.is_group = true;
        self.group_name = Some(name.into());
        self
    }

    /// Message id; zero until the relay assigns one at publish time.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    /// The type tag used for classification and parser lookup.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Publishing user id.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Raw target spec.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the target spec is a `;`-separated recipient list.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.is_group
    }

    /// Group name, when set on a group message.
    #[must_use]
    pub fn group_name(&self) -> Option<&str> {
        self.group_name.as_deref()
    }

    /// Typed payload.
    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Resolved recipient ids: the split target list for group messages,
    /// the single target otherwise.
    #[must_use]
    pub fn targets(&self) -> Vec<&str> {
        if self.is_group {
            self.target.split(';').filter(|id| !id.is_empty()).collect()
        } else {
            vec![self.target.as_str()]
        }
    }

    /// Receipt hook invoked by the channel worker that picks the message
    /// up from the group queue.
    pub fn on_received(&self) {
        debug!(id = self.id, kind = self.kind(), to = %self.target, "message received");
    }

    /// Acknowledge the message. Returns `true` if this call claimed the
    /// completion slot; later calls are no-ops and return `false`.
    pub fn finish(&self, result: CompletionResult) -> bool {
        let Some(tx) = self.completion.tx.lock().unwrap().take() else {
            return false;
        };
        // The publisher may have dropped its waiter already.
        let _ = tx.send(result);
        true
    }

    /// Take the publisher-side wait handle. Only the first call yields a
    /// live handle; the relay does this inside `send`.
    #[must_use]
    pub fn waiter(&self) -> DeliveryWaiter {
        DeliveryWaiter {
            rx: self.completion.rx.lock().unwrap().take(),
        }
    }
}

/// Publisher-side handle to await a message's acknowledgement.
#[derive(Debug)]
pub struct DeliveryWaiter {
    rx: Option<oneshot::Receiver<CompletionResult>>,
}

impl DeliveryWaiter {
    /// Wait up to `timeout` for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the pipeline's error when the message failed, or
    /// [`DeliveryError::Timeout`] when the wait elapsed. A message lost
    /// without any acknowledgement (worker fault) reads as a timeout too.
    pub async fn wait(mut self, timeout: Duration) -> CompletionResult {
        let Some(rx) = self.rx.take() else {
            return Err(DeliveryError::Timeout);
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(DeliveryError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kinds() {
        assert_eq!(Message::text("hi").kind(), TEXT_MESSAGE);
        assert_eq!(Message::picture(vec![1u8], "png").kind(), PICTURE_MESSAGE);
        assert_eq!(Message::file(vec![1u8], "a.pdf").kind(), FILE_MESSAGE);
    }

    #[test]
    fn test_targets_single_and_group() {
        let single = Message::text("hi").with_target("alice");
        assert_eq!(single.targets(), vec!["alice"]);

        let group = Message::text("hi")
            .with_target("b;c;d")
            .with_group("team");
        assert_eq!(group.targets(), vec!["b", "c", "d"]);
        assert_eq!(group.group_name(), Some("team"));
    }

    #[test]
    fn test_finish_claims_slot_once() {
        let message = Message::text("hi");
        assert!(message.finish(Ok(())));
        assert!(!message.finish(Err(DeliveryError::Shutdown)));
    }

    #[tokio::test]
    async fn test_wait_returns_finish_result() {
        let message = Message::text("hi");
        let waiter = message.waiter();

        message.finish(Err(DeliveryError::GroupBusy(TEXT_MESSAGE.into())));

        assert_eq!(
            waiter.wait(Duration::from_millis(100)).await,
            Err(DeliveryError::GroupBusy(TEXT_MESSAGE.into()))
        );
    }

    #[tokio::test]
    async fn test_wait_times_out_without_finish() {
        let message = Message::text("hi");
        let waiter = message.waiter();

        assert_eq!(
            waiter.wait(Duration::from_millis(10)).await,
            Err(DeliveryError::Timeout)
        );
        // Late finish still succeeds; nobody is listening.
        assert!(message.finish(Ok(())));
    }

    #[tokio::test]
    async fn test_second_waiter_is_dead() {
        let message = Message::text("hi");
        let _first = message.waiter();
        let second = message.waiter();

        assert_eq!(
            second.wait(Duration::from_millis(10)).await,
            Err(DeliveryError::Timeout)
        );
    }
}

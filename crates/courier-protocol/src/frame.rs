//! Frame types for the courier wire protocol.
//!
//! A frame is the unit handed to a subscriber's event stream. Frames are
//! produced by the broker's parsers and serialized by [`crate::codec`].

use std::collections::BTreeMap;

/// Well-known meta keys.
pub mod meta {
    /// Id of the user that published the message.
    pub const SENDER: &str = "Sender";
    /// Group name, present only on group messages.
    pub const GROUP: &str = "Group";
}

/// A wire envelope: message kind, meta map, textual content.
///
/// Meta keys are kept ordered so a frame serializes deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message kind tag (e.g. `TextMessage`).
    pub kind: String,
    /// Key/value annotations copied from the message header.
    pub meta: BTreeMap<String, String>,
    /// Content: the text body, or a fetch URL for staged binary payloads.
    pub content: String,
}

impl Frame {
    /// Create a frame with no meta entries.
    #[must_use]
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            meta: BTreeMap::new(),
            content: content.into(),
        }
    }

    /// Add a meta entry, replacing any previous value for the key.
    pub fn add_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`Frame::add_meta`].
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_meta(key, value);
        self
    }
}

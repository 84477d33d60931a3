//! # courier-protocol
//!
//! Wire envelope definitions for the courier relay.
//!
//! The relay delivers messages to subscribers as a stream of [`Frame`]s.
//! A frame carries the message kind, a small string/string meta map, and
//! the textual content (for binary payloads the content is a fetch URL
//! produced by the file proxy).
//!
//! ## Wire form
//!
//! ```text
//! kind ESC (key ':' value ESC)* SENTINEL ESC content
//! ```
//!
//! where `ESC` is the single byte `0x1b` and `SENTINEL` is a fixed
//! literal separating the meta section from the content. SSE forbids
//! raw newlines inside an event payload, hence the escape-byte framing.
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Frame, meta};
//!
//! let mut frame = Frame::new("TextMessage", "hi");
//! frame.add_meta(meta::SENDER, "alice");
//!
//! let encoded = codec::encode(&frame);
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frame;

pub use codec::{decode, encode, ProtocolError};
pub use frame::{meta, Frame};

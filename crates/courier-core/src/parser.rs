//! Standard parsers turning delivered messages into wire frames.
//!
//! The text parser emits the content verbatim. The binary parsers stage
//! their payload in a file proxy and emit the resulting fetch URL as the
//! frame content. Every parser copies the sender id, and the group name
//! when set, into the frame meta.

use std::sync::Arc;

use courier_protocol::{meta, Frame};

use crate::broker::MessageParser;
use crate::message::{Body, Message, FILE_MESSAGE, PICTURE_MESSAGE, TEXT_MESSAGE};
use crate::proxy::FileProxy;

fn annotate(mut frame: Frame, message: &Message) -> Frame {
    frame.add_meta(meta::SENDER, message.sender());
    if message.is_group() {
        if let Some(name) = message.group_name() {
            frame.add_meta(meta::GROUP, name);
        }
    }
    frame
}

/// Emits text content directly.
pub struct TextParser;

impl MessageParser for TextParser {
    fn parse(&self, messages: &[Arc<Message>]) -> Vec<Frame> {
        messages
            .iter()
            .map(|message| {
                let content = match message.body() {
                    Body::Text(text) => text.clone(),
                    _ => String::new(),
                };
                annotate(Frame::new(TEXT_MESSAGE, content), message)
            })
            .collect()
    }
}

/// Stages picture bytes and emits the fetch URL.
pub struct PictureParser {
    proxy: Arc<FileProxy>,
}

impl PictureParser {
    #[must_use]
    pub fn new(proxy: Arc<FileProxy>) -> Self {
        Self { proxy }
    }
}

impl MessageParser for PictureParser {
    fn parse(&self, messages: &[Arc<Message>]) -> Vec<Frame> {
        messages
            .iter()
            .map(|message| {
                let content = match message.body() {
                    Body::Picture { data, suffix } => {
                        self.proxy.add_disposable(data.clone(), suffix)
                    }
                    _ => String::new(),
                };
                annotate(Frame::new(PICTURE_MESSAGE, content), message)
            })
            .collect()
    }
}

/// Stages file bytes under their original name and emits the fetch URL.
pub struct FileParser {
    proxy: Arc<FileProxy>,
}

impl FileParser {
    #[must_use]
    pub fn new(proxy: Arc<FileProxy>) -> Self {
        Self { proxy }
    }
}

impl MessageParser for FileParser {
    fn parse(&self, messages: &[Arc<Message>]) -> Vec<Frame> {
        messages
            .iter()
            .map(|message| {
                let content = match message.body() {
                    Body::File { data, filename } => {
                        self.proxy.add_disposable_named(data.clone(), filename)
                    }
                    _ => String::new(),
                };
                annotate(Frame::new(FILE_MESSAGE, content), message)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::DEFAULT_FILE_ROOT;
    use bytes::Bytes;

    fn proxy() -> Arc<FileProxy> {
        Arc::new(FileProxy::new("http://h:1", DEFAULT_FILE_ROOT))
    }

    #[test]
    fn test_text_parser_copies_meta() {
        let message = Arc::new(
            Message::text("hi")
                .with_sender("alice")
                .with_target("b;c")
                .with_group("team"),
        );

        let frames = TextParser.parse(&[message]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, TEXT_MESSAGE);
        assert_eq!(frames[0].content, "hi");
        assert_eq!(frames[0].meta.get(meta::SENDER).map(String::as_str), Some("alice"));
        assert_eq!(frames[0].meta.get(meta::GROUP).map(String::as_str), Some("team"));
    }

    #[test]
    fn test_single_target_has_no_group_meta() {
        let message = Arc::new(Message::text("hi").with_sender("a").with_target("b"));
        let frames = TextParser.parse(&[message]);
        assert!(!frames[0].meta.contains_key(meta::GROUP));
    }

    #[test]
    fn test_picture_parser_stages_payload() {
        let proxy = proxy();
        let message = Arc::new(
            Message::picture(Bytes::from_static(b"imagebytes"), "png")
                .with_sender("a")
                .with_target("b"),
        );

        let frames = PictureParser::new(proxy.clone()).parse(&[message]);
        assert!(frames[0].content.starts_with("http://h:1/IM_TEMP_FILE/"));
        assert!(frames[0].content.ends_with(".png"));
        assert_eq!(proxy.len(), 1);
    }

    #[test]
    fn test_file_parser_uses_original_name() {
        let proxy = proxy();
        let message = Arc::new(
            Message::file(Bytes::from_static(b"twelve bytes"), "report.pdf")
                .with_sender("a")
                .with_target("b"),
        );

        let frames = FileParser::new(proxy.clone()).parse(&[message]);
        assert!(frames[0].content.ends_with("/report.pdf"));

        let hash = frames[0].content.split('/').rev().nth(1).unwrap();
        assert_eq!(proxy.fetch(hash), Some(Bytes::from_static(b"twelve bytes")));
        assert_eq!(proxy.fetch(hash), None);
    }

    #[test]
    fn test_mismatched_body_yields_empty_content() {
        let message = Arc::new(Message::text("hi").with_sender("a").with_target("b"));
        let frames = PictureParser::new(proxy()).parse(&[message]);
        assert_eq!(frames[0].content, "");
    }
}

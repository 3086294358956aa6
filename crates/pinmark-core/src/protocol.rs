//! Wire format shared with the image server.
//!
//! Request/response bodies carry an [`ImageSnapshot`]. The live channel
//! carries JSON text frames tagged by an `event` field inbound, and raw PNG
//! mask frames outbound.
//!
//! ```json
//! { "event": "comment", "comment": { "left": 120, "top": 80, "message": "hi", "timestamp": 1 } }
//! { "event": "pic", "pic": { "id": "abc", "url": "..." } }
//! { "event": "mask", "url": "..." }
//! { "event": "error", "message": "..." }
//! ```

use crate::comments::{CommentEvent, Message};
use kurbo::Point;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tags the dispatcher knows how to route.
const KNOWN_TAGS: [&str; 4] = ["comment", "pic", "mask", "error"];

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Payload has no event tag")]
    MissingTag,
    #[error("Unknown event tag: {0}")]
    UnknownTag(String),
    #[error("Encode failed: {0}")]
    Encode(String),
}

/// A comment as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub left: f64,
    pub top: f64,
    pub message: String,
    pub timestamp: u64,
}

impl CommentRecord {
    /// Convert to the event shape consumed by the comment store.
    pub fn to_event(&self) -> CommentEvent {
        CommentEvent {
            position: Point::new(self.left, self.top),
            message: Message {
                text: self.message.clone(),
                timestamp: self.timestamp,
            },
        }
    }
}

/// Full state of one image resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSnapshot {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Reference to the uploaded image.
    pub url: String,
    /// Reference to the latest mask, if anyone has drawn yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Comment history keyed by server id, in server arrival order.
    #[serde(default, with = "ordered_comments")]
    pub comments: Vec<(String, CommentRecord)>,
}

impl ImageSnapshot {
    /// Parse a response body.
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Comment events oldest first.
    pub fn comment_events(&self) -> impl Iterator<Item = CommentEvent> + '_ {
        self.comments.iter().map(|(_, record)| record.to_event())
    }

    /// Comment events oldest first, with their server keys.
    pub fn keyed_comment_events(&self) -> impl Iterator<Item = (&str, CommentEvent)> + '_ {
        self.comments
            .iter()
            .map(|(key, record)| (key.as_str(), record.to_event()))
    }
}

/// Decoded live-channel event.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    CommentAdded(CommentEvent),
    PictureUpdated(ImageSnapshot),
    MaskUpdated(String),
    /// Server-reported problem; never fatal.
    ProtocolError(String),
}

/// Tagged JSON frame as it travels on the live channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WireEvent {
    Comment { comment: CommentRecord },
    Pic { pic: ImageSnapshot },
    Mask { url: String },
    Error { message: String },
}

impl WireEvent {
    /// Encode as a text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

impl From<WireEvent> for RemoteEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Comment { comment } => RemoteEvent::CommentAdded(comment.to_event()),
            WireEvent::Pic { pic } => RemoteEvent::PictureUpdated(pic),
            WireEvent::Mask { url } => RemoteEvent::MaskUpdated(url),
            WireEvent::Error { message } => RemoteEvent::ProtocolError(message),
        }
    }
}

/// Decode one inbound text frame.
///
/// The tag is checked before the payload so an unknown event is reported as
/// such rather than as a generic parse failure.
pub fn decode_event(text: &str) -> Result<RemoteEvent, ProtocolError> {
    // Peek at the tag only; the full parse below reads `text` again so comment
    // maps keep their document order.
    #[derive(Deserialize)]
    struct Tag {
        event: Option<String>,
    }

    let tag: Tag =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let tag = tag.event.ok_or(ProtocolError::MissingTag)?;
    if !KNOWN_TAGS.contains(&tag.as_str()) {
        return Err(ProtocolError::UnknownTag(tag));
    }

    let wire: WireEvent =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(wire.into())
}

/// Serde adapter keeping a JSON object's entry order.
mod ordered_comments {
    use super::CommentRecord;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(
        comments: &[(String, CommentRecord)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(comments.len()))?;
        for (key, record) in comments {
            map.serialize_entry(key, record)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, CommentRecord)>, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = Vec<(String, CommentRecord)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of comment records")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, record)) = access.next_entry::<String, CommentRecord>()? {
                    out.push((key, record));
                }
                Ok(out)
            }
        }

        deserializer.deserialize_any(OrderedVisitor)
    }
}

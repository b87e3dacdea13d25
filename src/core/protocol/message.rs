//! Wire message model.
//!
//! [`WireMessage`] is the transport-independent envelope exchanged with the
//! recognition service: a header map, a text or binary body and a locally
//! generated id. [`ProtocolEnvelope`] is the service-specific view of the same
//! message with the reserved headers (`Path`, `X-RequestId`, `X-Timestamp`,
//! `Content-Type`) lifted into named fields.

use bytes::Bytes;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

use super::codec::FramingError;
use super::headers;

// =============================================================================
// Headers
// =============================================================================

/// Header map with case-insensitive lookup.
///
/// Names are stored verbatim so that unknown headers survive a round trip
/// exactly as the peer sent them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any existing value with the same name
    /// (compared case-insensitively).
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => *entry = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self
            .entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

// =============================================================================
// WireMessage
// =============================================================================

/// Frame type a message travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Message payload. The variant decides the frame layout used on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Binary(Bytes),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text(_) => MessageKind::Text,
            MessageBody::Binary(_) => MessageKind::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MessageBody::Text(text) => text.len(),
            MessageBody::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport-independent message envelope. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    id: String,
    headers: Headers,
    body: MessageBody,
}

impl WireMessage {
    pub fn new(headers: Headers, body: MessageBody) -> Self {
        Self {
            id: new_message_id(),
            headers,
            body,
        }
    }

    pub fn text(headers: Headers, body: impl Into<String>) -> Self {
        Self::new(headers, MessageBody::Text(body.into()))
    }

    pub fn binary(headers: Headers, body: impl Into<Bytes>) -> Self {
        Self::new(headers, MessageBody::Binary(body.into()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// The `Path` header, if present.
    pub fn path(&self) -> Option<&str> {
        self.headers.get(headers::PATH)
    }

    pub fn into_parts(self) -> (String, Headers, MessageBody) {
        (self.id, self.headers, self.body)
    }
}

/// Dash-less v4 uuid, the id format the service uses for request and
/// connection ids.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().to_uppercase()
}

/// `X-Timestamp` layout: RFC 3339 UTC with millisecond precision.
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);

/// Current UTC time in the `X-Timestamp` format.
pub fn timestamp_now() -> String {
    format_timestamp(OffsetDateTime::now_utc())
}

fn format_timestamp(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(TIMESTAMP_FORMAT)
        .unwrap_or_default()
}

// =============================================================================
// ProtocolEnvelope
// =============================================================================

/// Service-level message: a [`WireMessage`] with the reserved headers
/// extracted. Built by the engine before every send and rebuilt from every
/// received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolEnvelope {
    pub id: String,
    /// Message type discriminator, e.g. `speech.phrase`.
    pub path: String,
    /// Correlates the message with a request session turn.
    pub request_id: String,
    pub timestamp: Option<String>,
    pub content_type: Option<String>,
    /// Every non-reserved header, verbatim.
    pub additional_headers: Headers,
    pub body: MessageBody,
}

impl ProtocolEnvelope {
    /// Text envelope stamped with the current time.
    pub fn text(
        path: &str,
        request_id: &str,
        content_type: Option<&str>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: new_message_id(),
            path: path.to_string(),
            request_id: request_id.to_string(),
            timestamp: Some(timestamp_now()),
            content_type: content_type.map(str::to_string),
            additional_headers: Headers::new(),
            body: MessageBody::Text(body.into()),
        }
    }

    /// Binary envelope stamped with the current time. An empty body is the
    /// end-of-audio marker.
    pub fn binary(path: &str, request_id: &str, body: impl Into<Bytes>) -> Self {
        Self {
            id: new_message_id(),
            path: path.to_string(),
            request_id: request_id.to_string(),
            timestamp: Some(timestamp_now()),
            content_type: None,
            additional_headers: Headers::new(),
            body: MessageBody::Binary(body.into()),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.insert(name, value);
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Case-insensitive path comparison.
    pub fn is_path(&self, path: &str) -> bool {
        self.path.eq_ignore_ascii_case(path)
    }

    /// Text body, or an empty string for binary messages.
    pub fn text_body(&self) -> &str {
        match &self.body {
            MessageBody::Text(text) => text,
            MessageBody::Binary(_) => "",
        }
    }

    pub fn binary_body(&self) -> Option<&Bytes> {
        match &self.body {
            MessageBody::Binary(data) => Some(data),
            MessageBody::Text(_) => None,
        }
    }

    pub fn into_wire(self) -> WireMessage {
        let mut wire_headers = Headers::new();
        wire_headers.insert(headers::PATH, self.path);
        wire_headers.insert(headers::REQUEST_ID, self.request_id);
        if let Some(timestamp) = self.timestamp {
            wire_headers.insert(headers::TIMESTAMP, timestamp);
        }
        if let Some(content_type) = self.content_type {
            wire_headers.insert(headers::CONTENT_TYPE, content_type);
        }
        for (name, value) in self.additional_headers.iter() {
            wire_headers.insert(name, value);
        }
        WireMessage {
            id: self.id,
            headers: wire_headers,
            body: self.body,
        }
    }
}

impl TryFrom<WireMessage> for ProtocolEnvelope {
    type Error = FramingError;

    fn try_from(message: WireMessage) -> Result<Self, Self::Error> {
        let (id, mut wire_headers, body) = message.into_parts();
        let path = wire_headers
            .remove(headers::PATH)
            .ok_or(FramingError::MissingHeader(headers::PATH))?;
        let request_id = wire_headers
            .remove(headers::REQUEST_ID)
            .ok_or(FramingError::MissingHeader(headers::REQUEST_ID))?;
        let timestamp = wire_headers.remove(headers::TIMESTAMP);
        let content_type = wire_headers.remove(headers::CONTENT_TYPE);

        Ok(Self {
            id,
            path,
            request_id,
            timestamp,
            content_type,
            additional_headers: wire_headers,
            body,
        })
    }
}

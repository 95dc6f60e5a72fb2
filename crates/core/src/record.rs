//! Records and frames.

use crate::error::EncodingError;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use std::borrow::Cow;

/// One unit of data pushed to a consumer.
///
/// Records have no identity beyond their position in the stream. They are
/// produced by a [`RecordSource`](crate::source::RecordSource) and consumed
/// once by the framer.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Plain text payload, sent as-is.
    Text(String),
    /// Raw bytes.
    Binary(Bytes),
    /// A JSON value, sent in compact form.
    Json(serde_json::Value),
}

impl Record {
    /// Create a text record.
    pub fn text(s: impl Into<String>) -> Self {
        Record::Text(s.into())
    }

    /// Create a binary record.
    pub fn binary(b: impl Into<Bytes>) -> Self {
        Record::Binary(b.into())
    }

    /// Build a JSON record from any serializable value.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, EncodingError> {
        Ok(Record::Json(serde_json::to_value(value)?))
    }

    /// Build a record from a received payload: text if it is valid UTF-8.
    pub fn from_payload(payload: Bytes) -> Self {
        match std::str::from_utf8(&payload) {
            Ok(s) => Record::Text(s.to_string()),
            Err(_) => Record::Binary(payload),
        }
    }

    /// The bytes that go on the wire for this record, without framing.
    pub fn payload(&self) -> Result<Cow<'_, [u8]>, EncodingError> {
        match self {
            Record::Text(s) => Ok(Cow::Borrowed(s.as_bytes())),
            Record::Binary(b) => Ok(Cow::Borrowed(b.as_ref())),
            Record::Json(v) => Ok(Cow::Owned(serde_json::to_vec(v)?)),
        }
    }

    /// Text view of the record, if it has one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Record::Text(s) => Some(s),
            Record::Binary(b) => std::str::from_utf8(b).ok(),
            Record::Json(_) => None,
        }
    }

    /// Deserialize the record payload as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        match self {
            Record::Text(s) => serde_json::from_str(s),
            Record::Binary(b) => serde_json::from_slice(b),
            Record::Json(v) => serde_json::from_value(v.clone()),
        }
    }
}

impl From<String> for Record {
    fn from(s: String) -> Self {
        Record::Text(s)
    }
}

impl From<&str> for Record {
    fn from(s: &str) -> Self {
        Record::Text(s.to_string())
    }
}

impl From<serde_json::Value> for Record {
    fn from(v: serde_json::Value) -> Self {
        Record::Json(v)
    }
}

/// An encoded record plus its delimiter or length prefix.
///
/// A frame is written whole or not at all: once a write of it fails the frame
/// is lost and never resent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub(crate) fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Flow {
        id: u32,
        proto: String,
    }

    #[test]
    fn test_json_payload_is_compact() {
        let record = Record::from(json!({"id": 1}));
        assert_eq!(record.payload().unwrap().as_ref(), b"{\"id\":1}");
    }

    #[test]
    fn test_from_serialize_and_parse_back() {
        let flow = Flow { id: 7, proto: "tcp".to_string() };
        let record = Record::from_serialize(&flow).unwrap();
        let wire = Record::from_payload(Bytes::from(record.payload().unwrap().into_owned()));
        assert_eq!(wire.parse_json::<Flow>().unwrap(), flow);
    }

    #[test]
    fn test_from_serialize_rejects_non_string_keys() {
        let mut map = std::collections::HashMap::new();
        map.insert((1, 2), "pair");
        assert!(matches!(
            Record::from_serialize(&map),
            Err(EncodingError::Serialize(_))
        ));
    }

    #[test]
    fn test_from_payload_keeps_invalid_utf8_binary() {
        let record = Record::from_payload(Bytes::from_static(&[0xff, 0xfe]));
        assert!(matches!(record, Record::Binary(_)));
        assert_eq!(record.as_text(), None);

        let record = Record::from_payload(Bytes::from_static(b"hello"));
        assert_eq!(record, Record::text("hello"));
    }
}

//! Core message types for conveyor.
//!
//! A [`Payload`] is the flat record of string fields that travels over the
//! stream wire format. Field insertion order is preserved because the store
//! flattens fields into an alternating key/value sequence on append.
//!
//! The field name `_orderingKey` is reserved: when present, consumers running
//! in ordered mode serialize all items sharing its value. No other
//! underscore-prefixed field is treated specially.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ORDERING_KEY_FIELD;

/// Server-assigned identifier of an appended stream entry.
///
/// Ids are opaque and monotonically ordered within a stream
/// (e.g. `"1234567890123-0"`). Once appended, `(stream, MessageId)` uniquely
/// identifies an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A flat record of string fields, in insertion order.
///
/// # Example
///
/// ```rust
/// use conveyor::Payload;
///
/// let mut payload = Payload::new();
/// payload.set("email", "a@example.com");
/// payload.set("subject", "hello");
/// assert_eq!(payload.get("email"), Some("a@example.com"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    fields: Vec<(String, String)>,
}

impl Payload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field, replacing the value in place if the field already exists.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let field = field.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(f, _)| *f == field) {
            Some((_, v)) => *v = value,
            None => self.fields.push((field, value)),
        }
        self
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }

    /// Remove a field, returning its value if it was present.
    pub fn remove(&mut self, field: &str) -> Option<String> {
        let pos = self.fields.iter().position(|(f, _)| f == field)?;
        Some(self.fields.remove(pos).1)
    }

    /// The ordering key, if this payload carries one.
    pub fn ordering_key(&self) -> Option<&str> {
        self.get(ORDERING_KEY_FIELD)
    }

    /// Tag this payload with an ordering key.
    pub fn set_ordering_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.set(ORDERING_KEY_FIELD, key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(f, v)| (f.as_str(), v.as_str()))
    }
}

impl<F: Into<String>, V: Into<String>> FromIterator<(F, V)> for Payload {
    fn from_iter<I: IntoIterator<Item = (F, V)>>(iter: I) -> Self {
        let mut payload = Payload::new();
        for (field, value) in iter {
            payload.set(field, value);
        }
        payload
    }
}

/// A consumed work item: the server-assigned id paired with its payload.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: MessageId,
    pub payload: Payload,
}

impl Job {
    pub fn new(id: MessageId, payload: Payload) -> Self {
        Self { id, payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_preserves_insertion_order() {
        let mut payload = Payload::new();
        payload.set("b", "1");
        payload.set("a", "2");
        payload.set("c", "3");

        let fields: Vec<_> = payload.iter().collect();
        assert_eq!(fields, vec![("b", "1"), ("a", "2"), ("c", "3")]);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut payload = Payload::new();
        payload.set("a", "1");
        payload.set("b", "2");
        payload.set("a", "3");

        let fields: Vec<_> = payload.iter().collect();
        assert_eq!(fields, vec![("a", "3"), ("b", "2")]);
    }

    #[test]
    fn ordering_key_roundtrip() {
        let mut payload = Payload::new();
        assert!(payload.ordering_key().is_none());

        payload.set_ordering_key("user-42");
        assert_eq!(payload.ordering_key(), Some("user-42"));
        assert_eq!(payload.get("_orderingKey"), Some("user-42"));
    }

    #[test]
    fn remove_returns_value() {
        let mut payload: Payload = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(payload.remove("a"), Some("1".to_string()));
        assert_eq!(payload.remove("a"), None);
        assert_eq!(payload.len(), 1);
    }

    #[test]
    fn from_iterator_collects() {
        let payload: Payload = [("email", "a@x"), ("subject", "s")].into_iter().collect();
        assert_eq!(payload.get("email"), Some("a@x"));
        assert_eq!(payload.get("subject"), Some("s"));
        assert_eq!(payload.len(), 2);
    }
}

//! The event envelope and its wire codec.
//!
//! On the wire an event is a flat UTF-8 JSON object. `eventName` is always
//! present; `eventSource` is stamped by the runtime of the agent that posts
//! it. Everything else is event-specific payload.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::vocab::EventKey;

// ============================================================================
// Event
// ============================================================================

/// A named event with a flat set of payload fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "eventName")]
    name: String,

    #[serde(rename = "eventSource", skip_serializing_if = "Option::is_none")]
    source: Option<String>,

    /// Payload fields. Never contains the envelope keys.
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Event {
    /// Create an event with no payload.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
            fields: Map::new(),
        }
    }

    /// Start building an event of the given name.
    pub fn builder(name: impl Into<String>) -> EventBuilder {
        EventBuilder {
            event: Self::new(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Stamp the posting agent's identity.
    pub fn set_source(&mut self, source: impl Into<String>) {
        self.source = Some(source.into());
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// Read a field holding an array of strings. Non-string members are skipped.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.fields
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.str_field(EventKey::USER_ID)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.str_field(EventKey::USER_SESSION_ID)
    }

    /// Set a field, replacing any previous value.
    ///
    /// The envelope keys are routed to the envelope: `eventSource` stamps the
    /// source, `eventName` renames the event.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match key.as_str() {
            EventKey::EVENT_NAME => {
                if let Value::String(name) = value {
                    self.name = name;
                }
            }
            EventKey::EVENT_SOURCE => {
                if let Value::String(source) = value {
                    self.source = Some(source);
                }
            }
            _ => {
                self.fields.insert(key, value);
            }
        }
    }

    /// Key used to pick the shard this event is appended to.
    ///
    /// Session-scoped events land on a predictable shard; everything else is
    /// spread by event name.
    pub fn partition_key(&self) -> &str {
        self.session_id().unwrap_or(&self.name)
    }

    /// Short human description, e.g. `event 'offer' from 'StoreOffersAgent'`.
    pub fn describe(&self) -> String {
        format!(
            "event '{}' from '{}'",
            self.name,
            self.source.as_deref().unwrap_or("")
        )
    }

    // ------------------------------------------------------------------------
    // Wire codec
    // ------------------------------------------------------------------------

    /// Decode a record read from the log.
    ///
    /// A record is only accepted as an event when it is a JSON object that
    /// names both the event and its source.
    pub fn from_wire(data: &[u8]) -> Result<Self, WireError> {
        let value: Value = serde_json::from_slice(data)?;
        let Value::Object(mut fields) = value else {
            return Err(WireError::NotAnObject);
        };

        let name = take_identity(&mut fields, EventKey::EVENT_NAME);
        let source = take_identity(&mut fields, EventKey::EVENT_SOURCE);

        match (name, source) {
            (Some(name), Some(source)) => Ok(Self {
                name,
                source: Some(source),
                fields,
            }),
            _ => Err(WireError::MissingIdentity),
        }
    }

    /// Encode to canonical JSON (payload keys sorted).
    pub fn to_wire(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn take_identity(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn is_vacant(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

// ============================================================================
// Builder
// ============================================================================

/// Field-by-field constructor for [`Event`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    /// Set a field, replacing any earlier value.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.event.insert(key, value);
        self
    }

    /// Set a field only when a value is present.
    pub fn optional_field<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.field(key, value),
            None => self,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.event.set_source(source);
        self
    }

    /// Merge a set of default properties. A key that already holds a value
    /// keeps it: the first writer wins.
    pub fn defaults<I, K>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        for (key, value) in properties {
            let key = key.into();
            let vacant = match key.as_str() {
                EventKey::EVENT_NAME => false,
                EventKey::EVENT_SOURCE => self.event.source.is_none(),
                other => is_vacant(self.event.fields.get(other)),
            };
            if vacant {
                self.event.insert(key, value);
            }
        }
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is not an event object")]
    NotAnObject,

    #[error("record does not include eventName and eventSource")]
    MissingIdentity,
}

// ============================================================================
// Tests
// ============================================================================

//! Event envelopes as published by the identity provider.
//!
//! Two families arrive on separate queues: [`ClientEvent`]s (user-facing
//! flows such as login and registration) and [`AdminEvent`]s (operations
//! performed through the admin console or API). Both carry an opaque detail
//! payload that is kept as raw JSON until the router knows which shape to
//! expect.
//!
//! # Example
//!
//! ```json
//! {
//!   "@class": "com.github.aznamier.keycloak.event.provider.EventClientNotificationMqMsg",
//!   "time": 1702288800000,
//!   "type": "REGISTER",
//!   "realmId": "master",
//!   "clientId": "account",
//!   "userId": "u1",
//!   "sessionId": "s1",
//!   "ipAddress": "10.0.0.1",
//!   "details": { "first_name": "A", "last_name": "B" }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while decoding a delivery body or one of its parts.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The delivery body is not a well-formed envelope
    #[error("malformed event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// A recognized event arrived without the detail payload it requires
    #[error("{event_type} event carries no detail payload")]
    MissingDetail { event_type: String },

    /// The detail payload does not match the expected shape
    #[error("malformed {shape} detail: {source}")]
    Detail {
        shape: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The admin resource path has no usable identifier segment
    #[error("resource path '{0}' has no identifier segment")]
    ResourcePath(String),
}

/// Which queue, and therefore which envelope shape, a delivery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFamily {
    Client,
    Admin,
}

impl EventFamily {
    /// Name used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            EventFamily::Client => "client",
            EventFamily::Admin => "admin",
        }
    }
}

impl std::fmt::Display for EventFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-originated event (login, registration, email verification, ...).
///
/// Missing fields decode to empty values; only type compatibility is checked.
#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientEvent {
    #[serde(rename = "@class")]
    pub class: String,

    /// Milliseconds since the Unix epoch
    #[serde(rename = "time")]
    pub timestamp: i64,

    #[serde(rename = "type")]
    pub event_type: String,

    pub realm_id: String,
    pub client_id: String,
    pub user_id: String,
    pub session_id: String,
    pub ip_address: String,

    /// Type-specific payload, decoded by the router. `None` only when the
    /// key is absent; an explicit `null` is kept as raw `null`.
    #[serde(deserialize_with = "present_raw")]
    pub details: Option<Box<RawValue>>,
}

/// An admin-originated event (resource create/update/delete).
#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AdminEvent {
    #[serde(rename = "@class")]
    pub class: String,

    /// Milliseconds since the Unix epoch
    #[serde(rename = "time")]
    pub timestamp: i64,

    pub realm_id: String,

    /// Who performed the operation, decoded by the router
    #[serde(deserialize_with = "present_raw")]
    pub auth_details: Option<Box<RawValue>>,

    pub resource_type: String,
    pub operation_type: String,
    pub resource_path: String,
    pub resource_type_as_string: String,
}

impl ClientEvent {
    /// Decode a client event envelope from a raw delivery body.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        decode_envelope(body)
    }

    /// Event time rendered as RFC 3339, for logs.
    pub fn time(&self) -> String {
        format_millis(self.timestamp)
    }
}

impl AdminEvent {
    /// Decode an admin event envelope from a raw delivery body.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        decode_envelope(body)
    }

    /// Event time rendered as RFC 3339, for logs.
    pub fn time(&self) -> String {
        format_millis(self.timestamp)
    }

    /// Identifier of the resource an operation targets.
    ///
    /// Resource paths look like `users/{id}` or `users/{id}/sessions`; the
    /// identifier is the second `/`-delimited segment.
    pub fn resource_id(&self) -> Result<&str, DecodeError> {
        match self.resource_path.split('/').nth(1) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(DecodeError::ResourcePath(self.resource_path.clone())),
        }
    }
}

/// How a JSON document that must describe a struct is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StructJson {
    Object,
    Null,
}

/// Accept only a JSON object or `null` where a struct is expected.
///
/// serde's derived struct visitor also accepts a sequence and fills fields
/// by position, so arrays have to be turned away before typed decoding.
pub(crate) fn struct_json(json: &[u8]) -> Result<StructJson, serde_json::Error> {
    let start = json.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(json.len());
    let rest = &json[start..];

    if rest.first() == Some(&b'{') {
        return Ok(StructJson::Object);
    }
    if std::str::from_utf8(rest).map(str::trim_end) == Ok("null") {
        return Ok(StructJson::Null);
    }

    // Not an object: decoding as a map yields the descriptive error
    serde_json::from_slice::<Map<String, Value>>(json).map(|_| StructJson::Object)
}

fn decode_envelope<T>(body: &[u8]) -> Result<T, DecodeError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match struct_json(body).map_err(DecodeError::Envelope)? {
        StructJson::Null => Ok(T::default()),
        StructJson::Object => serde_json::from_slice(body).map_err(DecodeError::Envelope),
    }
}

/// Keep a present key as raw JSON, including a literal `null`.
fn present_raw<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

/// Render epoch milliseconds as RFC 3339 with second precision.
fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp(millis.div_euclid(1000), 0)
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

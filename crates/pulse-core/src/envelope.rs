//! Wire envelope and message catalogs.
//!
//! Every frame in either direction is a JSON object:
//!
//! ```text
//! { "type": <tag>, "data": <object>, "timestamp": <RFC 3339>, "id": <string> }
//! ```
//!
//! Inbound frames are first parsed into a [`RawEnvelope`] (tag still a
//! string) so that a malformed frame and an unknown tag are reported with
//! different error codes, then resolved into a typed [`Envelope`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::errors::{ErrorCode, ProtocolError};
use crate::ids::MessageId;

// ─────────────────────────────────────────────────────────────────────────────
// Event categories
// ─────────────────────────────────────────────────────────────────────────────

/// Push-event categories a connection can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventCategory {
    /// Upload byte progress.
    #[serde(rename = "upload.progress")]
    UploadProgress,
    /// Upload finished.
    #[serde(rename = "upload.completed")]
    UploadCompleted,
    /// Upload failed.
    #[serde(rename = "upload.error")]
    UploadError,
    /// Upload cancelled.
    #[serde(rename = "upload.cancelled")]
    UploadCancelled,
    /// Review created.
    #[serde(rename = "review.created")]
    ReviewCreated,
    /// Review updated.
    #[serde(rename = "review.updated")]
    ReviewUpdated,
    /// Review deleted.
    #[serde(rename = "review.deleted")]
    ReviewDeleted,
    /// Operator notification.
    #[serde(rename = "system.notification")]
    SystemNotification,
    /// Scheduled maintenance notice.
    #[serde(rename = "system.maintenance")]
    SystemMaintenance,
    /// A user's status changed.
    #[serde(rename = "user.status_changed")]
    UserStatusChanged,
    /// File is being processed.
    #[serde(rename = "file.processing")]
    FileProcessing,
    /// File is ready.
    #[serde(rename = "file.ready")]
    FileReady,
}

impl EventCategory {
    /// Every category, in catalog order.
    pub const ALL: [Self; 12] = [
        Self::UploadProgress,
        Self::UploadCompleted,
        Self::UploadError,
        Self::UploadCancelled,
        Self::ReviewCreated,
        Self::ReviewUpdated,
        Self::ReviewDeleted,
        Self::SystemNotification,
        Self::SystemMaintenance,
        Self::UserStatusChanged,
        Self::FileProcessing,
        Self::FileReady,
    ];

    /// Wire tag (e.g. `"upload.progress"`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UploadProgress => "upload.progress",
            Self::UploadCompleted => "upload.completed",
            Self::UploadError => "upload.error",
            Self::UploadCancelled => "upload.cancelled",
            Self::ReviewCreated => "review.created",
            Self::ReviewUpdated => "review.updated",
            Self::ReviewDeleted => "review.deleted",
            Self::SystemNotification => "system.notification",
            Self::SystemMaintenance => "system.maintenance",
            Self::UserStatusChanged => "user.status_changed",
            Self::FileProcessing => "file.processing",
            Self::FileReady => "file.ready",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_owned()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types
// ─────────────────────────────────────────────────────────────────────────────

/// Every known `type` tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client round-trip check; answered with `pong`.
    Ping,
    /// Client adds event categories.
    Subscribe,
    /// Client removes event categories.
    Unsubscribe,
    /// Client liveness signal; no reply.
    Heartbeat,
    /// Client asks the upload pipeline to cancel an upload.
    UploadCancel,
    /// First server message after admission.
    ConnectionEstablished,
    /// Reply to `ping`.
    Pong,
    /// Reply to `subscribe` / `unsubscribe`.
    SubscriptionAcknowledged,
    /// Structured per-message error.
    Error,
    /// Application push event.
    Event(EventCategory),
}

impl MessageType {
    const CLIENT_TAGS: [(&'static str, Self); 5] = [
        ("ping", Self::Ping),
        ("subscribe", Self::Subscribe),
        ("unsubscribe", Self::Unsubscribe),
        ("heartbeat", Self::Heartbeat),
        ("upload.cancel", Self::UploadCancel),
    ];

    const SERVER_TAGS: [(&'static str, Self); 4] = [
        ("connection.established", Self::ConnectionEstablished),
        ("pong", Self::Pong),
        ("subscription.acknowledged", Self::SubscriptionAcknowledged),
        ("error", Self::Error),
    ];

    /// Wire tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Heartbeat => "heartbeat",
            Self::UploadCancel => "upload.cancel",
            Self::ConnectionEstablished => "connection.established",
            Self::Pong => "pong",
            Self::SubscriptionAcknowledged => "subscription.acknowledged",
            Self::Error => "error",
            Self::Event(category) => category.as_str(),
        }
    }

    /// Whether clients may send this type to the authority.
    #[must_use]
    pub fn is_client_message(self) -> bool {
        matches!(
            self,
            Self::Ping | Self::Subscribe | Self::Unsubscribe | Self::Heartbeat | Self::UploadCancel
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::CLIENT_TAGS
            .iter()
            .chain(Self::SERVER_TAGS.iter())
            .find(|(tag, _)| *tag == s)
            .map(|(_, kind)| *kind)
            .map_or_else(|| s.parse().map(Self::Event), Ok)
    }
}

impl From<EventCategory> for MessageType {
    fn from(category: EventCategory) -> Self {
        Self::Event(category)
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A typed message in either direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type tag.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Type-specific payload (always an object on the wire).
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Unique message identifier.
    #[serde(default)]
    pub id: MessageId,
}

fn empty_object() -> Value {
    json!({})
}

impl Envelope {
    /// Build an envelope stamped with the current time and a fresh id.
    pub fn new(kind: impl Into<MessageType>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data: if data.is_null() { empty_object() } else { data },
            timestamp: Utc::now(),
            id: MessageId::new(),
        }
    }

    /// Build an envelope from a serializable payload.
    pub fn from_payload<T: Serialize>(
        kind: impl Into<MessageType>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    /// Build an `error` envelope.
    pub fn error(payload: &ErrorPayload) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::to_value(payload).unwrap_or_else(|_| {
                json!({ "code": payload.code, "message": payload.message })
            }),
        )
    }

    /// Decode `data` into a typed payload.
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An inbound frame whose tag has not been checked yet.
#[derive(Clone, Debug, Deserialize)]
pub struct RawEnvelope {
    /// Unchecked type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload as sent.
    #[serde(default)]
    pub data: Value,
    /// Client timestamp, if supplied.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Client message id, if supplied.
    #[serde(default)]
    pub id: Option<String>,
}

impl RawEnvelope {
    /// Resolve the tag against the catalog.
    ///
    /// Missing `timestamp`/`id` are filled in; a `null` payload becomes `{}`.
    pub fn resolve(self) -> Result<Envelope, ProtocolError> {
        let kind: MessageType = self
            .kind
            .parse()
            .map_err(|_| ProtocolError::UnknownType(self.kind.clone()))?;
        Ok(Envelope {
            kind,
            data: if self.data.is_null() {
                empty_object()
            } else {
                self.data
            },
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            id: self.id.map_or_else(MessageId::new, MessageId::from),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Limits the authority publishes in `connection.established`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLimits {
    /// Maximum serialized message size in bytes.
    pub max_message_size: usize,
    /// Messages allowed per rate window.
    pub rate_limit_messages: u32,
    /// Rate window length in milliseconds.
    pub rate_limit_window_ms: u64,
    /// Expected client heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl ServerLimits {
    /// Rate window as a [`Duration`].
    #[must_use]
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    /// Heartbeat interval as a [`Duration`].
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            max_message_size: crate::MAX_MESSAGE_SIZE,
            rate_limit_messages: 100,
            rate_limit_window_ms: 60_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

/// `connection.established` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEstablished {
    /// Assigned connection id.
    pub connection_id: String,
    /// Authenticated identity.
    pub user_id: String,
    /// Authority clock at admission.
    pub server_time: DateTime<Utc>,
    /// Effective limits for this connection.
    pub limits: ServerLimits,
}

/// `error` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Milliseconds until the sender's rate window frees a slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    /// Wall-clock instant the rate window frees a slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    /// Id of the offending message, when it could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl ErrorPayload {
    /// Error with just a code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_ms: None,
            reset_at: None,
            message_id: None,
        }
    }

    /// Attach the offending message id.
    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

impl From<&ProtocolError> for ErrorPayload {
    fn from(err: &ProtocolError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

/// `ping` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    /// Client-chosen id echoed back in the `pong`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// `pong` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    /// Echo of the ping's correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Authority clock when the pong was built.
    pub server_time: DateTime<Utc>,
}

/// `subscribe` / `unsubscribe` payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Requested category tags (unrecognized ones are tolerated).
    pub events: Vec<String>,
}

impl SubscriptionRequest {
    /// Request for a set of known categories.
    pub fn for_categories<'a>(categories: impl IntoIterator<Item = &'a EventCategory>) -> Self {
        Self {
            events: categories
                .into_iter()
                .map(|c| c.as_str().to_owned())
                .collect(),
        }
    }
}

/// Which request a `subscription.acknowledged` answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionAction {
    /// Answer to `subscribe`.
    Subscribe,
    /// Answer to `unsubscribe`.
    Unsubscribe,
}

/// `subscription.acknowledged` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAck {
    /// Request being answered.
    pub action: SubscriptionAction,
    /// Recognized categories the request applied to.
    pub events: Vec<EventCategory>,
    /// Tags that were not recognized.
    #[serde(default)]
    pub rejected: Vec<String>,
    /// The connection's full subscription set after the change.
    pub subscriptions: Vec<EventCategory>,
}

/// `upload.cancel` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCancelRequest {
    /// Upload to cancel.
    pub upload_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn category_tags_roundtrip() {
        for category in EventCategory::ALL {
            let parsed: EventCategory = category.as_str().parse().unwrap();
            assert_eq!(parsed, category);
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
    }

    #[test]
    fn unknown_category_is_rejected() {
        assert_matches!(
            "upload.teleported".parse::<EventCategory>(),
            Err(ProtocolError::UnknownType(tag)) if tag == "upload.teleported"
        );
    }

    #[test]
    fn message_type_parses_fixed_and_event_tags() {
        assert_eq!("ping".parse::<MessageType>().unwrap(), MessageType::Ping);
        assert_eq!(
            "upload.cancel".parse::<MessageType>().unwrap(),
            MessageType::UploadCancel
        );
        assert_eq!(
            "connection.established".parse::<MessageType>().unwrap(),
            MessageType::ConnectionEstablished
        );
        assert_eq!(
            "review.updated".parse::<MessageType>().unwrap(),
            MessageType::Event(EventCategory::ReviewUpdated)
        );
        assert!("reboot".parse::<MessageType>().is_err());
    }

    #[test]
    fn client_direction() {
        assert!(MessageType::Ping.is_client_message());
        assert!(MessageType::UploadCancel.is_client_message());
        assert!(!MessageType::Pong.is_client_message());
        assert!(!MessageType::Event(EventCategory::FileReady).is_client_message());
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(EventCategory::FileReady, json!({"file_id": "f1"}));
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "file.ready");
        assert_eq!(value["data"]["file_id"], "f1");
        assert!(value["timestamp"].is_string());
        assert!(value["id"].is_string());
    }

    #[test]
    fn envelope_null_data_becomes_object() {
        let env = Envelope::new(MessageType::Heartbeat, Value::Null);
        assert!(env.data.is_object());
    }

    #[test]
    fn raw_envelope_fills_defaults() {
        let raw: RawEnvelope = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        let env = raw.resolve().unwrap();
        assert_eq!(env.kind, MessageType::Heartbeat);
        assert!(env.data.is_object());
        assert!(!env.id.is_empty());
    }

    #[test]
    fn raw_envelope_keeps_client_id() {
        let raw: RawEnvelope =
            serde_json::from_str(r#"{"type":"ping","id":"m-1","data":{"correlation_id":"c"}}"#)
                .unwrap();
        let env = raw.resolve().unwrap();
        assert_eq!(env.id.as_str(), "m-1");
        let ping: PingPayload = env.payload().unwrap();
        assert_eq!(ping.correlation_id.as_deref(), Some("c"));
    }

    #[test]
    fn raw_envelope_unknown_type() {
        let raw: RawEnvelope = serde_json::from_str(r#"{"type":"warp"}"#).unwrap();
        assert_matches!(raw.resolve(), Err(ProtocolError::UnknownType(t)) if t == "warp");
    }

    #[test]
    fn error_payload_skips_empty_hints() {
        let payload = ErrorPayload::new(ErrorCode::UnknownType, "nope");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["code"], "UNKNOWN_TYPE");
        assert!(value.get("retry_after_ms").is_none());
        assert!(value.get("reset_at").is_none());
    }

    #[test]
    fn subscription_ack_serializes_categories_as_tags() {
        let ack = SubscriptionAck {
            action: SubscriptionAction::Subscribe,
            events: vec![EventCategory::UploadProgress],
            rejected: vec!["bogus".into()],
            subscriptions: vec![EventCategory::UploadProgress, EventCategory::FileReady],
        };
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value["action"], "subscribe");
        assert_eq!(value["events"][0], "upload.progress");
        assert_eq!(value["rejected"][0], "bogus");
        assert_eq!(value["subscriptions"][1], "file.ready");
    }

    #[test]
    fn server_limits_durations() {
        let limits = ServerLimits::default();
        assert_eq!(limits.max_message_size, 65_536);
        assert_eq!(limits.rate_window(), Duration::from_secs(60));
        assert_eq!(limits.heartbeat_interval(), Duration::from_secs(30));
    }
}

//! Message validation shared by the authority and the agent.
//!
//! Inbound order is fixed: size, then parse, then type, then payload shape.
//! The first failing step decides the error code reported to the sender.

use serde_json::Value;

use crate::envelope::{Envelope, MessageType, RawEnvelope};
use crate::errors::ProtocolError;

/// Reject payloads whose serialized size exceeds `max` bytes.
pub fn check_size(len: usize, max: usize) -> Result<(), ProtocolError> {
    if len > max {
        return Err(ProtocolError::TooLarge { size: len, max });
    }
    Ok(())
}

/// Parse raw bytes into an unchecked envelope.
///
/// The frame must be a JSON object with a string `type`.
pub fn parse_raw(bytes: &[u8]) -> Result<RawEnvelope, ProtocolError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed("expected a JSON object".into()));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Resolve the tag, enforce direction, and check the payload shape of a
/// client → authority message.
pub fn validate_client_message(raw: RawEnvelope) -> Result<Envelope, ProtocolError> {
    let envelope = raw.resolve()?;
    if !envelope.kind.is_client_message() {
        return Err(ProtocolError::NotClientType(envelope.kind.as_str().into()));
    }
    check_shape(&envelope)?;
    Ok(envelope)
}

/// Full inbound pipeline without rate limiting: size, parse, type, shape.
pub fn validate_inbound(bytes: &[u8], max: usize) -> Result<Envelope, ProtocolError> {
    check_size(bytes.len(), max)?;
    validate_client_message(parse_raw(bytes)?)
}

/// Validate an envelope the local side is about to send and return its
/// wire form.
pub fn validate_outbound(envelope: &Envelope, max: usize) -> Result<String, ProtocolError> {
    if envelope.kind.is_client_message() {
        check_shape(envelope)?;
    }
    let text = envelope
        .to_json()
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    check_size(text.len(), max)?;
    Ok(text)
}

fn check_shape(envelope: &Envelope) -> Result<(), ProtocolError> {
    let kind = envelope.kind;
    let data = &envelope.data;
    if !data.is_object() {
        return Err(invalid(kind, "data must be an object"));
    }
    match kind {
        MessageType::Subscribe | MessageType::Unsubscribe => {
            let events = data
                .get("events")
                .and_then(Value::as_array)
                .ok_or_else(|| invalid(kind, "'events' must be an array"))?;
            if events.iter().any(|e| !e.is_string()) {
                return Err(invalid(kind, "'events' must contain only strings"));
            }
        }
        MessageType::UploadCancel => {
            let has_id = data
                .get("upload_id")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty());
            if !has_id {
                return Err(invalid(kind, "'upload_id' is required"));
            }
        }
        MessageType::Ping => {
            if data
                .get("correlation_id")
                .is_some_and(|c| !c.is_string() && !c.is_null())
            {
                return Err(invalid(kind, "'correlation_id' must be a string"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn invalid(kind: MessageType, reason: &str) -> ProtocolError {
    ProtocolError::InvalidPayload {
        kind: kind.as_str().into(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventCategory;
    use crate::errors::ErrorCode;
    use assert_matches::assert_matches;
    use serde_json::json;

    const MAX: usize = crate::MAX_MESSAGE_SIZE;

    #[test]
    fn size_limit_is_inclusive() {
        assert!(check_size(MAX, MAX).is_ok());
        assert_matches!(
            check_size(MAX + 1, MAX),
            Err(ProtocolError::TooLarge { size, max }) if size == MAX + 1 && max == MAX
        );
    }

    #[test]
    fn oversized_frame_fails_before_parse() {
        let junk = vec![b'{'; MAX + 1];
        let err = validate_inbound(&junk, MAX).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageTooLarge);
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = validate_inbound(b"{not json", MAX).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn non_object_is_malformed() {
        let err = validate_inbound(b"[1,2,3]", MAX).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn missing_type_is_malformed() {
        let err = validate_inbound(br#"{"data":{}}"#, MAX).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn unknown_type() {
        let err = validate_inbound(br#"{"type":"launch","data":{}}"#, MAX).unwrap_err();
        assert_matches!(err, ProtocolError::UnknownType(t) if t == "launch");
    }

    #[test]
    fn server_only_type_from_client() {
        let err = validate_inbound(br#"{"type":"pong","data":{}}"#, MAX).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownType);
        let err = validate_inbound(br#"{"type":"upload.progress","data":{}}"#, MAX).unwrap_err();
        assert_matches!(err, ProtocolError::NotClientType(_));
    }

    #[test]
    fn subscribe_requires_string_events() {
        let err = validate_inbound(br#"{"type":"subscribe","data":{}}"#, MAX).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
        let err =
            validate_inbound(br#"{"type":"subscribe","data":{"events":[1]}}"#, MAX).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
        let ok = validate_inbound(
            br#"{"type":"subscribe","data":{"events":["upload.progress","bogus"]}}"#,
            MAX,
        )
        .unwrap();
        assert_eq!(ok.kind, MessageType::Subscribe);
    }

    #[test]
    fn upload_cancel_requires_id() {
        let err = validate_inbound(br#"{"type":"upload.cancel","data":{}}"#, MAX).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
        let ok = validate_inbound(
            br#"{"type":"upload.cancel","data":{"upload_id":"u-9"}}"#,
            MAX,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn heartbeat_without_data_is_fine() {
        let env = validate_inbound(br#"{"type":"heartbeat"}"#, MAX).unwrap();
        assert_eq!(env.kind, MessageType::Heartbeat);
    }

    #[test]
    fn outbound_checks_shape_and_size() {
        let bad = Envelope::new(MessageType::Subscribe, json!({"events": "nope"}));
        assert_matches!(
            validate_outbound(&bad, MAX),
            Err(ProtocolError::InvalidPayload { .. })
        );

        let big = Envelope::new(
            EventCategory::SystemNotification,
            json!({ "text": "x".repeat(MAX) }),
        );
        assert_matches!(
            validate_outbound(&big, MAX),
            Err(ProtocolError::TooLarge { .. })
        );

        let ok = Envelope::new(MessageType::Ping, json!({"correlation_id": "c1"}));
        let text = validate_outbound(&ok, MAX).unwrap();
        assert!(text.contains("\"ping\""));
    }
}

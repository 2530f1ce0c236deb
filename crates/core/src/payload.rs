//! Request payloads.
//!
//! A payload is a JSON object with handler-specific arguments. It is stored
//! serialized and handed back to the handler at execution time, together with
//! the result of the previous request in the same job under
//! [`PREVIOUS_RESULT_KEY`].

use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};

/// Handler arguments (a JSON object).
pub type Payload = serde_json::Map<String, JsonValue>;

/// Reserved key carrying the previous request's result into `unpack`.
pub const PREVIOUS_RESULT_KEY: &str = "__previous_result";

/// Convert an arbitrary JSON value into a payload.
///
/// `null` becomes an empty payload; anything other than an object is rejected,
/// as is an object that already uses the reserved key.
pub fn from_value(value: JsonValue) -> DomainResult<Payload> {
    let payload = match value {
        JsonValue::Null => Payload::new(),
        JsonValue::Object(map) => map,
        other => {
            return Err(DomainError::validation(format!(
                "payload must be a JSON object, got {}",
                kind_of(&other)
            )));
        }
    };
    check_reserved(&payload)?;
    Ok(payload)
}

/// Reject payloads that try to set the reserved previous-result key.
pub fn check_reserved(payload: &Payload) -> DomainResult<()> {
    if payload.contains_key(PREVIOUS_RESULT_KEY) {
        return Err(DomainError::validation(format!(
            "payload key '{PREVIOUS_RESULT_KEY}' is reserved"
        )));
    }
    Ok(())
}

/// Copy of `payload` with the previous result injected under the reserved key.
///
/// When there is no previous result the key is absent.
pub fn with_previous_result(payload: &Payload, previous: Option<&JsonValue>) -> Payload {
    let mut unpacked = payload.clone();
    match previous {
        Some(value) => {
            unpacked.insert(PREVIOUS_RESULT_KEY.to_string(), value.clone());
        }
        None => {
            unpacked.remove(PREVIOUS_RESULT_KEY);
        }
    }
    unpacked
}

/// Serialize a payload for storage.
pub fn encode(payload: &Payload) -> String {
    JsonValue::Object(payload.clone()).to_string()
}

/// Deserialize a stored payload. Empty strings decode to an empty payload.
pub fn decode(raw: &str) -> DomainResult<Payload> {
    if raw.trim().is_empty() {
        return Ok(Payload::new());
    }
    let value: JsonValue = serde_json::from_str(raw)
        .map_err(|e| DomainError::validation(format!("stored payload is not JSON: {e}")))?;
    match value {
        JsonValue::Object(map) => Ok(map),
        JsonValue::Null => Ok(Payload::new()),
        other => Err(DomainError::validation(format!(
            "stored payload must be an object, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_is_empty_payload() {
        assert!(from_value(JsonValue::Null).unwrap().is_empty());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(matches!(
            from_value(json!([1, 2])),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn reserved_key_is_rejected() {
        let err = from_value(json!({ PREVIOUS_RESULT_KEY: 1 })).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn previous_result_is_injected_and_cleared() {
        let payload = from_value(json!({"email": "a@example.com"})).unwrap();

        let unpacked = with_previous_result(&payload, Some(&json!({"contact_id": 7})));
        assert_eq!(unpacked[PREVIOUS_RESULT_KEY], json!({"contact_id": 7}));
        assert_eq!(unpacked["email"], json!("a@example.com"));

        let again = with_previous_result(&unpacked, None);
        assert!(!again.contains_key(PREVIOUS_RESULT_KEY));
    }

    #[test]
    fn decode_accepts_stored_form() {
        let payload = from_value(json!({"b": 1, "a": {"z": true}})).unwrap();
        let raw = encode(&payload);
        assert_eq!(decode(&raw).unwrap(), payload);
        assert!(decode("").unwrap().is_empty());
        assert!(decode("42").is_err());
    }
}

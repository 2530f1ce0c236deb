//! Content fingerprints used for debouncing duplicate requests.

use core::fmt;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use serde_json::Value as JsonValue;

use crate::payload::Payload;
use crate::request::TypeCode;

/// SHA-256 over `(relation_id, type_code, payload)`, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint a pending request.
///
/// Payload keys are hashed in sorted order, so two payloads that differ only
/// in insertion order produce the same fingerprint. A missing relation id and
/// an empty one are distinct.
pub fn fingerprint(relation_id: Option<&str>, type_code: &TypeCode, payload: &Payload) -> Fingerprint {
    let mut hasher = sha2::Sha256::new();
    match relation_id {
        Some(relation) => {
            hasher.update([1u8]);
            hasher.update(relation.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    hasher.update([0x1f]);
    hasher.update(type_code.as_str().as_bytes());
    hasher.update([0x1f]);
    let mut canonical = String::new();
    write_canonical(&mut canonical, &JsonValue::Object(payload.clone()));
    hasher.update(canonical.as_bytes());

    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for b in digest {
        let _ = write!(&mut out, "{:02x}", b);
    }
    Fingerprint(out)
}

/// JSON with object keys sorted at every level.
fn write_canonical(out: &mut String, value: &JsonValue) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(out, &map[key.as_str()]);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload_of(value: serde_json::Value) -> Payload {
        crate::payload::from_value(value).unwrap()
    }

    #[test]
    fn key_order_does_not_matter() {
        let mut a = Payload::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!(2));
        let mut b = Payload::new();
        b.insert("y".into(), json!(2));
        b.insert("x".into(), json!(1));

        let code = TypeCode::new("contact.update");
        assert_eq!(
            fingerprint(Some("17"), &code, &a),
            fingerprint(Some("17"), &code, &b)
        );
    }

    #[test]
    fn every_component_matters() {
        let code = TypeCode::new("contact.update");
        let payload = payload_of(json!({"email": "a@example.com"}));
        let base = fingerprint(Some("17"), &code, &payload);

        assert_ne!(base, fingerprint(Some("18"), &code, &payload));
        assert_ne!(base, fingerprint(None, &code, &payload));
        assert_ne!(base, fingerprint(Some("17"), &TypeCode::new("contact.create"), &payload));
        assert_ne!(
            base,
            fingerprint(Some("17"), &code, &payload_of(json!({"email": "b@example.com"})))
        );
        assert_ne!(fingerprint(None, &code, &payload), fingerprint(Some(""), &code, &payload));
    }

    #[test]
    fn is_hex_sha256() {
        let fp = fingerprint(None, &TypeCode::new("t"), &Payload::new());
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest! {
        #[test]
        fn deterministic(relation in proptest::option::of("[a-z0-9]{0,8}"), code in "[a-z.]{1,12}", n in any::<i64>()) {
            let code = TypeCode::new(code);
            let payload = payload_of(json!({"n": n}));
            prop_assert_eq!(
                fingerprint(relation.as_deref(), &code, &payload),
                fingerprint(relation.as_deref(), &code, &payload.clone())
            );
        }

        #[test]
        fn distinct_payloads_differ(a in any::<i64>(), b in any::<i64>()) {
            prop_assume!(a != b);
            let code = TypeCode::new("transaction.record");
            prop_assert_ne!(
                fingerprint(Some("1"), &code, &payload_of(json!({"points": a}))),
                fingerprint(Some("1"), &code, &payload_of(json!({"points": b})))
            );
        }
    }
}

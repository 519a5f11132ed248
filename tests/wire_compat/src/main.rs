fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use graphwire_protocol::{CloseCode, Message, MessageType, PathSegment};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes JSON values so that integer-valued floats compare equal.
    ///
    /// JavaScript clients send `12` and `12.0` interchangeably; both are the
    /// same number on the wire.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    serde_json::json!(f)
                } else {
                    v.clone()
                }
            }
            serde_json::Value::Object(map) => {
                let normalized: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect();
                serde_json::Value::Object(normalized)
            }
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Decodes a fixture from its text, re-encodes it, and compares the
    /// JSON values (order-independent, float-normalized comparison).
    fn roundtrip_test(name: &str, kind: MessageType) -> Message {
        let fixture = load_fixture(name);
        let msg = Message::decode(&fixture.to_string())
            .unwrap_or_else(|e| panic!("failed to decode {name}: {e}"));
        assert_eq!(msg.kind(), kind, "wrong kind for {name}");

        let encoded = msg
            .encode()
            .unwrap_or_else(|e| panic!("failed to encode {name}: {e}"));
        let reserialized: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  wire: {fixture}\n  ours: {reserialized}"
        );
        msg
    }

    // --- Client to server ---

    #[test]
    fn fixture_connection_init() {
        let msg = roundtrip_test("connection_init.json", MessageType::ConnectionInit);
        let Message::ConnectionInit { payload: Some(p) } = msg else {
            panic!("payload lost");
        };
        assert_eq!(p["token"], "abc");
    }

    #[test]
    fn fixture_ping() {
        roundtrip_test("ping.json", MessageType::Ping);
    }

    #[test]
    fn fixture_pong() {
        roundtrip_test("pong.json", MessageType::Pong);
    }

    #[test]
    fn fixture_subscribe() {
        let msg = roundtrip_test("subscribe.json", MessageType::Subscribe);
        let Message::Subscribe { id, payload } = msg else {
            unreachable!();
        };
        assert_eq!(id.as_deref(), Some("b1e0a3a4-7d5c-4c1e-9b5f-3f2c3e1d9a10"));
        assert_eq!(payload.operation_name.as_deref(), Some("Greetings"));
        assert_eq!(payload.variables.unwrap()["lang"], "fr");
        assert!(payload.extensions.unwrap().contains_key("persistedQuery"));
    }

    #[test]
    fn fixture_subscribe_minimal() {
        let msg = roundtrip_test("subscribe_minimal.json", MessageType::Subscribe);
        let Message::Subscribe { payload, .. } = msg else {
            unreachable!();
        };
        assert!(payload.operation_name.is_none());
        assert!(payload.variables.is_none());
    }

    #[test]
    fn fixture_complete() {
        let msg = roundtrip_test("complete.json", MessageType::Complete);
        assert_eq!(msg.id(), Some("1"));
    }

    // --- Server to client ---

    #[test]
    fn fixture_connection_ack() {
        let msg = roundtrip_test("connection_ack.json", MessageType::ConnectionAck);
        assert_eq!(msg, Message::ack(None));
    }

    #[test]
    fn fixture_connection_ack_payload() {
        roundtrip_test("connection_ack_payload.json", MessageType::ConnectionAck);
    }

    #[test]
    fn fixture_next() {
        roundtrip_test("next.json", MessageType::Next);
    }

    #[test]
    fn fixture_next_partial() {
        let msg = roundtrip_test("next_partial.json", MessageType::Next);
        let Message::Next { payload, .. } = msg else {
            unreachable!();
        };
        let err = &payload.errors[0];
        assert_eq!(
            err.path,
            vec![
                PathSegment::Field("user".into()),
                PathSegment::Field("friends".into()),
                PathSegment::Index(0),
            ]
        );
        assert_eq!(err.locations[0].line, 3);
    }

    #[test]
    fn fixture_next_null_data() {
        let msg = roundtrip_test("next_null_data.json", MessageType::Next);
        let Message::Next { payload, .. } = msg else {
            unreachable!();
        };
        assert_eq!(payload.data, Some(serde_json::Value::Null));
    }

    #[test]
    fn fixture_error() {
        let msg = roundtrip_test("error.json", MessageType::Error);
        let Message::Error { payload, .. } = msg else {
            unreachable!();
        };
        assert_eq!(payload.len(), 1);
        assert!(payload[0].message.starts_with("Syntax Error"));
    }

    // --- Frames a server must refuse or tolerate ---

    #[test]
    fn unknown_type_is_not_a_decode_error() {
        let msg = Message::decode(r#"{"type":"start","id":"1","payload":{}}"#).unwrap();
        assert_eq!(msg.kind(), MessageType::Unknown);
    }

    #[test]
    fn frames_without_type_are_rejected() {
        for text in ["", "null", "42", "{}", r#"{"id":"1"}"#] {
            assert!(Message::decode(text).is_err(), "accepted {text:?}");
        }
    }

    #[test]
    fn close_codes_are_stable() {
        let table = [
            (4400, "Invalid message"),
            (4401, "Unauthorized"),
            (4408, "Connection initialisation timeout"),
            (4429, "Too many initialisation requests"),
        ];
        for (code, reason) in table {
            let close = CloseCode::from_code(code).unwrap();
            assert_eq!(close.code(), code);
            assert_eq!(close.reason(), reason);
        }
        assert_eq!(CloseCode::SubscriberAlreadyExists.code(), 4409);
        assert_eq!(CloseCode::from_code(1000), None);
    }
}

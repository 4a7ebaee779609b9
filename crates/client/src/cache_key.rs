//! Deterministic cache-key derivation from (method, request).
//!
//! Small flat requests produce readable `method:k=v&k=v` keys with sorted
//! field names so that structurally identical requests share a key no matter
//! how the caller assembled them. Everything else falls back to a djb2 hash
//! of the canonical (key-sorted) JSON encoding.

use serde_json::Value;

/// Maximum number of fields a request may have and still produce a
/// readable `k=v&…` key.
const FLAT_KEY_MAX_FIELDS: usize = 10;

/// djb2 seed.
const DJB2_SEED: u32 = 5381;

/// Derives the fallback-cache key for a request.
#[must_use]
pub fn cache_key(method: &str, request: &Value) -> String {
    match request {
        Value::Null => format!("{method}:null"),
        Value::Bool(b) => format!("{method}:{b}"),
        Value::Number(n) => format!("{method}:{n}"),
        Value::String(s) => format!("{method}:{s}"),
        Value::Object(map) if is_flat_and_small(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{key}={}", scalar_text(&map[key])))
                .collect();
            format!("{method}:{}", pairs.join("&"))
        }
        other => format!("{method}:{:x}", djb2(&canonical_json(other))),
    }
}

/// True when every field is a scalar and the field count is small enough
/// for the readable key form.
fn is_flat_and_small(map: &serde_json::Map<String, Value>) -> bool {
    map.len() <= FLAT_KEY_MAX_FIELDS
        && map
            .values()
            .all(|value| !matches!(value, Value::Object(_) | Value::Array(_)))
}

/// Unquoted text form of a scalar value, as it appears in `k=v` pairs.
fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        // Guarded by is_flat_and_small.
        Value::Object(_) | Value::Array(_) => String::new(),
    }
}

/// Canonical JSON encoding: object keys sorted ascending at every level,
/// no insignificant whitespace.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    let encoded_key =
                        serde_json::to_string(key).unwrap_or_else(|_| format!("\"{key}\""));
                    format!("{encoded_key}:{}", canonical_json(&map[key]))
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let encoded: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", encoded.join(","))
        }
        scalar => scalar.to_string(),
    }
}

/// djb2 (xor variant) over the UTF-16 code units of the input, reduced to
/// an unsigned 32-bit value.
pub(crate) fn djb2(input: &str) -> u32 {
    let mut hash = DJB2_SEED;
    for unit in input.encode_utf16() {
        hash = hash.wrapping_shl(5).wrapping_add(hash) ^ u32::from(unit);
    }
    hash
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn null_request() {
        assert_eq!(cache_key("GetUser", &Value::Null), "GetUser:null");
    }

    #[test]
    fn scalar_requests() {
        assert_eq!(cache_key("Get", &json!("abc")), "Get:abc");
        assert_eq!(cache_key("Get", &json!(42)), "Get:42");
        assert_eq!(cache_key("Get", &json!(true)), "Get:true");
        assert_eq!(cache_key("Get", &json!(false)), "Get:false");
    }

    #[test]
    fn flat_object_sorted_pairs() {
        assert_eq!(cache_key("M", &json!({"a": 1, "b": 2})), "M:a=1&b=2");
    }

    #[test]
    fn flat_object_order_invariant() {
        let forward = json!({"a": 1, "b": 2});
        let reversed = json!({"b": 2, "a": 1});
        assert_eq!(cache_key("M", &forward), cache_key("M", &reversed));
        assert_eq!(cache_key("M", &forward), "M:a=1&b=2");
    }

    #[test]
    fn flat_object_with_null_and_string_values() {
        let request = json!({"id": 7, "name": "ada", "tag": null});
        assert_eq!(cache_key("Find", &request), "Find:id=7&name=ada&tag=null");
    }

    #[test]
    fn nested_object_hashes() {
        let request = json!({"filter": {"id": 1}});
        let key = cache_key("Search", &request);
        let suffix = key.strip_prefix("Search:").unwrap();
        assert!(
            suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()),
            "expected lowercase hex, got {suffix}"
        );
    }

    #[test]
    fn array_request_hashes() {
        let key = cache_key("Batch", &json!([1, 2, 3]));
        let suffix = key.strip_prefix("Batch:").unwrap();
        assert_eq!(suffix, format!("{:x}", djb2("[1,2,3]")));
    }

    #[test]
    fn wide_object_hashes() {
        // Eleven fields exceeds the readable-key limit.
        let mut map = serde_json::Map::new();
        for i in 0..11 {
            map.insert(format!("k{i:02}"), json!(i));
        }
        let request = Value::Object(map);
        let key = cache_key("Wide", &request);
        assert!(!key.contains('&'), "expected hashed key, got {key}");
        assert_eq!(key, cache_key("Wide", &request));
    }

    #[test]
    fn hashed_keys_are_order_invariant() {
        let forward = json!({"outer": {"a": 1, "b": [1, 2]}, "z": "x"});
        let reversed = json!({"z": "x", "outer": {"b": [1, 2], "a": 1}});
        assert_eq!(cache_key("Q", &forward), cache_key("Q", &reversed));
    }

    #[test]
    fn canonical_json_sorts_recursively() {
        let value = json!({"b": {"d": 1, "c": 2}, "a": [true, null]});
        assert_eq!(canonical_json(&value), r#"{"a":[true,null],"b":{"c":2,"d":1}}"#);
    }

    #[test]
    fn djb2_known_values() {
        assert_eq!(djb2(""), 0x1505);
        assert_eq!(djb2("a"), 0x2b5c4);
    }

    #[test]
    fn djb2_walks_utf16_code_units() {
        // U+1F600 is a surrogate pair: two code units, not one scalar.
        let mut expected = DJB2_SEED;
        for unit in [0xD83Du32, 0xDE00u32] {
            expected = expected.wrapping_shl(5).wrapping_add(expected) ^ unit;
        }
        assert_eq!(djb2("\u{1F600}"), expected);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod proptest_tests {
    use proptest::prelude::*;
    use serde_json::{Value, json};

    use super::cache_key;

    /// Builds the same flat object twice with opposite insertion orders.
    fn both_orders(fields: &[(String, i64)]) -> (Value, Value) {
        let mut forward = serde_json::Map::new();
        for (k, v) in fields {
            forward.insert(k.clone(), json!(v));
        }
        let mut reversed = serde_json::Map::new();
        for (k, v) in fields.iter().rev() {
            reversed.insert(k.clone(), json!(v));
        }
        (Value::Object(forward), Value::Object(reversed))
    }

    proptest! {
        /// Keys are insensitive to field insertion order.
        #[test]
        fn prop_key_order_invariant(
            fields in proptest::collection::hash_map("[a-z]{1,8}", any::<i64>(), 0..8)
        ) {
            let fields: Vec<(String, i64)> = fields.into_iter().collect();
            let (forward, reversed) = both_orders(&fields);
            prop_assert_eq!(cache_key("M", &forward), cache_key("M", &reversed));
        }

        /// Derivation is deterministic.
        #[test]
        fn prop_key_deterministic(text in ".{0,64}") {
            let request = json!({"q": text});
            prop_assert_eq!(cache_key("M", &request), cache_key("M", &request));
        }
    }
}

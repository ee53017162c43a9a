// =============================================================================
// Canonical serialization & content addressing for signal records
// =============================================================================
//
// The hash rule is bit-exact and reproducible by any consumer:
//
//   signal_id = hex(SHA-256(canonical_json_without(signal_id, prev_signal_hash)))
//
// Canonical JSON: UTF-8, keys sorted, no insignificant whitespace, numbers in
// shortest round-trip form. serde_json provides all three as long as its
// `preserve_order` feature stays off (its Map is a BTreeMap, so keys sort)
// and floats go through its default ryu formatting.
// =============================================================================

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::types::Signal;

/// Canonical JSON of the full record, including `signal_id` and
/// `prev_signal_hash`. This is the publication payload.
pub fn canonical_json(signal: &Signal) -> Result<String, StoreError> {
    let value = serde_json::to_value(signal)?;
    Ok(value.to_string())
}

/// Canonical JSON of the content fields only (hash input).
pub fn hashable_json(signal: &Signal) -> Result<String, StoreError> {
    let mut value = serde_json::to_value(signal)?;
    if let Value::Object(map) = &mut value {
        map.remove("signal_id");
        map.remove("prev_signal_hash");
    }
    Ok(value.to_string())
}

/// Hex SHA-256 over the hashable canonical form. Any bit flip in any content
/// field changes the result.
pub fn content_hash(signal: &Signal) -> Result<String, StoreError> {
    let json = hashable_json(signal)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Parse a canonical JSON record back into a `Signal`.
pub fn from_canonical_json(json: &str) -> Result<Signal, StoreError> {
    Ok(serde_json::from_str(json)?)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Regime, TradeAction};

    fn sample() -> Signal {
        Signal {
            signal_id: String::new(),
            prev_signal_hash: String::new(),
            symbol: "NVDA".into(),
            action: TradeAction::Buy,
            entry_price: 450.0,
            target_price: 472.5,
            stop_price: 436.5,
            confidence: 88.5,
            regime: Regime::Trending,
            sources_used: vec!["alpha".into(), "beacon".into(), "tech".into()],
            rationale: "3/3 sources long in TRENDING; weighted score 0.885".into(),
            generation_latency_ms: 42,
            server_timestamp: "2025-06-01T14:30:00.123Z".into(),
            created_at: "2025-06-01T14:30:00.120Z".into(),
            retention_expires_at: "2025-07-01T14:30:00.120Z".into(),
        }
    }

    #[test]
    fn canonical_json_has_sorted_keys_and_no_whitespace() {
        let json = canonical_json(&sample()).unwrap();
        assert!(!json.contains(": "));
        assert!(!json.contains('\n'));
        // "action" sorts before "confidence" sorts before "symbol".
        let a = json.find("\"action\"").unwrap();
        let c = json.find("\"confidence\"").unwrap();
        let s = json.find("\"symbol\"").unwrap();
        assert!(a < c && c < s);
    }

    #[test]
    fn hash_excludes_id_and_prev_fields() {
        let mut signal = sample();
        let base = content_hash(&signal).unwrap();

        signal.signal_id = "deadbeef".into();
        signal.prev_signal_hash = "cafebabe".into();
        assert_eq!(content_hash(&signal).unwrap(), base);
    }

    #[test]
    fn any_content_bit_flip_changes_the_hash() {
        let base = content_hash(&sample()).unwrap();

        let mut s = sample();
        s.entry_price = 450.00000001;
        assert_ne!(content_hash(&s).unwrap(), base);

        let mut s = sample();
        s.action = TradeAction::Sell;
        assert_ne!(content_hash(&s).unwrap(), base);

        let mut s = sample();
        s.rationale.push('.');
        assert_ne!(content_hash(&s).unwrap(), base);

        let mut s = sample();
        s.sources_used.pop();
        assert_ne!(content_hash(&s).unwrap(), base);
    }

    #[test]
    fn hash_is_stable_across_reserialization() {
        let signal = sample();
        let h1 = content_hash(&signal).unwrap();
        let json = canonical_json(&signal).unwrap();
        let parsed = from_canonical_json(&json).unwrap();
        let h2 = content_hash(&parsed).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(signal, parsed);
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let h = content_hash(&sample()).unwrap();
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn float_round_trip_preserves_shortest_form() {
        let mut s = sample();
        s.entry_price = 0.1 + 0.2; // 0.30000000000000004
        let json = canonical_json(&s).unwrap();
        let parsed = from_canonical_json(&json).unwrap();
        assert_eq!(s.entry_price, parsed.entry_price);
        assert_eq!(content_hash(&s).unwrap(), content_hash(&parsed).unwrap());
    }
}

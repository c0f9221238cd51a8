//! Property-style coverage for MQTT remaining-length varint encoding (§8
//! testable property 9): every value up to the 4-byte ceiling round-trips
//! through `encode_remaining_length`/`decode_remaining_length`, and the
//! encoded length never exceeds the byte count that value's magnitude
//! requires.

use proptest::prelude::*;
use squall::mqtt::parser::{decode_remaining_length, encode_remaining_length, MAX_REMAINING_LENGTH};

fn expected_len(n: usize) -> usize {
    match n {
        0..=127 => 1,
        128..=16383 => 2,
        16384..=2097151 => 3,
        _ => 4,
    }
}

proptest! {
    #[test]
    fn round_trips_any_in_range_value(n in 0usize..=MAX_REMAINING_LENGTH) {
        let encoded = encode_remaining_length(n).unwrap();
        prop_assert_eq!(encoded.len(), expected_len(n));
        let (decoded, consumed) = decode_remaining_length(&encoded).unwrap().unwrap();
        prop_assert_eq!(decoded, n);
        prop_assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn values_past_the_ceiling_are_rejected(extra in 1usize..1_000_000) {
        prop_assert!(encode_remaining_length(MAX_REMAINING_LENGTH + extra).is_err());
    }

    #[test]
    fn a_truncated_encoding_never_panics(n in 128usize..=MAX_REMAINING_LENGTH) {
        let encoded = encode_remaining_length(n).unwrap();
        let truncated = &encoded[..encoded.len() - 1];
        // Not enough bytes yet: must report "need more", never panic or
        // misreport a value.
        prop_assert!(decode_remaining_length(truncated).unwrap().is_none());
    }
}

//! Property-Based Tests for the Cache Core
//!
//! # Test Properties
//!
//! 1. **Codec Roundtrip**: decode(encode(v)) = v for frames and strings
//! 2. **Hit-Rate Formula**: h hits, m misses → h/(h+m)*100, or 0
//! 3. **Tag Index Consistency**: no key is left in a tag set after unregister
//! 4. **Glob Semantics**: a literal pattern matches exactly itself

#![cfg(test)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use proptest::prelude::*;

use super::accountant::PerformanceAccountant;
use super::codec::Codec;
use super::compression::CompressionConfig;
use super::index::{GlobPattern, InvalidationIndex};

// =============================================================================
// Property Strategies
// =============================================================================

fn record_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u32>>> {
    prop::collection::btree_map("[a-z]{1,8}", prop::collection::vec(any::<u32>(), 0..50), 0..10)
}

fn key_strategy() -> impl Strategy<Value = String> {
    "[a-z]{1,4}:[0-9]{1,3}"
}

fn tagging_strategy() -> impl Strategy<Value = Vec<(String, Vec<String>)>> {
    prop::collection::vec(
        (key_strategy(), prop::collection::vec("t[0-4]", 0..4)),
        0..30,
    )
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Frames decode back to the original value, compressed or not
    #[test]
    fn prop_frame_roundtrip(record in record_strategy(), threshold in 0usize..2048) {
        let codec = Codec::with_compression(CompressionConfig {
            min_size_bytes: threshold,
            ..Default::default()
        });
        let frame = codec.encode_frame(&record).unwrap();
        let decoded: BTreeMap<String, Vec<u32>> = codec.decode_frame(&frame).unwrap();
        prop_assert_eq!(decoded, record);
    }

    /// The string recovered from a frame equals the original string form
    #[test]
    fn prop_frame_preserves_string_form(record in record_strategy()) {
        let codec = Codec::with_compression(CompressionConfig {
            min_size_bytes: 0,
            ..Default::default()
        });
        let payload = codec.encode_string(&record).unwrap();
        let frame = codec.frame_from_string(&payload).unwrap();
        prop_assert_eq!(codec.string_from_frame(&frame).unwrap(), payload);
    }

    /// Truncating a frame never decodes successfully
    #[test]
    fn prop_truncated_frame_fails(record in record_strategy(), cut in 1usize..16) {
        let codec = Codec::new();
        let frame = codec.encode_frame(&record).unwrap();
        let cut = cut.min(frame.len());
        let result = codec.decode_frame::<BTreeMap<String, Vec<u32>>>(&frame[..frame.len() - cut]);
        prop_assert!(result.is_err());
    }
}

// =============================================================================
// Accountant Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_hit_rate_formula(hits in 0u64..200, misses in 0u64..200) {
        let accountant = PerformanceAccountant::default();
        for _ in 0..hits {
            accountant.record_outcome("k", true, Duration::from_millis(1));
        }
        for _ in 0..misses {
            accountant.record_outcome("k", false, Duration::from_millis(1));
        }

        let expected = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64 * 100.0
        };
        prop_assert!((accountant.hit_rate() - expected).abs() < 1e-9);

        if hits + misses > 0 {
            let metric = accountant.metric("k").unwrap();
            prop_assert_eq!(metric.total_requests, hits + misses);
            prop_assert!((metric.average_response_time_ms - 1.0).abs() < 1e-9);
        }
    }
}

// =============================================================================
// Index Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Every tag set lists exactly the keys whose latest registration
    /// carried it
    #[test]
    fn prop_index_matches_registrations(taggings in tagging_strategy()) {
        let index = InvalidationIndex::new();
        let mut latest: HashMap<&str, &Vec<String>> = HashMap::new();
        for (key, tags) in &taggings {
            index.register(key, tags);
            latest.insert(key.as_str(), tags);
        }

        for tag in ["t0", "t1", "t2", "t3", "t4"] {
            let expected: HashSet<String> = latest
                .iter()
                .filter(|(_, tags)| tags.iter().any(|t| t == tag))
                .map(|(key, _)| key.to_string())
                .collect();
            prop_assert_eq!(index.keys_for_tag(tag), expected);
        }
    }

    /// Unregistering every key leaves no tags behind
    #[test]
    fn prop_unregister_leaves_no_dangling_keys(taggings in tagging_strategy()) {
        let index = InvalidationIndex::new();
        for (key, tags) in &taggings {
            index.register(key, tags);
        }
        for (key, _) in &taggings {
            index.unregister(key);
        }

        let counts = index.counts();
        prop_assert_eq!(counts.tags, 0);
        prop_assert_eq!(counts.tagged_keys, 0);
        prop_assert_eq!(counts.registered_keys, 0);
    }

    /// A wildcard-free pattern matches only the identical key
    #[test]
    fn prop_literal_glob_matches_itself(key in key_strategy(), other in key_strategy()) {
        let pattern = GlobPattern::new(&key).unwrap();
        prop_assert!(pattern.is_literal());
        prop_assert!(pattern.matches(&key));
        prop_assert_eq!(pattern.matches(&other), key == other);
    }

    /// Prefix scans agree with a linear filter
    #[test]
    fn prop_prefix_scan_agrees_with_filter(
        keys in prop::collection::vec(key_strategy(), 0..40),
        prefix in "[a-z]{0,2}",
    ) {
        let index = InvalidationIndex::new();
        for key in &keys {
            index.register_key(key, Duration::from_secs(3600));
        }

        let mut expected: Vec<String> = keys.iter().filter(|k| k.starts_with(&prefix)).cloned().collect();
        expected.sort();
        expected.dedup();
        prop_assert_eq!(index.keys_with_prefix(&prefix), expected);
    }
}

mod common;

use clusterflow::prelude::*;
use common::small_config;
use proptest::prelude::*;

fn lane_kind() -> impl Strategy<Value = LaneKind> {
    prop_oneof![Just(LaneKind::Pixel), Just(LaneKind::Strip)]
}

proptest! {
    #[test]
    fn capacity_check_matches_configured_bound(kind in lane_kind(), len in 0_usize..64) {
        let config = small_config();
        let capacity = config.input_capacity(kind);
        let stream = WordStream::from_words(vec![0; len]);

        let result = validate_against(&stream, kind, &config);

        if len <= capacity {
            prop_assert!(result.is_ok());
        } else {
            let is_capacity_error = matches!(
                result,
                Err(ClusterFlowError::CapacityExceeded { lane, len: l, capacity: c })
                    if lane == kind && l == len && c == capacity
            );
            prop_assert!(is_capacity_error);
        }
    }

    #[test]
    fn hex_lines_decode_to_their_values(
        words in proptest::collection::vec(any::<u64>(), 0..32),
        upper in any::<bool>(),
        pad in 0_usize..3,
    ) {
        let text: String = words
            .iter()
            .map(|w| {
                let digits = if upper { format!("{:X}", w) } else { format!("{:x}", w) };
                format!("{}{}{}\n\n", " ".repeat(pad), digits, "\t".repeat(pad))
            })
            .collect();

        let stream = WordStream::parse_hex(&text, "words.txt").unwrap();
        prop_assert_eq!(stream.words(), words.as_slice());
    }

    #[test]
    fn bad_line_is_reported_one_indexed(
        good_before in 0_usize..20,
        bad in "[g-zG-Z]{1,8}",
    ) {
        let mut text: String = (0..good_before).map(|i| format!("{:x}\n", i)).collect();
        text.push_str(&bad);
        text.push_str("\nff\n");

        let err = WordStream::parse_hex(&text, "words.txt").unwrap_err();
        let reported = match err {
            ClusterFlowError::InputFormat { line, content, .. } => Some((line, content)),
            _ => None,
        };
        prop_assert_eq!(reported, Some((good_before + 1, bad)));
    }

    #[test]
    fn more_than_sixteen_digits_is_rejected(extra in 1_usize..8, word in any::<u64>()) {
        let text = format!("{}{:016x}\n", "1".repeat(extra), word);
        let is_format_error = matches!(
            WordStream::parse_hex(&text, "words.txt"),
            Err(ClusterFlowError::InputFormat { line: 1, .. })
        );
        prop_assert!(is_format_error);
    }
}

//! Property tests for the bit stream and the compressed series codec.

use chunkdb::bitstream::BitStream;
use chunkdb::encoding::VarBitTimeSeries;
use chunkdb::types::{Point, MAX_UNIX_TIMESTAMP};
use proptest::prelude::*;

fn mask(n: u32, v: u64) -> u64 {
    if n == 64 {
        v
    } else {
        v & ((1u64 << n) - 1)
    }
}

/// Non-decreasing timestamps starting anywhere in the 32-bit range, with arbitrary values.
fn series_strategy() -> impl Strategy<Value = Vec<(i64, f64)>> {
    (
        0i64..=(MAX_UNIX_TIMESTAMP - 10_000_000),
        prop::collection::vec((0i64..5_000, prop::num::f64::ANY), 1..200),
    )
        .prop_map(|(start, steps)| {
            let mut ts = start;
            steps
                .into_iter()
                .map(|(delta, v)| {
                    ts += delta;
                    (ts, v)
                })
                .collect()
        })
}

fn encode(points: &[(i64, f64)]) -> VarBitTimeSeries {
    let mut s = VarBitTimeSeries::new();
    for &(ts, v) in points {
        s.append(ts, v).unwrap();
    }
    s
}

fn assert_bit_eq(decoded: &[Point], expected: &[(i64, f64)]) {
    assert_eq!(decoded.len(), expected.len());
    for (p, &(ts, v)) in decoded.iter().zip(expected) {
        assert!(p.bit_eq(&Point::new(ts, v)), "{:?} != ({}, {})", p, ts, v);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 1000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_bitstream_reads_back_what_was_written(
        writes in prop::collection::vec((1u32..=64, any::<u64>()), 1..300)
    ) {
        let mut stream = BitStream::new();
        for &(n, v) in &writes {
            stream.write(n, mask(n, v)).unwrap();
        }
        let total: usize = writes.iter().map(|&(n, _)| n as usize).sum();
        prop_assert_eq!(stream.bit_length(), total);

        let bytes = stream.to_bytes().unwrap();
        prop_assert_eq!(bytes.len(), stream.serialized_byte_size());
        let mut buf = bytes.as_slice();
        let restored = BitStream::deserialize(&mut buf).unwrap();
        prop_assert!(buf.is_empty());

        for source in [stream.read(), restored.read()] {
            let mut it = source;
            for &(n, v) in &writes {
                prop_assert_eq!(it.read(n).unwrap(), mask(n, v));
            }
            prop_assert_eq!(it.remaining(), 0);
            prop_assert!(it.read(1).is_err());
        }
    }

    #[test]
    fn prop_series_survives_serialization(points in series_strategy()) {
        let series = encode(&points);
        assert_bit_eq(&series.read().points().unwrap(), &points);

        let bytes = series.serialize().unwrap();
        prop_assert_eq!(bytes.len(), series.serialized_byte_size());
        let decoded = VarBitTimeSeries::deserialize(&bytes).unwrap().points().unwrap();
        assert_bit_eq(&decoded, &points);
    }

    #[test]
    fn prop_snapshots_are_unaffected_by_later_appends(
        points in series_strategy(),
        split in any::<prop::sample::Index>()
    ) {
        let at = split.index(points.len());
        let mut series = encode(&points[..at]);
        let snapshot = series.read();
        for &(ts, v) in &points[at..] {
            series.append(ts, v).unwrap();
        }
        assert_bit_eq(&snapshot.points().unwrap(), &points[..at]);
        assert_bit_eq(&series.read().points().unwrap(), &points);
    }

    #[test]
    fn prop_truncated_bytes_never_decode_silently(
        points in series_strategy(),
        cut in any::<prop::sample::Index>()
    ) {
        let bytes = encode(&points).serialize().unwrap();
        let len = cut.index(bytes.len());
        let result = VarBitTimeSeries::deserialize(&bytes[..len]).and_then(|it| it.points());
        prop_assert!(result.is_err());
    }
}

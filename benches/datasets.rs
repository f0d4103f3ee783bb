use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub const DEFAULT_SEED: u64 = 0x_4348_554E_4B44_4245; // fixed seed for stable benchmarks

/// Aligned to a two-hour chunk boundary.
pub const BASE_TS: i64 = 1_488_499_200;

/// `put` lines spread over `metric_count` metrics with `tag_pairs` random tags each,
/// one point per metric every 10 seconds.
pub fn generate_put_lines(
    seed: u64,
    points: usize,
    metric_count: usize,
    tag_pairs: usize,
    tag_cardinality: u32,
) -> Vec<String> {
    assert!(metric_count > 0);
    assert!(tag_cardinality > 0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    // Each metric keeps one tag set so the series count stays bounded.
    let tag_sets: Vec<String> = (0..metric_count)
        .map(|m| {
            let mut tags = format!("id={}", m);
            for k in 0..tag_pairs {
                let v = rng.random_range(0..tag_cardinality);
                tags.push_str(&format!(" k{}=v{}", k, v));
            }
            tags
        })
        .collect();

    (0..points)
        .map(|i| {
            let m = i % metric_count;
            let ts = BASE_TS + (i / metric_count) as i64 * 10;
            let val = rng.random::<u32>() as f64 * 0.001;
            format!("put series_{} {} {} {}", m % 8, ts, val, tag_sets[m])
        })
        .collect()
}

/// A gauge-like walk: regular 10 s timestamps with small jitter and slowly drifting values.
pub fn generate_points(seed: u64, points: usize) -> Vec<(i64, f64)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut ts = BASE_TS;
    let mut val = 100.0f64;
    (0..points)
        .map(|_| {
            ts += 10 + rng.random_range(-1..=1);
            val += rng.random_range(-0.5..0.5);
            (ts, (val * 100.0).round() / 100.0)
        })
        .collect()
}

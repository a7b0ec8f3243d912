//! Logit processing and token selection for one decode step of one stream.
//!
//! Order matters: temperature, then padding suppression, then top-k, then
//! softmax. Runs on the host; a stream's logits are a few hundred floats.

use rand::Rng;

use super::loss::IGNORE_INDEX;

/// Scale by `1 / temperature`, forbid the padding class, keep the `top_k`
/// largest logits.
///
/// `temperature` must be > 0; 0 is not special-cased (use argmax instead).
/// `top_k` is clamped to `1..=logits.len()`. Logits tied with the k-th largest
/// value are kept.
pub fn process_logits(logits: &mut [f32], temperature: f32, top_k: Option<usize>) {
    for l in logits.iter_mut() {
        *l /= temperature;
    }
    if let Some(l) = logits.get_mut(IGNORE_INDEX as usize) {
        *l = f32::NEG_INFINITY;
    }
    if let Some(k) = top_k {
        let k = k.clamp(1, logits.len().max(1));
        let mut sorted = logits.to_vec();
        sorted.sort_unstable_by(|a, b| b.total_cmp(a));
        if let Some(&threshold) = sorted.get(k - 1) {
            for l in logits.iter_mut() {
                if *l < threshold {
                    *l = f32::NEG_INFINITY;
                }
            }
        }
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

/// Index of the largest probability; the first one wins on ties.
pub fn argmax(probs: &[f32]) -> u32 {
    let mut best = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p > probs[best] {
            best = i;
        }
    }
    best as u32
}

/// Sample one index from a probability distribution.
///
/// Draws a uniform sample in [0,1) and walks the CDF of `probs`.
pub fn sample<R: Rng + ?Sized>(probs: &[f32], rng: &mut R) -> u32 {
    let sample: f64 = rng.random();
    let mut cumulative = 0.0f64;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p as f64;
        if sample < cumulative {
            return i as u32;
        }
    }
    // Floating-point rounding: fall back to the last index with mass.
    probs
        .iter()
        .rposition(|&p| p > 0.0)
        .unwrap_or(probs.len().saturating_sub(1)) as u32
}

/// Process, normalise and select in one go.
pub fn select<R: Rng + ?Sized>(
    mut logits: Vec<f32>,
    temperature: f32,
    top_k: Option<usize>,
    deterministic: bool,
    rng: &mut R,
) -> u32 {
    process_logits(&mut logits, temperature, top_k);
    let probs = softmax(&logits);
    if deterministic {
        argmax(&probs)
    } else {
        sample(&probs, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn padding_is_suppressed_before_top_k() {
        let mut logits = vec![100.0, 1.0, 2.0, 3.0];
        process_logits(&mut logits, 1.0, Some(1));
        assert_eq!(logits[0], f32::NEG_INFINITY);
        // Top-1 among the remaining classes is index 3.
        assert_eq!(logits[3], 3.0);
        assert!(logits[1].is_infinite() && logits[2].is_infinite());
    }

    #[test]
    fn top_k_is_clamped_to_vocabulary() {
        let mut logits = vec![0.5, 1.0, 2.0];
        process_logits(&mut logits, 1.0, Some(50));
        assert_eq!(logits, vec![f32::NEG_INFINITY, 1.0, 2.0]);
    }

    #[test]
    fn temperature_scales_before_filtering() {
        let mut logits = vec![0.0, 2.0, 4.0];
        process_logits(&mut logits, 2.0, None);
        assert_eq!(logits, vec![f32::NEG_INFINITY, 1.0, 2.0]);
    }

    #[test]
    fn softmax_normalises() {
        let probs = softmax(&[f32::NEG_INFINITY, 0.0, 0.0]);
        assert_eq!(probs[0], 0.0);
        assert!((probs[1] - 0.5).abs() < 1e-6);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn argmax_prefers_first_on_ties() {
        assert_eq!(argmax(&[0.1, 0.4, 0.4, 0.1]), 1);
    }

    #[test]
    fn sampling_never_picks_zero_mass() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..1000 {
            let id = select(vec![50.0, -1.0, 0.0, 0.5], 1.3, Some(2), false, &mut rng);
            assert!(id == 2 || id == 3, "sampled {id}");
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let probs = softmax(&[0.0, 1.0, 1.0, 1.0, 1.0]);
        let mut a = ChaCha8Rng::seed_from_u64(42);
        let mut b = ChaCha8Rng::seed_from_u64(42);
        let xs: Vec<u32> = (0..32).map(|_| sample(&probs, &mut a)).collect();
        let ys: Vec<u32> = (0..32).map(|_| sample(&probs, &mut b)).collect();
        assert_eq!(xs, ys);
    }
}

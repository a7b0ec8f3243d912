//! ALiBi relative position bias.
//!
//! Instead of position embeddings, every self-attention head adds
//! `-slope_h · |i - j|` to its scores. Slopes form a geometric sequence
//! `2^(-8/n), 2^(-16/n), …`; head counts that are not a power of two take the
//! slopes of the closest smaller power of two, then every other slope of the
//! next power of two.

use candle_core::{DType, Device, Result, Tensor};

/// Per-head slopes for ALiBi.
#[derive(Debug, Clone)]
pub struct Alibi {
    slopes: Vec<f32>,
}

fn power_of_two_slopes(n: usize) -> Vec<f32> {
    let start = 2f64.powf(-8.0 / n as f64);
    (1..=n).map(|i| start.powi(i as i32) as f32).collect()
}

impl Alibi {
    pub fn new(num_heads: usize) -> Self {
        let slopes = if num_heads.is_power_of_two() {
            power_of_two_slopes(num_heads)
        } else {
            let closest = 1usize << (usize::BITS - 1 - num_heads.leading_zeros());
            let mut slopes = power_of_two_slopes(closest);
            slopes.extend(
                power_of_two_slopes(2 * closest)
                    .into_iter()
                    .step_by(2)
                    .take(num_heads - closest),
            );
            slopes
        };
        Self { slopes }
    }

    pub fn slopes(&self) -> &[f32] {
        &self.slopes
    }

    /// Bias of shape `[1, H, q_len, k_len]`.
    pub fn bias(
        &self,
        q_len: usize,
        k_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let heads = self.slopes.len();
        let mut data = Vec::with_capacity(heads * q_len * k_len);
        for &slope in &self.slopes {
            for i in 0..q_len {
                for j in 0..k_len {
                    data.push(-slope * i.abs_diff(j) as f32);
                }
            }
        }
        Tensor::from_vec(data, (1, heads, q_len, k_len), device)?.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slopes_for_eight_heads() {
        let alibi = Alibi::new(8);
        let expected: Vec<f32> = (1..=8).map(|i| 0.5f32.powi(i)).collect();
        for (got, want) in alibi.slopes().iter().zip(&expected) {
            assert!((got - want).abs() < 1e-7, "{got} vs {want}");
        }
    }

    #[test]
    fn slopes_for_non_power_of_two() {
        let alibi = Alibi::new(6);
        assert_eq!(alibi.slopes().len(), 6);
        // First four from n=4: 2^-2, 2^-4, 2^-6, 2^-8
        assert!((alibi.slopes()[0] - 0.25).abs() < 1e-7);
        assert!((alibi.slopes()[3] - 2f32.powi(-8)).abs() < 1e-9);
        // Then slopes 1 and 3 of n=8: 2^-1, 2^-3
        assert!((alibi.slopes()[4] - 0.5).abs() < 1e-7);
        assert!((alibi.slopes()[5] - 0.125).abs() < 1e-7);
    }

    #[test]
    fn bias_is_symmetric_distance_penalty() {
        let alibi = Alibi::new(2);
        let bias = alibi.bias(3, 3, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(bias.dims(), &[1, 2, 3, 3]);
        let vals: Vec<f32> = bias.flatten_all().unwrap().to_vec1().unwrap();
        // Head 0 slope = 2^-4
        assert_eq!(vals[0], 0.0);
        assert!((vals[2] + 2.0 / 16.0).abs() < 1e-7);
        assert_eq!(vals[1], vals[3]);
    }
}

//! Training loss: one cross-entropy per stream, summed without weights.
//!
//! Class 0 is the padding sentinel in every stream. Targets equal to 0 are
//! excluded from both the numerator and the count, so padded positions of a
//! variable-length batch drop out of the loss without an explicit mask.

use candle_core::{D, DType, Result, Tensor};

use super::embedding::StreamLogits;

/// Class index excluded from the loss.
pub const IGNORE_INDEX: u32 = 0;

/// Mean cross-entropy over all non-ignored targets.
///
/// - `logits`: `[B, T, C]`
/// - `targets`: `[B, T]` class ids (u32)
///
/// Returns a scalar. A stream whose targets are all [`IGNORE_INDEX`]
/// contributes exactly 0.
pub fn cross_entropy_ignore_padding(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let classes = logits.dim(D::Minus1)?;
    let logits = logits.reshape(((), classes))?.to_dtype(DType::F32)?;
    let targets = targets.flatten_all()?.to_dtype(DType::U32)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(1)?.contiguous()?, 1)?
        .squeeze(1)?; // [N]

    let keep = targets.ne(IGNORE_INDEX)?.to_dtype(DType::F32)?;
    let total = (picked * &keep)?.sum_all()?.neg()?;
    let count = keep.sum_all()?.maximum(1f32)?;
    total / count
}

/// Sum of the token, duration and pitch losses.
pub fn stream_loss(
    logits: &StreamLogits,
    tokens: &Tensor,
    durations: &Tensor,
    pitches: &Tensor,
) -> Result<Tensor> {
    let token = cross_entropy_ignore_padding(&logits.token, tokens)?;
    let duration = cross_entropy_ignore_padding(&logits.duration, durations)?;
    let pitch = cross_entropy_ignore_padding(&logits.pitch, pitches)?;
    (token + duration)? + pitch
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar().unwrap()
    }

    #[test]
    fn all_padding_targets_yield_zero() {
        let dev = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (2, 3, 5), &dev).unwrap();
        let targets = Tensor::zeros((2, 3), DType::U32, &dev).unwrap();
        let loss = cross_entropy_ignore_padding(&logits, &targets).unwrap();
        assert_eq!(scalar(&loss), 0.0);
    }

    #[test]
    fn uniform_logits_give_log_classes() {
        let dev = Device::Cpu;
        let logits = Tensor::zeros((1, 4, 8), DType::F32, &dev).unwrap();
        let targets = Tensor::new(&[[1u32, 2, 3, 4]], &dev).unwrap();
        let loss = scalar(&cross_entropy_ignore_padding(&logits, &targets).unwrap());
        assert!((loss - 8f32.ln()).abs() < 1e-5, "loss = {loss}");
    }

    #[test]
    fn padded_positions_are_ignored() {
        let dev = Device::Cpu;
        // Position 1 has a terrible prediction for class 2 but target 0 (padding).
        let logits = Tensor::new(&[[[0f32, 10., -10.], [0., 10., -10.]]], &dev).unwrap();
        let with_pad = Tensor::new(&[[1u32, 0]], &dev).unwrap();
        let single = Tensor::new(&[[1u32]], &dev).unwrap();
        let a = scalar(&cross_entropy_ignore_padding(&logits, &with_pad).unwrap());
        let first = logits.narrow(1, 0, 1).unwrap();
        let b = scalar(&cross_entropy_ignore_padding(&first, &single).unwrap());
        assert!((a - b).abs() < 1e-6, "{a} vs {b}");
    }

    #[test]
    fn total_is_unweighted_sum() {
        let dev = Device::Cpu;
        let logits = StreamLogits {
            token: Tensor::zeros((1, 2, 4), DType::F32, &dev).unwrap(),
            duration: Tensor::zeros((1, 2, 6), DType::F32, &dev).unwrap(),
            pitch: Tensor::zeros((1, 2, 3), DType::F32, &dev).unwrap(),
        };
        let tokens = Tensor::new(&[[3u32, 1]], &dev).unwrap();
        let durations = Tensor::new(&[[2u32, 5]], &dev).unwrap();
        let pitches = Tensor::zeros((1, 2), DType::U32, &dev).unwrap();
        let loss = scalar(&stream_loss(&logits, &tokens, &durations, &pitches).unwrap());
        let expected = 4f32.ln() + 6f32.ln();
        assert!((loss - expected).abs() < 1e-5, "{loss} vs {expected}");
    }
}

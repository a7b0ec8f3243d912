//! Attention masks derived from per-sequence valid lengths.
//!
//! Masks are boolean `u8` tensors (1 = may attend, 0 = masked) and are
//! rebuilt on every forward call. [`to_additive`] turns them into the
//! additive bias consumed by attention: 0.0 for visible positions and the
//! dtype's minimum for masked ones.
//!
//! A length of 0 produces an all-masked row. The softmax over such a row is
//! meaningless; it does not fail, but callers must not rely on its value.

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Lengths equal to the padded width for every batch item.
pub fn full_lengths(batch: usize, width: usize) -> Vec<usize> {
    vec![width; batch]
}

fn check_lengths(lengths: &[usize], width: usize, what: &str) -> Result<()> {
    if let Some((b, &len)) = lengths.iter().enumerate().find(|&(_, &len)| len > width) {
        return Err(Error::Shape(format!(
            "{what} length {len} of batch item {b} exceeds padded width {width}"
        )));
    }
    Ok(())
}

/// Padding mask `[B, 1, 1, T]`: key `j` is visible iff `j < lengths[b]`.
pub fn padding_mask(lengths: &[usize], width: usize, device: &Device) -> Result<Tensor> {
    check_lengths(lengths, width, "sequence")?;
    let batch = lengths.len();
    let mut data = vec![0u8; batch * width];
    for (b, &len) in lengths.iter().enumerate() {
        data[b * width..b * width + len].fill(1);
    }
    Ok(Tensor::from_vec(data, (batch, 1, 1, width), device)?)
}

/// Causal padding mask `[B, 1, T, T]`: query `i` sees key `j` iff
/// `j <= i` and `j < lengths[b]`.
pub fn padding_causal_mask(lengths: &[usize], width: usize, device: &Device) -> Result<Tensor> {
    check_lengths(lengths, width, "sequence")?;
    let batch = lengths.len();
    let mut data = vec![0u8; batch * width * width];
    for (b, &len) in lengths.iter().enumerate() {
        for i in 0..width {
            let row = (b * width + i) * width;
            let visible = (i + 1).min(len);
            data[row..row + visible].fill(1);
        }
    }
    Ok(Tensor::from_vec(data, (batch, 1, width, width), device)?)
}

/// Rectangular cross mask `[B, 1, Tq, Tk]`: query `i` sees key `j` iff
/// `i < q_lengths[b]` and `j < k_lengths[b]`. No causal relation between
/// the two axes.
pub fn padding_rectangle_mask(
    q_lengths: &[usize],
    k_lengths: &[usize],
    q_width: usize,
    k_width: usize,
    device: &Device,
) -> Result<Tensor> {
    if q_lengths.len() != k_lengths.len() {
        return Err(Error::Shape(format!(
            "query lengths cover {} items but key lengths cover {}",
            q_lengths.len(),
            k_lengths.len()
        )));
    }
    check_lengths(q_lengths, q_width, "query")?;
    check_lengths(k_lengths, k_width, "key")?;
    let batch = q_lengths.len();
    let mut data = vec![0u8; batch * q_width * k_width];
    for (b, (&q_len, &k_len)) in q_lengths.iter().zip(k_lengths).enumerate() {
        for i in 0..q_len {
            let row = (b * q_width + i) * k_width;
            data[row..row + k_len].fill(1);
        }
    }
    Ok(Tensor::from_vec(data, (batch, 1, q_width, k_width), device)?)
}

/// Most negative finite value of `dtype`.
fn min_value(dtype: DType) -> f64 {
    match dtype {
        DType::F32 => f64::from(f32::MIN),
        DType::F16 => f64::from(half::f16::MIN),
        DType::BF16 => f64::from(half::bf16::MIN),
        DType::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

/// Convert a boolean mask into an additive attention bias of `dtype`.
pub fn to_additive(mask: &Tensor, dtype: DType) -> candle_core::Result<Tensor> {
    let min_val = min_value(dtype);
    // 1 → 0.0, 0 → min_val
    mask.to_dtype(dtype)?.affine(-min_val, min_val)
}

//! Multi-head scaled dot-product attention.
//!
//! Used both as self-attention (query and key/value from the same sequence)
//! and as cross-attention (query from outputs, key/value from encoder
//! latents). Masks and position biases arrive pre-combined as one additive
//! bias broadcastable to `[B, H, S_q, S_k]`.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

pub struct MultiHeadAttention {
    to_q: candle_nn::Linear,
    to_k: candle_nn::Linear,
    to_v: candle_nn::Linear,
    to_out: candle_nn::Linear,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    pub fn new(
        dim: usize,
        num_heads: usize,
        head_dim: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner_dim = num_heads * head_dim;
        let to_q = candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_q"))?;
        let to_k = candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_k"))?;
        let to_v = candle_nn::linear_no_bias(dim, inner_dim, vb.pp("to_v"))?;
        let to_out = candle_nn::linear_no_bias(inner_dim, dim, vb.pp("to_out"))?;
        Ok(Self {
            to_q,
            to_k,
            to_v,
            to_out,
            dropout: Dropout::new(dropout),
            num_heads,
            head_dim,
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, S_q, dim]`: queries
    /// - `context`: `[B, S_k, dim]`: keys and values
    /// - `bias`: additive, broadcastable to `[B, H, S_q, S_k]`
    ///
    /// Returns `[B, S_q, dim]`.
    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        context: &Tensor,
        bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq_q, _) = hidden_states.dims3()?;

        let q = self.split_heads(&self.to_q.forward(hidden_states)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? / scale)?; // [B, H, S_q, S_k]
        let scores = match bias {
            Some(bias) => scores.broadcast_add(&bias.to_dtype(scores.dtype())?)?,
            None => scores,
        };

        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let weights = self.dropout.forward_t(&weights, train)?;
        let out = weights.matmul(&v)?; // [B, H, S_q, D]

        let out = out
            .transpose(1, 2)?
            .reshape((batch, seq_q, self.num_heads * self.head_dim))?;
        self.to_out.forward(&out)
    }
}

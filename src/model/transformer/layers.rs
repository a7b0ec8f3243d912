//! Transformer block types.
//!
//! - [`EncoderLayer`]: pre-norm self-attention + feed-forward
//! - [`DecoderLayer`]: pre-norm self-attention + cross-attention + feed-forward

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Dropout, LayerNorm, VarBuilder};

use super::attention::MultiHeadAttention;
use crate::config::GptConfig;

const LAYER_NORM_EPS: f64 = 1e-5;

// ---------------------------------------------------------------------------
// Feed-forward
// ---------------------------------------------------------------------------

/// `Linear → GELU → Dropout → Linear`.
pub struct FeedForward {
    up: candle_nn::Linear,
    down: candle_nn::Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            up: candle_nn::linear(cfg.n_dim, cfg.n_dim_ffn, vb.pp("up"))?,
            down: candle_nn::linear(cfg.n_dim_ffn, cfg.n_dim, vb.pp("down"))?,
            dropout: Dropout::new(cfg.ffn_dropout),
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.up.forward(xs)?.gelu()?;
        let h = self.dropout.forward_t(&h, train)?;
        self.down.forward(&h)
    }
}

// ---------------------------------------------------------------------------
// Encoder Layer
// ---------------------------------------------------------------------------

/// Bidirectional encoder block.
pub struct EncoderLayer {
    attention_norm: LayerNorm,
    self_attn: MultiHeadAttention,
    ffn_norm: LayerNorm,
    ffn: FeedForward,
}

impl EncoderLayer {
    pub fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let norm = |name: &str| candle_nn::layer_norm(cfg.n_dim, LAYER_NORM_EPS, vb.pp(name));
        Ok(Self {
            attention_norm: norm("attention_norm")?,
            self_attn: MultiHeadAttention::new(
                cfg.n_dim,
                cfg.n_heads,
                cfg.n_dim_head,
                cfg.att_dropout,
                vb.pp("self_attn"),
            )?,
            ffn_norm: norm("ffn_norm")?,
            ffn: FeedForward::new(cfg, vb.pp("ffn"))?,
        })
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: [B, S, D]
    /// - `bias`: additive self-attention bias (padding mask + ALiBi), [B, H, S, S]
    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let h = self.attention_norm.forward(hidden_states)?;
        let h = self.self_attn.forward_t(&h, &h, bias, train)?;
        let h = (hidden_states + h)?;

        let residual = &h;
        let ff = self.ffn.forward_t(&self.ffn_norm.forward(&h)?, train)?;
        residual + ff
    }
}

// ---------------------------------------------------------------------------
// Decoder Layer
// ---------------------------------------------------------------------------

/// Decoder block: causal self-attention over outputs, then cross-attention
/// from outputs to encoder latents, then feed-forward.
pub struct DecoderLayer {
    self_attn_norm: LayerNorm,
    self_attn: MultiHeadAttention,
    cross_attn_norm: LayerNorm,
    cross_attn: MultiHeadAttention,
    ffn_norm: LayerNorm,
    ffn: FeedForward,
}

impl DecoderLayer {
    pub fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let attention = |name: &str| {
            MultiHeadAttention::new(
                cfg.n_dim,
                cfg.n_heads,
                cfg.n_dim_head,
                cfg.att_dropout,
                vb.pp(name),
            )
        };
        let norm = |name: &str| candle_nn::layer_norm(cfg.n_dim, LAYER_NORM_EPS, vb.pp(name));
        Ok(Self {
            self_attn_norm: norm("self_attn_norm")?,
            self_attn: attention("self_attn")?,
            cross_attn_norm: norm("cross_attn_norm")?,
            cross_attn: attention("cross_attn")?,
            ffn_norm: norm("ffn_norm")?,
            ffn: FeedForward::new(cfg, vb.pp("ffn"))?,
        })
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: [B, S_out, D]
    /// - `latents`: [B, S_in, D] from the encoder
    /// - `self_bias`: causal padding mask + ALiBi, [B, H, S_out, S_out]
    /// - `cross_bias`: rectangular mask, [B, 1, S_out, S_in]
    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        latents: &Tensor,
        self_bias: Option<&Tensor>,
        cross_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let h = self.self_attn_norm.forward(hidden_states)?;
        let h = self.self_attn.forward_t(&h, &h, self_bias, train)?;
        let h = (hidden_states + h)?;

        let q = self.cross_attn_norm.forward(&h)?;
        let cross = self.cross_attn.forward_t(&q, latents, cross_bias, train)?;
        let h = (&h + cross)?;

        let ff = self.ffn.forward_t(&self.ffn_norm.forward(&h)?, train)?;
        &h + ff
    }
}

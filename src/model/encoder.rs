//! Text encoder: bidirectional self-attention stack over embedded input ids.
//!
//! Positions are encoded only through the ALiBi bias; there is no absolute
//! position embedding.

use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, VarBuilder};

use super::mask::to_additive;
use super::transformer::alibi::Alibi;
use super::transformer::layers::EncoderLayer;
use crate::config::GptConfig;

pub struct Encoder {
    layers: Vec<EncoderLayer>,
    norm: LayerNorm,
    alibi: Alibi,
}

impl Encoder {
    pub fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            layers.push(EncoderLayer::new(cfg, vb.pp(format!("layers.{i}")))?);
        }
        Ok(Self {
            layers,
            norm: candle_nn::layer_norm(cfg.n_dim, 1e-5, vb.pp("norm"))?,
            alibi: Alibi::new(cfg.n_heads),
        })
    }

    /// Forward pass.
    ///
    /// - `embedded`: [B, S, D]
    /// - `mask`: optional padding mask [B, 1, 1, S] from [`super::mask::padding_mask`]
    ///
    /// Returns latents [B, S, D].
    pub fn forward_t(
        &self,
        embedded: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let seq_len = embedded.dim(1)?;
        let dtype = embedded.dtype();
        let bias = self.alibi.bias(seq_len, seq_len, dtype, embedded.device())?;
        let bias = match mask {
            Some(mask) => bias.broadcast_add(&to_additive(mask, dtype)?)?,
            None => bias,
        };

        let mut h = embedded.clone();
        for layer in &self.layers {
            h = layer.forward_t(&h, Some(&bias), train)?;
        }
        self.norm.forward(&h)
    }
}

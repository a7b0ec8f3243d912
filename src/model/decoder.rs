//! Output decoder: causal self-attention over the output history plus
//! cross-attention into the encoder latents.

use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, VarBuilder};

use super::mask::to_additive;
use super::transformer::alibi::Alibi;
use super::transformer::layers::DecoderLayer;
use crate::config::GptConfig;

/// Masks consumed by [`Decoder::forward_t`], all boolean (1 = visible).
///
/// `latent_mask` and `cross_mask` are independent inputs; the cross-attention
/// bias is their intersection.
#[derive(Default, Clone, Copy)]
pub struct DecoderMasks<'a> {
    /// Padding mask over the latents, [B, 1, 1, S_in].
    pub latent_mask: Option<&'a Tensor>,
    /// Causal padding mask over the outputs, [B, 1, S_out, S_out].
    pub output_mask: Option<&'a Tensor>,
    /// Rectangular output→input mask, [B, 1, S_out, S_in].
    pub cross_mask: Option<&'a Tensor>,
}

pub struct Decoder {
    layers: Vec<DecoderLayer>,
    norm: LayerNorm,
    alibi: Alibi,
}

impl Decoder {
    pub fn new(cfg: &GptConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(cfg.n_layers);
        for i in 0..cfg.n_layers {
            layers.push(DecoderLayer::new(cfg, vb.pp(format!("layers.{i}")))?);
        }
        Ok(Self {
            layers,
            norm: candle_nn::layer_norm(cfg.n_dim, 1e-5, vb.pp("norm"))?,
            alibi: Alibi::new(cfg.n_heads),
        })
    }

    /// Forward pass.
    ///
    /// - `latents`: [B, S_in, D] encoder output
    /// - `embedded`: [B, S_out, D] summed output embeddings
    ///
    /// Returns [B, S_out, D].
    pub fn forward_t(
        &self,
        latents: &Tensor,
        embedded: &Tensor,
        masks: DecoderMasks<'_>,
        train: bool,
    ) -> Result<Tensor> {
        let seq_out = embedded.dim(1)?;
        let dtype = embedded.dtype();

        let self_bias = self.alibi.bias(seq_out, seq_out, dtype, embedded.device())?;
        let self_bias = match masks.output_mask {
            Some(mask) => self_bias.broadcast_add(&to_additive(mask, dtype)?)?,
            None => self_bias,
        };

        let cross_visible = match (masks.cross_mask, masks.latent_mask) {
            (Some(cross), Some(latent)) => Some(cross.broadcast_mul(latent)?),
            (Some(cross), None) => Some(cross.clone()),
            (None, Some(latent)) => Some(latent.clone()),
            (None, None) => None,
        };
        let cross_bias = cross_visible
            .map(|visible| to_additive(&visible, dtype))
            .transpose()?;

        let mut h = embedded.clone();
        for layer in &self.layers {
            h = layer.forward_t(&h, latents, Some(&self_bias), cross_bias.as_ref(), train)?;
        }
        self.norm.forward(&h)
    }
}

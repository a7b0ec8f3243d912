//! Encoder-decoder model predicting (token, duration, pitch) triples.
//!
//! ```text
//! input ids ──embed──► Encoder ──► latents ──┐
//!                                            ├─► Decoder ──► heads ──► 3 × logits
//! output history ──embed(tok)+embed(dur)+embed(pitch)
//! ```
//!
//! Masks are rebuilt from the length vectors on every call.

use std::path::Path;

use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;

use super::decoder::{Decoder, DecoderMasks};
use super::embedding::{OutputStreams, StreamLogits, input_embedding};
use super::encoder::Encoder;
use super::loss::stream_loss;
use super::mask::{full_lengths, padding_causal_mask, padding_mask, padding_rectangle_mask};
use crate::config::GptConfig;
use crate::{Error, Result};

/// Target streams for the loss, each `[B, T_out]`.
#[derive(Debug, Clone, Copy)]
pub struct Targets<'a> {
    pub tokens: &'a Tensor,
    pub durations: &'a Tensor,
    pub pitches: &'a Tensor,
}

/// Arguments of [`SupervoiceGpt::forward`].
///
/// Defaults: lengths absent → every sequence uses the full padded width;
/// targets absent → no loss.
#[derive(Debug, Clone, Copy)]
pub struct ForwardInput<'a> {
    /// `[B, T_in]` input ids.
    pub input: &'a Tensor,
    pub input_lengths: Option<&'a [usize]>,
    /// `[B, T_out]` output token ids.
    pub output_tokens: &'a Tensor,
    /// `[B, T_out]` shifted duration ids.
    pub output_durations: &'a Tensor,
    /// `[B, T_out]` shifted pitch ids.
    pub output_pitches: &'a Tensor,
    pub output_lengths: Option<&'a [usize]>,
    pub targets: Option<Targets<'a>>,
}

impl<'a> ForwardInput<'a> {
    pub fn new(
        input: &'a Tensor,
        output_tokens: &'a Tensor,
        output_durations: &'a Tensor,
        output_pitches: &'a Tensor,
    ) -> Self {
        Self {
            input,
            input_lengths: None,
            output_tokens,
            output_durations,
            output_pitches,
            output_lengths: None,
            targets: None,
        }
    }

    pub fn with_input_lengths(mut self, lengths: &'a [usize]) -> Self {
        self.input_lengths = Some(lengths);
        self
    }

    pub fn with_output_lengths(mut self, lengths: &'a [usize]) -> Self {
        self.output_lengths = Some(lengths);
        self
    }

    pub fn with_targets(mut self, targets: Targets<'a>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Check ranks and shapes; returns `(batch, t_in, t_out)`.
    fn validate(&self) -> Result<(usize, usize, usize)> {
        let rank2 = |t: &Tensor, name: &str| -> Result<(usize, usize)> {
            t.dims2().map_err(|_| {
                Error::Shape(format!(
                    "{name} tensor shape should be [batch_size, sequence_length], got {:?}",
                    t.dims()
                ))
            })
        };
        let (batch, t_in) = rank2(self.input, "input")?;
        let (out_batch, t_out) = rank2(self.output_tokens, "output token")?;
        let durations = rank2(self.output_durations, "output duration")?;
        let pitches = rank2(self.output_pitches, "output pitch")?;

        if batch != out_batch {
            return Err(Error::Shape(format!(
                "input and output batch size should be the same, got {batch} and {out_batch}"
            )));
        }
        for (name, dims) in [("duration", durations), ("pitch", pitches)] {
            if dims != (out_batch, t_out) {
                return Err(Error::Shape(format!(
                    "output {name} shape {dims:?} does not match output token shape {:?}",
                    (out_batch, t_out)
                )));
            }
        }
        for (name, lengths) in [
            ("input", self.input_lengths),
            ("output", self.output_lengths),
        ] {
            if let Some(lengths) = lengths
                && lengths.len() != batch
            {
                return Err(Error::Shape(format!(
                    "{name} lengths cover {} items but batch size is {batch}",
                    lengths.len()
                )));
            }
        }
        if let Some(targets) = self.targets {
            for (name, t) in [
                ("token", targets.tokens),
                ("duration", targets.durations),
                ("pitch", targets.pitches),
            ] {
                if t.dims() != [batch, t_out] {
                    return Err(Error::Shape(format!(
                        "target {name} shape {:?} does not match output shape {:?}",
                        t.dims(),
                        (batch, t_out)
                    )));
                }
            }
        }
        Ok((batch, t_in, t_out))
    }
}

/// Result of [`SupervoiceGpt::forward`].
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    pub logits: StreamLogits,
    /// Scalar loss, present only when targets were supplied.
    pub loss: Option<Tensor>,
}

/// The phoneme GPT.
pub struct SupervoiceGpt {
    config: GptConfig,
    input_embedding: candle_nn::Embedding,
    streams: OutputStreams,
    encoder: Encoder,
    decoder: Decoder,
}

impl SupervoiceGpt {
    /// Build the model under `vb`. With a `VarMap`-backed builder every
    /// embedding table starts from N(0, 0.02).
    pub fn new(config: &GptConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let input_embedding =
            input_embedding(config.n_input_tokens, config.n_dim, vb.pp("input_embedding"))?;
        let streams = OutputStreams::new(
            config.n_output_tokens,
            config.n_durations(),
            config.n_pitches(),
            config.n_dim,
            vb.clone(),
        )?;
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;
        Ok(Self {
            config: config.clone(),
            input_embedding,
            streams,
            encoder,
            decoder,
        })
    }

    /// Load weights from a safetensors file.
    pub fn load(
        weights_path: &Path,
        config: &GptConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        tracing::info!("Loading model weights from {:?}", weights_path);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)
                .map_err(|e| Error::WeightLoad(format!("{e}")))?
        };
        let model = Self::new(config, vb).map_err(|e| match e {
            Error::Candle(e) => Error::WeightLoad(format!("model init: {e}")),
            other => other,
        })?;
        tracing::info!(
            layers = config.n_layers,
            dim = config.n_dim,
            "model loaded successfully"
        );
        Ok(model)
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    /// Output streams (embedding tables tied to the prediction heads).
    pub fn streams(&self) -> &OutputStreams {
        &self.streams
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        self.input_embedding.embeddings().device()
    }

    /// Parameter dtype.
    pub fn dtype(&self) -> DType {
        self.input_embedding.embeddings().dtype()
    }

    /// Inference forward pass (dropout disabled).
    pub fn forward(&self, input: &ForwardInput<'_>) -> Result<ForwardOutput> {
        self.forward_t(input, false)
    }

    /// Forward pass; `train` enables feed-forward dropout.
    pub fn forward_t(&self, input: &ForwardInput<'_>, train: bool) -> Result<ForwardOutput> {
        let (batch, t_in, t_out) = input.validate()?;
        let device = self.device();

        let input_lengths = input
            .input_lengths
            .map(<[usize]>::to_vec)
            .unwrap_or_else(|| full_lengths(batch, t_in));
        let output_lengths = input
            .output_lengths
            .map(<[usize]>::to_vec)
            .unwrap_or_else(|| full_lengths(batch, t_out));

        let input_mask = padding_mask(&input_lengths, t_in, device)?;
        let output_mask = padding_causal_mask(&output_lengths, t_out, device)?;
        let cross_mask =
            padding_rectangle_mask(&output_lengths, &input_lengths, t_out, t_in, device)?;

        let input_embedded = self.input_embedding.forward(input.input)?;
        let output_embedded = self.streams.embed(
            input.output_tokens,
            input.output_durations,
            input.output_pitches,
        )?;

        let latents = self
            .encoder
            .forward_t(&input_embedded, Some(&input_mask), train)?;
        let masks = DecoderMasks {
            latent_mask: Some(&input_mask),
            output_mask: Some(&output_mask),
            cross_mask: Some(&cross_mask),
        };
        let decoded = self
            .decoder
            .forward_t(&latents, &output_embedded, masks, train)?;

        let logits = self.streams.project(&decoded)?;
        let loss = input
            .targets
            .map(|t| stream_loss(&logits, t.tokens, t.durations, t.pitches))
            .transpose()?;

        Ok(ForwardOutput { logits, loss })
    }

    /// Encoder-only pass over a single unbatched sequence.
    ///
    /// - `input_ids`: `[T]`
    ///
    /// Returns latents `[T, n_dim]`.
    pub fn encode(&self, input_ids: &Tensor) -> Result<Tensor> {
        let len = input_ids.dims1().map_err(|_| {
            Error::Shape(format!(
                "encode expects a [sequence_length] tensor, got {:?}",
                input_ids.dims()
            ))
        })?;
        tracing::debug!(len, "encoding text");
        let embedded = self.input_embedding.forward(&input_ids.unsqueeze(0)?)?;
        let latents = self.encoder.forward_t(&embedded, None, false)?;
        Ok(latents.i(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny_config() -> GptConfig {
        GptConfig {
            n_input_tokens: 12,
            n_output_tokens: 9,
            max_duration: 6,
            n_pitch_tokens: 5,
            n_dim: 16,
            n_heads: 2,
            n_dim_head: 8,
            n_dim_ffn: 32,
            n_layers: 2,
            ..GptConfig::default()
        }
    }

    fn tiny_model(dev: &Device) -> (VarMap, SupervoiceGpt) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        let model = SupervoiceGpt::new(&tiny_config(), vb).unwrap();
        (varmap, model)
    }

    fn ids(data: &[&[u32]], dev: &Device) -> Tensor {
        let rows = data.len();
        let cols = data[0].len();
        let flat: Vec<u32> = data.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows, cols), dev).unwrap()
    }

    #[test]
    fn forward_shapes_without_targets() {
        let dev = Device::Cpu;
        let (_varmap, model) = tiny_model(&dev);
        let input = ids(&[&[0, 3, 4, 5, 1], &[0, 6, 1, 0, 0]], &dev);
        let tokens = ids(&[&[0, 3, 4], &[0, 5, 0]], &dev);
        let durations = ids(&[&[0, 2, 3], &[0, 1, 0]], &dev);
        let pitches = ids(&[&[0, 1, 2], &[0, 4, 0]], &dev);

        let fwd = ForwardInput::new(&input, &tokens, &durations, &pitches)
            .with_input_lengths(&[5, 3])
            .with_output_lengths(&[3, 2]);
        let out = model.forward(&fwd).unwrap();
        assert_eq!(out.logits.token.dims(), &[2, 3, 9]);
        assert_eq!(out.logits.duration.dims(), &[2, 3, 8]);
        assert_eq!(out.logits.pitch.dims(), &[2, 3, 6]);
        assert!(out.loss.is_none());
    }

    #[test]
    fn forward_with_targets_returns_scalar_loss() {
        let dev = Device::Cpu;
        let (_varmap, model) = tiny_model(&dev);
        let input = ids(&[&[0, 3, 4, 1]], &dev);
        let tokens = ids(&[&[0, 3, 4]], &dev);
        let durations = ids(&[&[0, 2, 3]], &dev);
        let pitches = ids(&[&[0, 1, 2]], &dev);
        let target_tokens = ids(&[&[3, 4, 1]], &dev);
        let target_durations = ids(&[&[2, 3, 1]], &dev);
        let target_pitches = ids(&[&[1, 2, 1]], &dev);

        let fwd = ForwardInput::new(&input, &tokens, &durations, &pitches).with_targets(Targets {
            tokens: &target_tokens,
            durations: &target_durations,
            pitches: &target_pitches,
        });
        let loss = model.forward(&fwd).unwrap().loss.unwrap();
        assert!(loss.dims().is_empty());
        let loss: f32 = loss.to_scalar().unwrap();
        assert!(loss.is_finite() && loss > 0.0, "loss = {loss}");
    }

    #[test]
    fn all_padding_targets_give_zero_loss() {
        let dev = Device::Cpu;
        let (_varmap, model) = tiny_model(&dev);
        let input = ids(&[&[0, 3, 1]], &dev);
        let tokens = ids(&[&[0, 3]], &dev);
        let zeros = Tensor::zeros((1, 2), DType::U32, &dev).unwrap();

        let fwd = ForwardInput::new(&input, &tokens, &zeros, &zeros).with_targets(Targets {
            tokens: &zeros,
            durations: &zeros,
            pitches: &zeros,
        });
        let loss = model.forward(&fwd).unwrap().loss.unwrap();
        let loss: f32 = loss.to_scalar().unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn shape_violations_fail_fast() {
        let dev = Device::Cpu;
        let (_varmap, model) = tiny_model(&dev);
        let input = ids(&[&[0, 3, 1]], &dev);
        let two_rows = ids(&[&[0, 3], &[0, 4]], &dev);
        let one_row = ids(&[&[0, 3]], &dev);
        let longer = ids(&[&[0, 3, 4]], &dev);
        let flat = Tensor::new(&[0u32, 3], &dev).unwrap();

        // Batch mismatch between input and outputs.
        let fwd = ForwardInput::new(&input, &two_rows, &two_rows, &two_rows);
        assert!(matches!(model.forward(&fwd), Err(Error::Shape(_))));
        // Output streams with different time lengths.
        let fwd = ForwardInput::new(&input, &one_row, &longer, &one_row);
        assert!(matches!(model.forward(&fwd), Err(Error::Shape(_))));
        // Wrong rank.
        let fwd = ForwardInput::new(&flat, &one_row, &one_row, &one_row);
        assert!(matches!(model.forward(&fwd), Err(Error::Shape(_))));
        // Length vector longer than the padded width.
        let fwd =
            ForwardInput::new(&input, &one_row, &one_row, &one_row).with_output_lengths(&[3]);
        assert!(matches!(model.forward(&fwd), Err(Error::Shape(_))));
        // Length vector with the wrong number of items.
        let fwd =
            ForwardInput::new(&input, &one_row, &one_row, &one_row).with_input_lengths(&[3, 3]);
        assert!(matches!(model.forward(&fwd), Err(Error::Shape(_))));
    }

    #[test]
    fn padded_outputs_do_not_change_valid_logits() {
        let dev = Device::Cpu;
        let (_varmap, model) = tiny_model(&dev);
        let input = ids(&[&[0, 3, 4, 1]], &dev);
        let short = ids(&[&[0, 3]], &dev);
        let padded = ids(&[&[0, 3, 5]], &dev);

        let a = model
            .forward(&ForwardInput::new(&input, &short, &short, &short))
            .unwrap();
        let b = model
            .forward(
                &ForwardInput::new(&input, &padded, &padded, &padded).with_output_lengths(&[2]),
            )
            .unwrap();
        let a = a.logits.token;
        let b = b.logits.token.narrow(1, 0, 2).unwrap();
        let diff: f32 = (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "diff = {diff}");
    }

    #[test]
    fn encode_returns_unbatched_latents() {
        let dev = Device::Cpu;
        let (_varmap, model) = tiny_model(&dev);
        let input = Tensor::new(&[0u32, 3, 4, 5, 1], &dev).unwrap();
        let latents = model.encode(&input).unwrap();
        assert_eq!(latents.dims(), &[5, 16]);
        assert!(matches!(model.encode(&input.unsqueeze(0).unwrap()), Err(Error::Shape(_))));
    }

    #[test]
    fn token_head_is_tied_to_token_embedding() {
        let dev = Device::Cpu;
        let (varmap, model) = tiny_model(&dev);
        {
            let data = varmap.data().lock().unwrap();
            let var = data.get("prediction_head_token.weight").unwrap();
            let zeros = Tensor::zeros((9, 16), DType::F32, &dev).unwrap();
            var.set(&zeros).unwrap();
        }
        let table: Vec<Vec<f32>> = model.streams().token.embedding_table().to_vec2().unwrap();
        assert!(table.iter().flatten().all(|&v| v == 0.0));

        // With a zero head every token logit is zero.
        let input = ids(&[&[0, 3, 1]], &dev);
        let out = ids(&[&[0, 3]], &dev);
        let logits = model
            .forward(&ForwardInput::new(&input, &out, &out, &out))
            .unwrap()
            .logits
            .token;
        let max: f32 = logits
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(max, 0.0);
    }
}

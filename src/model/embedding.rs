//! Embedding tables.
//!
//! One plain table for input ids and three output tables (token, duration,
//! pitch). Each output table is the very same tensor as the matching
//! prediction head's projection matrix: [`TiedEmbedding`] holds one weight
//! and hands clones of that handle (shared storage, no copy) to both the
//! lookup and the projection, so an in-place update through either path is
//! seen by the other.
//!
//! Duration and pitch ids are the raw value plus one; id 0 is the padding
//! sentinel.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Initializer for every embedding table.
pub const EMBEDDING_INIT: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.02,
};

/// Raw duration/pitch value → embedding id.
pub fn shift_value(raw: u32) -> u32 {
    raw + 1
}

/// Sampled duration/pitch id → raw value. Id 0 is the sentinel and is never sampled.
pub fn unshift_id(id: u32) -> u32 {
    id.saturating_sub(1)
}

/// Input id lookup table.
pub fn input_embedding(
    vocab_size: usize,
    dim: usize,
    vb: VarBuilder,
) -> Result<candle_nn::Embedding> {
    let weight = vb.get_with_hints((vocab_size, dim), "weight", EMBEDDING_INIT)?;
    Ok(candle_nn::Embedding::new(weight, dim))
}

/// Embedding table shared with a bias-free output projection.
#[derive(Debug, Clone)]
pub struct TiedEmbedding {
    weight: Tensor,
    embedding: candle_nn::Embedding,
    projection: candle_nn::Linear,
}

impl TiedEmbedding {
    /// Create (or load) the `[vocab_size, dim]` weight under `vb`.
    pub fn new(vocab_size: usize, dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((vocab_size, dim), "weight", EMBEDDING_INIT)?;
        Self::from_weight(weight)
    }

    pub fn from_weight(weight: Tensor) -> Result<Self> {
        let (_, dim) = weight.dims2()?;
        Ok(Self {
            embedding: candle_nn::Embedding::new(weight.clone(), dim),
            projection: candle_nn::Linear::new(weight.clone(), None),
            weight,
        })
    }

    /// The shared parameter.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// The lookup table (same storage as [`Self::projection_weight`]).
    pub fn embedding_table(&self) -> &Tensor {
        self.embedding.embeddings()
    }

    /// The head's projection matrix (same storage as [`Self::embedding_table`]).
    pub fn projection_weight(&self) -> &Tensor {
        self.projection.weight()
    }

    /// `[..] ids → [.., dim]`
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        self.embedding.forward(ids)
    }

    /// `[.., dim] → [.., vocab_size]` logits.
    pub fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        self.projection.forward(hidden)
    }
}

/// The three tied output streams.
#[derive(Debug, Clone)]
pub struct OutputStreams {
    pub token: TiedEmbedding,
    pub duration: TiedEmbedding,
    pub pitch: TiedEmbedding,
}

/// Logits for the three streams, each `[B, T, vocab]`.
#[derive(Debug, Clone)]
pub struct StreamLogits {
    pub token: Tensor,
    pub duration: Tensor,
    pub pitch: Tensor,
}

impl OutputStreams {
    pub fn new(
        n_tokens: usize,
        n_durations: usize,
        n_pitches: usize,
        dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            token: TiedEmbedding::new(n_tokens, dim, vb.pp("prediction_head_token"))?,
            duration: TiedEmbedding::new(n_durations, dim, vb.pp("prediction_head_duration"))?,
            pitch: TiedEmbedding::new(n_pitches, dim, vb.pp("prediction_head_pitch"))?,
        })
    }

    /// Elementwise sum of the three lookups, `[B, T, dim]`.
    pub fn embed(&self, tokens: &Tensor, durations: &Tensor, pitches: &Tensor) -> Result<Tensor> {
        let h = self.token.embed(tokens)?;
        let h = (h + self.duration.embed(durations)?)?;
        h + self.pitch.embed(pitches)?
    }

    /// Prediction heads.
    pub fn project(&self, decoded: &Tensor) -> Result<StreamLogits> {
        Ok(StreamLogits {
            token: self.token.project(decoded)?,
            duration: self.duration.project(decoded)?,
            pitch: self.pitch.project(decoded)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn sum_all(t: &Tensor) -> f32 {
        t.sum_all().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn init_has_small_std() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let tied = TiedEmbedding::new(200, 64, vb.pp("t")).unwrap();
        let w = tied.weight();
        let n = w.elem_count() as f32;
        let mean = sum_all(w) / n;
        let var = sum_all(&w.sqr().unwrap()) / n - mean * mean;
        assert!(mean.abs() < 0.005, "mean = {mean}");
        assert!((var.sqrt() - 0.02).abs() < 0.003, "std = {}", var.sqrt());
    }

    #[test]
    fn head_mutation_is_visible_through_embedding() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let tied = TiedEmbedding::new(5, 4, vb.pp("prediction_head_token")).unwrap();

        // Overwrite the parameter in place through the optimiser-facing Var.
        let replacement = Tensor::arange(0f32, 20., &dev)
            .unwrap()
            .reshape((5, 4))
            .unwrap();
        {
            let data = varmap.data().lock().unwrap();
            let var = data.get("prediction_head_token.weight").unwrap();
            var.set(&replacement).unwrap();
        }

        let ids = Tensor::new(&[2u32], &dev).unwrap();
        let row: Vec<Vec<f32>> = tied.embed(&ids).unwrap().to_vec2().unwrap();
        assert_eq!(row[0], vec![8., 9., 10., 11.]);

        let table: Vec<Vec<f32>> = tied.embedding_table().to_vec2().unwrap();
        let head: Vec<Vec<f32>> = tied.projection_weight().to_vec2().unwrap();
        assert_eq!(table, head);

        // x = e_0 projects onto column 0 of every row.
        let x = Tensor::new(&[[1f32, 0., 0., 0.]], &dev).unwrap();
        let logits: Vec<Vec<f32>> = tied.project(&x).unwrap().to_vec2().unwrap();
        assert_eq!(logits[0], vec![0., 4., 8., 12., 16.]);
    }

    #[test]
    fn embedding_mutation_is_visible_through_head() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let tied = TiedEmbedding::new(3, 2, vb.pp("head")).unwrap();

        let before: Vec<Vec<f32>> = tied.projection_weight().to_vec2().unwrap();
        {
            let data = varmap.data().lock().unwrap();
            let var = data.get("head.weight").unwrap();
            let ones = Tensor::ones((3, 2), DType::F32, &dev).unwrap();
            var.set(&ones).unwrap();
        }
        let after: Vec<Vec<f32>> = tied.projection_weight().to_vec2().unwrap();
        assert_ne!(before, after);
        assert_eq!(after, vec![vec![1f32; 2]; 3]);
        let table: Vec<Vec<f32>> = tied.embedding_table().to_vec2().unwrap();
        assert_eq!(table, after);
    }

    #[test]
    fn output_embedding_is_sum_of_streams() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let streams = OutputStreams::new(6, 5, 4, 8, vb).unwrap();

        let tokens = Tensor::new(&[[3u32, 4]], &dev).unwrap();
        let durations = Tensor::new(&[[1u32, 2]], &dev).unwrap();
        let pitches = Tensor::new(&[[0u32, 3]], &dev).unwrap();
        let summed = streams.embed(&tokens, &durations, &pitches).unwrap();
        assert_eq!(summed.dims(), &[1, 2, 8]);

        let manual = ((streams.token.embed(&tokens).unwrap()
            + streams.duration.embed(&durations).unwrap())
        .unwrap()
            + streams.pitch.embed(&pitches).unwrap())
        .unwrap();
        let diff = sum_all(&(summed - manual).unwrap().abs().unwrap());
        assert!(diff < 1e-6);
    }

    #[test]
    fn shift_roundtrip() {
        for d in [0u32, 1, 7, 100] {
            assert_eq!(shift_value(d), d + 1);
            assert_eq!(unshift_id(shift_value(d)), d);
        }
    }
}

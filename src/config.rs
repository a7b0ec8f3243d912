//! Model hyperparameters.
//!
//! Read once at construction. Defaults describe the deployed checkpoint; a
//! `config.json` may override any subset of fields.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of ids reserved for special tokens (`<bos>`, `<eos>`, `<sil>`).
pub const NUM_SPECIAL_TOKENS: u32 = 3;

/// Hyperparameters of the phoneme GPT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    /// Input (text) vocabulary size.
    #[serde(default = "default_n_input_tokens")]
    pub n_input_tokens: usize,

    /// Output (phoneme) vocabulary size, special tokens included.
    #[serde(default = "default_n_output_tokens")]
    pub n_output_tokens: usize,

    /// Largest raw duration value (in frames) the model can emit.
    #[serde(default = "default_max_duration")]
    pub max_duration: usize,

    /// Number of pitch buckets.
    #[serde(default = "default_n_pitch_tokens")]
    pub n_pitch_tokens: usize,

    /// Transformer width.
    #[serde(default = "default_n_dim")]
    pub n_dim: usize,

    /// Number of attention heads.
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,

    /// Width of a single attention head.
    #[serde(default = "default_n_dim_head")]
    pub n_dim_head: usize,

    /// Feed-forward hidden width.
    #[serde(default = "default_n_dim_ffn")]
    pub n_dim_ffn: usize,

    /// Blocks per stack (encoder and decoder each).
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,

    /// Dropout on attention probabilities.
    #[serde(default = "default_att_dropout")]
    pub att_dropout: f32,

    /// Dropout inside the feed-forward sublayer.
    #[serde(default = "default_ffn_dropout")]
    pub ffn_dropout: f32,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            n_input_tokens: default_n_input_tokens(),
            n_output_tokens: default_n_output_tokens(),
            max_duration: default_max_duration(),
            n_pitch_tokens: default_n_pitch_tokens(),
            n_dim: default_n_dim(),
            n_heads: default_n_heads(),
            n_dim_head: default_n_dim_head(),
            n_dim_ffn: default_n_dim_ffn(),
            n_layers: default_n_layers(),
            att_dropout: default_att_dropout(),
            ffn_dropout: default_ffn_dropout(),
        }
    }
}

impl GptConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Duration classes: `0..=max_duration` shifted by one, plus the padding sentinel.
    pub fn n_durations(&self) -> usize {
        (self.max_duration + 1) + 1
    }

    /// Pitch classes: every bucket plus the padding sentinel.
    pub fn n_pitches(&self) -> usize {
        self.n_pitch_tokens + 1
    }

    /// Reject configurations the model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("n_input_tokens", self.n_input_tokens),
            ("n_dim", self.n_dim),
            ("n_heads", self.n_heads),
            ("n_dim_head", self.n_dim_head),
            ("n_dim_ffn", self.n_dim_ffn),
            ("n_layers", self.n_layers),
            ("n_pitch_tokens", self.n_pitch_tokens),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }
        if self.n_output_tokens <= NUM_SPECIAL_TOKENS as usize {
            return Err(Error::Config(format!(
                "n_output_tokens must exceed the {NUM_SPECIAL_TOKENS} reserved ids, got {}",
                self.n_output_tokens
            )));
        }
        for (name, p) in [
            ("att_dropout", self.att_dropout),
            ("ffn_dropout", self.ffn_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Config(format!("{name} must be in [0, 1), got {p}")));
            }
        }
        Ok(())
    }
}

fn default_n_input_tokens() -> usize {
    4096
}
fn default_n_output_tokens() -> usize {
    128
}
fn default_max_duration() -> usize {
    100
}
fn default_n_pitch_tokens() -> usize {
    256
}
fn default_n_dim() -> usize {
    512
}
fn default_n_heads() -> usize {
    8
}
fn default_n_dim_head() -> usize {
    64
}
fn default_n_dim_ffn() -> usize {
    2048
}
fn default_n_layers() -> usize {
    12
}
fn default_att_dropout() -> f32 {
    0.0
}
fn default_ffn_dropout() -> f32 {
    0.1
}

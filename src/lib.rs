//! Phoneme sequence generation with duration and pitch, in pure Rust.
//!
//! A candle-based encoder-decoder transformer that reads text and writes a
//! sequence of `(phoneme, duration, pitch)` triples, one triple per decode
//! step. Loads safetensors weights directly.
//!
//! ## Architecture
//!
//! ```text
//! text ids → embedding → Encoder (ALiBi self-attention) ──┐ latents
//!                                                          ↓
//! (token, duration, pitch) history → Σ tied embeddings → Decoder
//!                                    (causal ALiBi self-attention + cross-attention)
//!                                                          ↓
//!                              tied heads → token / duration / pitch logits
//! ```
//!
//! ## Modules
//!
//! - [`config`]: hyperparameters ([`GptConfig`])
//! - [`model`]: masks, transformer, loss, generation
//! - [`tokenizer`]: text and phoneme vocabularies

pub mod config;
pub mod model;
pub mod tokenizer;

mod error;

pub use config::GptConfig;
pub use error::{Error, Result};
pub use model::{Conditioning, GenerateOptions, GenerationOutput, SupervoiceGpt};
pub use tokenizer::{PhonemeTokenizer, PretrainedTokenizer, Vocabulary};

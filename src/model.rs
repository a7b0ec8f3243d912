//! Model components for the phoneme GPT.
//!
//! ## Components
//!
//! - [`mask`]: boolean padding, causal and cross masks
//! - [`transformer`]: ALiBi, multi-head attention, encoder/decoder blocks
//! - [`embedding`]: input embedding and the tied output stream tables
//! - [`encoder`] / [`decoder`]: the two transformer stacks
//! - [`gpt`]: [`SupervoiceGpt`], the full forward pass and `encode`
//! - [`loss`]: padding-aware cross-entropy over the three streams
//! - [`sampling`] / [`generation`]: decoding loop, `generate` and `predict_next`

pub mod decoder;
pub mod embedding;
pub mod encoder;
pub mod generation;
pub mod gpt;
pub mod loss;
pub mod mask;
pub mod sampling;
pub mod transformer;

pub use generation::{
    Conditioning, GenerateOptions, GenerationOutput, Generator, PhonemeTriple, StepModel,
};
pub use gpt::{ForwardInput, ForwardOutput, SupervoiceGpt, Targets};

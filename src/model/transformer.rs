//! Transformer primitives shared by the encoder and decoder stacks.
//!
//! - [`attention`]: multi-head scaled dot-product attention (self and cross)
//! - [`alibi`]: ALiBi relative position bias for self-attention
//! - [`layers`]: pre-norm encoder and decoder blocks

pub mod alibi;
pub mod attention;
pub mod layers;

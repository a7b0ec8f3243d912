//! Autoregressive generation of (phoneme, duration, pitch) triples.
//!
//! # State machine
//!
//! ```text
//! PRIMING (step 0, only with conditioning) → DECODING (steps 1..max) → DONE
//! ```
//!
//! Every step runs the model over the whole growing history (no key/value
//! cache), takes the last-position logits of each stream, and picks the next
//! id per stream:
//!
//! 1. divide by temperature
//! 2. forbid the padding class (id 0)
//! 3. keep the `top_k` largest logits
//! 4. softmax, then argmax (`deterministic`) or sample
//!
//! With conditioning, the token picked at step 0 is replaced by the silence
//! token so decoding always starts from a known acoustic state; that silence
//! is dropped from the output when `trim_conditioning_pause` is set.
//! Decoding stops when the token stream produces `<eos>` (completed, the
//! `<eos>` triple is not emitted) or after `max_new_tokens` steps.

use candle_core::{DType, IndexOp, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::embedding::{shift_value, unshift_id};
use super::gpt::{ForwardInput, SupervoiceGpt};
use super::sampling;
use crate::config::NUM_SPECIAL_TOKENS;
use crate::tokenizer::PhonemeTokenizer;
use crate::{Error, Result};

// ── Options and results ───────────────────────────────────────────────────────

/// Number of candidates [`SupervoiceGpt::predict_next`] callers usually ask for.
pub const DEFAULT_PREDICT_TOP_K: usize = 10;

/// Sampling knobs for [`Generator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateOptions {
    /// Decode step budget.
    pub max_new_tokens: usize,
    /// Logit divisor; must be > 0.
    pub temperature: f32,
    /// Keep only the k most likely ids per stream. `None` disables filtering.
    pub top_k: Option<usize>,
    /// Argmax instead of sampling.
    pub deterministic: bool,
    /// Drop the forced leading silence when conditioning is supplied.
    pub trim_conditioning_pause: bool,
    /// Seed for stochastic sampling. `None` draws a fresh seed per call.
    pub seed: Option<u64>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            temperature: 1.0,
            top_k: Some(5),
            deterministic: false,
            trim_conditioning_pause: true,
            seed: None,
        }
    }
}

/// Priming prefix: text prepended to the input plus `(phoneme, duration, pitch)`
/// triples placed after `<bos>` in the output history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditioning {
    pub text: String,
    pub phonemes: Vec<(String, u32, u32)>,
}

/// One generated triple with raw (unshifted) duration and pitch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhonemeTriple {
    pub phoneme: String,
    pub duration: u32,
    pub pitch: u32,
}

/// Result of a generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub output: Vec<PhonemeTriple>,
    /// `true` when `<eos>` was produced, `false` when the step budget ran out.
    pub completed: bool,
}

// ── Model seam ────────────────────────────────────────────────────────────────

/// Output history: three parallel id sequences (durations and pitches shifted).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub tokens: Vec<u32>,
    pub durations: Vec<u32>,
    pub pitches: Vec<u32>,
}

impl History {
    pub fn push(&mut self, token: u32, duration: u32, pitch: u32) {
        self.tokens.push(token);
        self.durations.push(duration);
        self.pitches.push(pitch);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Last-position logits of the three streams.
#[derive(Debug, Clone, PartialEq)]
pub struct NextLogits {
    pub token: Vec<f32>,
    pub duration: Vec<f32>,
    pub pitch: Vec<f32>,
}

/// Anything that can score the next triple given the input ids and history.
pub trait StepModel {
    fn next_logits(&self, input: &[u32], history: &History) -> Result<NextLogits>;

    /// Duration classes, padding included.
    fn n_durations(&self) -> usize;

    /// Pitch classes, padding included.
    fn n_pitches(&self) -> usize;
}

impl StepModel for SupervoiceGpt {
    fn next_logits(&self, input: &[u32], history: &History) -> Result<NextLogits> {
        let device = self.device();
        let row = |ids: &[u32]| Tensor::from_slice(ids, (1, ids.len()), device);
        let input = row(input)?;
        let tokens = row(&history.tokens)?;
        let durations = row(&history.durations)?;
        let pitches = row(&history.pitches)?;

        let out = self.forward(&ForwardInput::new(&input, &tokens, &durations, &pitches))?;
        let last = history.len() - 1;
        let pluck = |logits: &Tensor| -> Result<Vec<f32>> {
            Ok(logits.i((0, last))?.to_dtype(DType::F32)?.to_vec1()?)
        };
        Ok(NextLogits {
            token: pluck(&out.logits.token)?,
            duration: pluck(&out.logits.duration)?,
            pitch: pluck(&out.logits.pitch)?,
        })
    }

    fn n_durations(&self) -> usize {
        self.config().n_durations()
    }

    fn n_pitches(&self) -> usize {
        self.config().n_pitches()
    }
}

// ── Generation state ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Priming,
    Decoding,
    Done,
}

/// What a single [`Generator::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// A triple was appended to the output.
    Emitted(PhonemeTriple),
    /// The forced leading silence was appended to the history but not emitted.
    Trimmed,
    /// `<eos>` was produced.
    Stopped,
    /// `max_new_tokens` steps have run.
    BudgetExhausted,
}

/// Per-call decoding state: context buffers, step counter and completion flag.
#[derive(Debug, Clone)]
pub struct GenerationState {
    input: Vec<u32>,
    history: History,
    step: usize,
    phase: Phase,
    completed: bool,
    output: Vec<PhonemeTriple>,
}

impl GenerationState {
    pub fn input(&self) -> &[u32] {
        &self.input
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Decode steps run so far.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn into_output(self) -> GenerationOutput {
        GenerationOutput {
            output: self.output,
            completed: self.completed,
        }
    }

    fn finish(&mut self, completed: bool) {
        self.phase = Phase::Done;
        self.completed = completed;
    }
}

// ── Generator ─────────────────────────────────────────────────────────────────

/// Drives a [`StepModel`] through the decode loop.
pub struct Generator<'a, M: ?Sized, T: ?Sized> {
    model: &'a M,
    tokenizer: &'a T,
    options: GenerateOptions,
    rng: ChaCha8Rng,
}

impl<'a, M, T> Generator<'a, M, T>
where
    M: StepModel + ?Sized,
    T: PhonemeTokenizer + ?Sized,
{
    pub fn new(model: &'a M, tokenizer: &'a T, options: GenerateOptions) -> Self {
        let seed = options.seed.unwrap_or_else(rand::random);
        Self {
            model,
            tokenizer,
            options,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Build the initial state. Conditioning triples are validated here,
    /// before any model call.
    pub fn start(
        &self,
        text: &str,
        conditioning: Option<&Conditioning>,
    ) -> Result<GenerationState> {
        let bos = self.tokenizer.sequence_begin_token_id();
        let eos = self.tokenizer.sequence_end_token_id();

        let mut history = History::default();
        history.push(bos, 0, 0);

        let full_text = match conditioning {
            Some(cond) => {
                for (phoneme, duration, pitch) in &cond.phonemes {
                    let ids = self.tokenizer.encode_phonemes(&[phoneme.as_str()])?;
                    let id = ids.first().copied().ok_or_else(|| {
                        Error::InvalidConditioning(format!(
                            "phoneme {phoneme:?} encodes to nothing"
                        ))
                    })?;
                    if id < NUM_SPECIAL_TOKENS {
                        return Err(Error::InvalidConditioning(format!(
                            "conditioning tokens should not contain special tokens, \
                             got {phoneme:?} (id {id})"
                        )));
                    }
                    let duration = shift_value(*duration);
                    let pitch = shift_value(*pitch);
                    let ranges = [
                        ("duration", duration, self.model.n_durations()),
                        ("pitch", pitch, self.model.n_pitches()),
                    ];
                    for (name, value, classes) in ranges {
                        if value as usize >= classes {
                            return Err(Error::InvalidConditioning(format!(
                                "{name} {} of {phoneme:?} is out of range, max is {}",
                                unshift_id(value),
                                classes.saturating_sub(2)
                            )));
                        }
                    }
                    history.push(id, duration, pitch);
                }
                format!("{} {}", cond.text, text)
            }
            None => text.to_string(),
        };

        let mut input = vec![bos];
        input.extend(self.tokenizer.encode(&full_text)?);
        input.push(eos);

        Ok(GenerationState {
            input,
            history,
            step: 0,
            phase: if conditioning.is_some() {
                Phase::Priming
            } else {
                Phase::Decoding
            },
            completed: false,
            output: Vec::new(),
        })
    }

    /// Run one decode step.
    pub fn step(&mut self, state: &mut GenerationState) -> Result<StepOutcome> {
        match state.phase {
            Phase::Done if state.completed => return Ok(StepOutcome::Stopped),
            Phase::Done => return Ok(StepOutcome::BudgetExhausted),
            _ if state.step >= self.options.max_new_tokens => {
                tracing::warn!(
                    steps = state.step,
                    "generation stopped by step budget before <eos>"
                );
                state.finish(false);
                return Ok(StepOutcome::BudgetExhausted);
            }
            _ => {}
        }

        let logits = self.model.next_logits(&state.input, &state.history)?;
        let opts = &self.options;
        let mut pick = |logits: Vec<f32>| {
            sampling::select(
                logits,
                opts.temperature,
                opts.top_k,
                opts.deterministic,
                &mut self.rng,
            )
        };
        let sampled_token = pick(logits.token);
        let duration = pick(logits.duration);
        let pitch = pick(logits.pitch);

        let priming = state.phase == Phase::Priming;
        let token = if priming {
            self.tokenizer.silence_token_id()
        } else {
            sampled_token
        };
        tracing::debug!(
            step = state.step,
            sampled_token,
            token,
            duration,
            pitch,
            "decode step"
        );

        state.history.push(token, duration, pitch);
        state.step += 1;
        state.phase = Phase::Decoding;

        if token == self.tokenizer.sequence_end_token_id() {
            tracing::debug!(steps = state.step, "generation reached <eos>");
            state.finish(true);
            return Ok(StepOutcome::Stopped);
        }

        if priming && self.options.trim_conditioning_pause {
            return Ok(StepOutcome::Trimmed);
        }

        let phoneme = self
            .tokenizer
            .decode_phonemes(&[token])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::tokenizer(format!("id {token} decodes to nothing")))?;
        let triple = PhonemeTriple {
            phoneme,
            duration: unshift_id(duration),
            pitch: unshift_id(pitch),
        };
        state.output.push(triple.clone());
        Ok(StepOutcome::Emitted(triple))
    }

    /// Generate from `text`, optionally primed with `conditioning`.
    pub fn generate(
        &mut self,
        text: &str,
        conditioning: Option<&Conditioning>,
    ) -> Result<GenerationOutput> {
        let mut state = self.start(text, conditioning)?;
        while !state.is_done() {
            self.step(&mut state)?;
        }
        Ok(state.into_output())
    }

    /// Top-k next-token lookahead without sampling.
    ///
    /// History is `<bos>` followed by `phonemes` with raw `durations`
    /// (shifted internally); pitch information is absent and fed as padding.
    /// Returns probabilities (descending) and their phonemes.
    pub fn predict_next(
        &self,
        text: &str,
        phonemes: &[&str],
        durations: &[u32],
        top_k: usize,
    ) -> Result<(Vec<f32>, Vec<String>)> {
        if phonemes.len() != durations.len() {
            return Err(Error::Shape(format!(
                "{} phonemes but {} durations",
                phonemes.len(),
                durations.len()
            )));
        }
        let bos = self.tokenizer.sequence_begin_token_id();
        let mut input = vec![bos];
        input.extend(self.tokenizer.encode(text)?);
        input.push(self.tokenizer.sequence_end_token_id());

        let mut history = History::default();
        history.push(bos, 0, 0);
        let ids = self.tokenizer.encode_phonemes(phonemes)?;
        for (&id, &duration) in ids.iter().zip(durations) {
            history.push(id, shift_value(duration), 0);
        }

        let logits = self.model.next_logits(&input, &history)?;
        let probs = sampling::softmax(&logits.token);
        let mut ranked: Vec<(u32, f32)> = probs
            .into_iter()
            .enumerate()
            .map(|(i, p)| (i as u32, p))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(top_k.min(ranked.len()));

        let (indices, probs): (Vec<u32>, Vec<f32>) = ranked.into_iter().unzip();
        let symbols = self.tokenizer.decode_phonemes(&indices)?;
        Ok((probs, symbols))
    }
}

impl SupervoiceGpt {
    /// Convenience wrapper around [`Generator::generate`].
    pub fn generate<T: PhonemeTokenizer + ?Sized>(
        &self,
        tokenizer: &T,
        text: &str,
        conditioning: Option<&Conditioning>,
        options: GenerateOptions,
    ) -> Result<GenerationOutput> {
        Generator::new(self, tokenizer, options).generate(text, conditioning)
    }

    /// Convenience wrapper around [`Generator::predict_next`].
    pub fn predict_next<T: PhonemeTokenizer + ?Sized>(
        &self,
        tokenizer: &T,
        text: &str,
        phonemes: &[&str],
        durations: &[u32],
        top_k: usize,
    ) -> Result<(Vec<f32>, Vec<String>)> {
        Generator::new(self, tokenizer, GenerateOptions::default())
            .predict_next(text, phonemes, durations, top_k)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

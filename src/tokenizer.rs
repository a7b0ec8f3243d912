//! Tokenizer collaborators.
//!
//! The model only needs the [`PhonemeTokenizer`] interface. Two implementations
//! are provided:
//!
//! - [`Vocabulary`]: symbol lists for both sides, text encoded per character
//! - [`PretrainedTokenizer`]: HuggingFace `tokenizer.json` for text, a
//!   [`Vocabulary`] for phonemes
//!
//! Ids `0`, `1` and `2` are `<bos>`, `<eos>` and `<sil>` on both sides.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::config::NUM_SPECIAL_TOKENS;
use crate::{Error, Result};

pub const BOS: &str = "<bos>";
pub const EOS: &str = "<eos>";
pub const SILENCE: &str = "<sil>";

/// Text → input ids, phonemes ↔ output ids.
pub trait PhonemeTokenizer {
    /// Encode raw text into input ids (no begin/end markers).
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Encode phoneme symbols into output ids.
    fn encode_phonemes(&self, phonemes: &[&str]) -> Result<Vec<u32>>;

    /// Decode output ids back into phoneme symbols.
    fn decode_phonemes(&self, ids: &[u32]) -> Result<Vec<String>>;

    fn sequence_begin_token_id(&self) -> u32 {
        0
    }

    fn sequence_end_token_id(&self) -> u32 {
        1
    }

    fn silence_token_id(&self) -> u32 {
        2
    }
}

/// One direction of a symbol table.
#[derive(Debug, Clone)]
struct SymbolTable {
    symbols: Vec<String>,
    ids: HashMap<String, u32>,
}

impl SymbolTable {
    fn new(symbols: &[String]) -> Self {
        let mut all = vec![BOS.to_string(), EOS.to_string(), SILENCE.to_string()];
        all.extend(
            symbols
                .iter()
                .filter(|s| !matches!(s.as_str(), BOS | EOS | SILENCE))
                .cloned(),
        );
        let ids = all
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
        Self { symbols: all, ids }
    }

    fn id(&self, symbol: &str) -> Result<u32> {
        self.ids
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::tokenizer(format!("unknown symbol {symbol:?}")))
    }

    fn symbol(&self, id: u32) -> Result<&str> {
        self.symbols
            .get(id as usize)
            .map(String::as_str)
            .ok_or_else(|| Error::tokenizer(format!("unknown id {id}")))
    }
}

#[derive(Deserialize)]
struct VocabularyFile {
    input: Vec<String>,
    output: Vec<String>,
}

/// Plain symbol-list tokenizer.
///
/// Special tokens are always prepended, so user symbols start at id 3.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    input: SymbolTable,
    output: SymbolTable,
}

impl Vocabulary {
    pub fn new(input: &[String], output: &[String]) -> Self {
        Self {
            input: SymbolTable::new(input),
            output: SymbolTable::new(output),
        }
    }

    /// Same symbol set on both sides.
    pub fn from_symbols(symbols: &[&str]) -> Self {
        let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        Self::new(&symbols, &symbols)
    }

    /// Load `{"input": [...], "output": [...]}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let file: VocabularyFile = serde_json::from_str(&raw)?;
        Ok(Self::new(&file.input, &file.output))
    }

    pub fn input_len(&self) -> usize {
        self.input.symbols.len()
    }

    pub fn output_len(&self) -> usize {
        self.output.symbols.len()
    }
}

impl PhonemeTokenizer for Vocabulary {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut buf = [0u8; 4];
        text.chars()
            .map(|c| self.input.id(c.encode_utf8(&mut buf)))
            .collect()
    }

    fn encode_phonemes(&self, phonemes: &[&str]) -> Result<Vec<u32>> {
        phonemes.iter().map(|p| self.output.id(p)).collect()
    }

    fn decode_phonemes(&self, ids: &[u32]) -> Result<Vec<String>> {
        ids.iter()
            .map(|&id| self.output.symbol(id).map(str::to_string))
            .collect()
    }
}

/// HuggingFace text tokenizer paired with a phoneme [`Vocabulary`].
///
/// Ids below [`NUM_SPECIAL_TOKENS`] are the model's `<bos>`/`<eos>`/`<sil>`.
/// A text tokenizer that produces one of them for ordinary text (an unknown
/// token mapped to id 0, for instance) is rejected by `encode`.
pub struct PretrainedTokenizer {
    text: tokenizers::Tokenizer,
    phonemes: Vocabulary,
}

impl PretrainedTokenizer {
    pub fn new(text: tokenizers::Tokenizer, phonemes: Vocabulary) -> Self {
        Self { text, phonemes }
    }

    pub fn from_files(
        tokenizer_path: impl AsRef<Path>,
        vocab_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let text = tokenizers::Tokenizer::from_file(tokenizer_path)?;
        let phonemes = Vocabulary::from_json_file(vocab_path)?;
        Ok(Self::new(text, phonemes))
    }
}

impl PhonemeTokenizer for PretrainedTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.text.encode(text, false)?;
        let ids = encoding.get_ids();
        if let Some(pos) = ids.iter().position(|&id| id < NUM_SPECIAL_TOKENS) {
            let token = encoding.get_tokens().get(pos).map_or("", String::as_str);
            return Err(Error::tokenizer(format!(
                "text token {token:?} maps to reserved id {}",
                ids[pos]
            )));
        }
        Ok(ids.to_vec())
    }

    fn encode_phonemes(&self, phonemes: &[&str]) -> Result<Vec<u32>> {
        self.phonemes.encode_phonemes(phonemes)
    }

    fn decode_phonemes(&self, ids: &[u32]) -> Result<Vec<String>> {
        self.phonemes.decode_phonemes(ids)
    }
}

//! Phoneme GPT CLI: text → (phoneme, duration, pitch) triples.
//!
//! # Output
//!
//! Prints a single JSON line to stdout on success:
//!
//! ```json
//! {"output":[{"phoneme":"h","duration":4,"pitch":17}],"completed":true}
//! ```
//!
//! With `--predict`, prints the top-k next-phoneme candidates instead.
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use clap::Parser;
use supervoice_gpt_rs::{
    Conditioning, GenerateOptions, GptConfig, PhonemeTokenizer, PretrainedTokenizer,
    SupervoiceGpt, Vocabulary, model::generation::DEFAULT_PREDICT_TOP_K,
};

#[derive(Parser, Debug)]
#[command(
    name = "supervoice-gpt",
    about = "Phoneme, duration and pitch generation from text",
    long_about = "Run the phoneme GPT over a text and print the generated\n\
                  (phoneme, duration, pitch) triples as one JSON line."
)]
struct Args {
    /// Model hyperparameters (config.json). Omit to use the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model weights (safetensors).
    #[arg(long, short = 'w')]
    weights: PathBuf,

    /// Vocabulary JSON: {"input": [...], "output": [...]}.
    #[arg(long)]
    vocab: PathBuf,

    /// HuggingFace tokenizer.json for the text side. Without it, text is
    /// encoded per character with the input vocabulary.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Input text.
    #[arg(long, short = 't')]
    text: String,

    /// Conditioning JSON: {"text": ..., "phonemes": [[symbol, duration, pitch], ...]}.
    #[arg(long)]
    conditioning: Option<PathBuf>,

    /// Maximum number of decode steps.
    #[arg(long, default_value_t = 1024)]
    max_new_tokens: usize,

    /// Sampling temperature (> 0).
    #[arg(long, default_value_t = 1.0)]
    temperature: f32,

    /// Keep only the k most likely ids per stream.
    #[arg(long, default_value_t = 5)]
    top_k: usize,

    /// Disable top-k filtering and sample from the full distribution.
    #[arg(long, conflicts_with = "top_k")]
    no_top_k: bool,

    /// Always pick the most likely id instead of sampling.
    #[arg(long)]
    deterministic: bool,

    /// Random seed. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,

    /// Emit the forced leading silence when conditioning is given.
    #[arg(long)]
    keep_conditioning_pause: bool,

    /// Print next-phoneme candidates for this space-separated phoneme prefix
    /// instead of generating. Requires --durations.
    #[arg(long)]
    predict: Option<String>,

    /// Space-separated raw durations matching --predict.
    #[arg(long, default_value = "")]
    durations: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if !(args.temperature > 0.0) {
        anyhow::bail!("temperature must be > 0, got {}", args.temperature);
    }
    if args.top_k == 0 {
        anyhow::bail!("top-k must be > 0");
    }

    let config = match &args.config {
        Some(path) => GptConfig::from_json_file(path)?,
        None => GptConfig::default(),
    };

    let device = candle_core::Device::cuda_if_available(0)?;
    let dtype = candle_core::DType::F32;
    tracing::info!("Using device: {:?}", device);

    let model = SupervoiceGpt::load(&args.weights, &config, &device, dtype)
        .map_err(|e| anyhow::anyhow!("failed to load model: {e}"))?;

    let vocab = Vocabulary::from_json_file(&args.vocab)?;
    if vocab.output_len() != config.n_output_tokens {
        anyhow::bail!(
            "vocabulary has {} output symbols but the model expects {}",
            vocab.output_len(),
            config.n_output_tokens
        );
    }
    if args.tokenizer.is_none() && vocab.input_len() > config.n_input_tokens {
        anyhow::bail!(
            "vocabulary has {} input symbols but the model embeds only {}",
            vocab.input_len(),
            config.n_input_tokens
        );
    }
    let tokenizer: Box<dyn PhonemeTokenizer> = match &args.tokenizer {
        Some(path) => Box::new(PretrainedTokenizer::from_files(path, &args.vocab)?),
        None => Box::new(vocab),
    };

    if let Some(prefix) = &args.predict {
        let phonemes: Vec<&str> = prefix.split_whitespace().collect();
        let durations = args
            .durations
            .split_whitespace()
            .map(str::parse::<u32>)
            .collect::<Result<Vec<_>, _>>()?;
        let (probs, symbols) = model
            .predict_next(
                tokenizer.as_ref(),
                &args.text,
                &phonemes,
                &durations,
                DEFAULT_PREDICT_TOP_K,
            )
            .map_err(|e| anyhow::anyhow!("prediction failed: {e}"))?;
        let candidates: Vec<_> = symbols.into_iter().zip(probs).collect();
        println!("{}", serde_json::to_string(&candidates)?);
        return Ok(());
    }

    let conditioning = match &args.conditioning {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Some(serde_json::from_str::<Conditioning>(&raw)?)
        }
        None => None,
    };

    let options = GenerateOptions {
        max_new_tokens: args.max_new_tokens,
        temperature: args.temperature,
        top_k: (!args.no_top_k).then_some(args.top_k),
        deterministic: args.deterministic,
        trim_conditioning_pause: !args.keep_conditioning_pause,
        seed: args.seed,
    };

    tracing::info!(text = %args.text, "Generating phonemes...");
    let result = model
        .generate(
            tokenizer.as_ref(),
            &args.text,
            conditioning.as_ref(),
            options,
        )
        .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;
    tracing::info!(
        phonemes = result.output.len(),
        completed = result.completed,
        "generation finished"
    );

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

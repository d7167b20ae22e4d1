use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use molgen::metrics;
use molgen::SamplingEngine;
use molgen::SamplingParams;
use molgen::Transformer;
use molgen::{Tokenizer, Vocabulary};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "molgen.bin")]
    checkpoint_path: PathBuf,

    #[arg(short, long, default_value = "vocab.txt")]
    vocab_path: PathBuf,

    /// SMILES prefix to complete; repeat for several. Empty samples from scratch.
    #[arg(short, long)]
    prompt: Vec<String>,

    /// samples per prompt
    #[arg(short, long, default_value_t = 8)]
    num_samples: usize,

    /// (0, inf)
    #[arg(short = 'T', long, default_value_t = 1.0)]
    temperature: f32,

    #[arg(short = 'k', long)]
    top_k: Option<usize>,

    /// (0, 1]
    #[arg(short = 'P', long)]
    top_p: Option<f32>,

    #[arg(short, long)]
    greedy: bool,

    /// defaults to the checkpoint's sequence length
    #[arg(short, long)]
    max_length: Option<usize>,

    #[arg(short, long)]
    seed: Option<u64>,

    /// corpus (one SMILES per line) to measure novelty against
    #[arg(short, long)]
    reference: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    info!(?args, "starting generation");

    let model = Transformer::from_file(&args.checkpoint_path)
        .with_context(|| format!("loading {}", args.checkpoint_path.display()))?;
    let vocab = Vocabulary::from_file(&args.vocab_path, model.config.seq_len)
        .with_context(|| format!("loading {}", args.vocab_path.display()))?;
    let tokenizer = Tokenizer::new(vocab);

    let params = SamplingParams {
        temperature: args.temperature,
        top_k: args.top_k,
        top_p: args.top_p,
        greedy: args.greedy,
        max_length: args.max_length,
        seed: args.seed,
    };
    let engine = SamplingEngine::new(&model, &tokenizer, params)?;

    let prompts = if args.prompt.is_empty() {
        vec![String::new()]
    } else {
        args.prompt
    };
    let prefixes: Vec<&str> = prompts
        .iter()
        .flat_map(|p| std::iter::repeat(p.as_str()).take(args.num_samples))
        .collect();

    let samples = engine.sample(&prefixes)?;
    for smiles in &samples {
        println!("{smiles}");
    }

    eprintln!("diversity: {:.3}", metrics::diversity(&samples));
    if let Some(path) = args.reference {
        let corpus = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let reference: Vec<&str> = corpus.lines().map(str::trim).collect();
        eprintln!("novelty: {:.3}", metrics::novelty(&samples, &reference));
    }

    Ok(())
}

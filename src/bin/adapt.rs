use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use molgen::config::Config;
use molgen::Transformer;
use molgen::Vocabulary;

/// Learns a SMILES vocabulary from a corpus and optionally writes an
/// untrained checkpoint sized for it.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// one SMILES per line
    #[arg(short, long)]
    corpus: PathBuf,

    #[arg(short, long, default_value = "vocab.txt")]
    output: PathBuf,

    /// also write a randomly initialised checkpoint here
    #[arg(long)]
    init_checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = 64)]
    dim: usize,

    #[arg(long, default_value_t = 256)]
    hidden_dim: usize,

    #[arg(long, default_value_t = 2)]
    n_layers: usize,

    #[arg(long, default_value_t = 4)]
    n_heads: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let corpus = fs::read_to_string(&args.corpus)
        .with_context(|| format!("reading {}", args.corpus.display()))?;
    let vocab = Vocabulary::adapt(corpus.lines().map(str::trim).filter(|l| !l.is_empty()))?;
    vocab.save(&args.output)?;
    info!(
        tokens = vocab.len(),
        sequence_length = vocab.sequence_length(),
        path = %args.output.display(),
        "wrote vocabulary"
    );

    if let Some(path) = args.init_checkpoint {
        let config = Config {
            dim: args.dim,
            hidden_dim: args.hidden_dim,
            n_layers: args.n_layers,
            n_heads: args.n_heads,
            vocab_size: vocab.len(),
            seq_len: vocab.sequence_length(),
        };
        let model = Transformer::random(config, args.seed)?;
        model.save(&path)?;
        info!(path = %path.display(), "wrote untrained checkpoint");
    }

    Ok(())
}

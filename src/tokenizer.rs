use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::{batch::TokenBatch, MolgenError, Result};

/// Bracket atoms, two-letter halogens, organic-subset atoms, bonds, ring
/// closures and branches.
static SMILES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(\[[^\]]+\]|Br?|Cl?|N|O|S|P|F|I|b|c|n|o|s|p|\(|\)|\.|=|#|-|\+|\\|/|:|~|@|\?|>>?|\*|\$|%[0-9]{2}|[0-9])",
    )
    .expect("static SMILES pattern")
});

/// Reserved ids at the head of every vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SpecialToken {
    /// padding, also used as the mask token
    Pad = 0,
    Unk = 1,
    Bos = 2,
    Eos = 3,
}

impl SpecialToken {
    pub const ALL: [SpecialToken; 4] = [Self::Pad, Self::Unk, Self::Bos, Self::Eos];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pad => "[MASK]",
            Self::Unk => "[UNK]",
            Self::Bos => "[BOS]",
            Self::Eos => "[EOS]",
        }
    }

    fn is_special(token: &str) -> bool {
        Self::ALL.iter().any(|s| s.as_str() == token)
    }
}

/// Splits a SMILES string into tokens. Text between pattern matches is kept
/// as a token of its own so nothing is silently dropped.
pub fn pretokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut last = 0;
    for m in SMILES_RE.find_iter(text) {
        if m.start() > last {
            tokens.push(&text[last..m.start()]);
        }
        tokens.push(m.as_str());
        last = m.end();
    }
    if last < text.len() {
        tokens.push(&text[last..]);
    }
    tokens
}

/// Immutable token table. Ids `0..4` are the [`SpecialToken`]s, the learned
/// tokens follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    tokens: Vec<String>,
    ids: HashMap<String, usize>,
    sequence_length: usize,
}

impl Vocabulary {
    /// Builds a vocabulary from learned (non-special) tokens in id order.
    /// Special tokens in the input are ignored.
    pub fn new<I, S>(learned: I, sequence_length: usize) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if sequence_length < 2 {
            return Err(MolgenError::Configuration(format!(
                "sequence length {sequence_length} cannot hold begin and end tokens"
            )));
        }
        let mut tokens: Vec<String> = SpecialToken::ALL
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        for token in learned {
            let token = token.into();
            if !SpecialToken::is_special(&token) {
                tokens.push(token);
            }
        }

        let mut ids = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            if ids.insert(token.clone(), id).is_some() {
                return Err(MolgenError::Tokenization(format!(
                    "token {token:?} appears twice in the vocabulary"
                )));
            }
        }
        Ok(Self {
            tokens,
            ids,
            sequence_length,
        })
    }

    /// Learns a vocabulary from a corpus: tokens ordered by frequency
    /// (descending, ties by token descending), sequence length fitted to the
    /// longest entry plus begin and end tokens.
    pub fn adapt<I, S>(corpus: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut counts = HashMap::<String, usize>::new();
        let mut longest = 0;
        let mut entries = 0;
        for text in corpus {
            let tokens = pretokenize(text.as_ref());
            longest = longest.max(tokens.len());
            for token in tokens {
                *counts.entry(token.to_string()).or_default() += 1;
            }
            entries += 1;
        }
        if counts.is_empty() {
            return Err(MolgenError::Tokenization(format!(
                "cannot adapt a vocabulary to a corpus of {entries} empty entries"
            )));
        }

        let mut learned: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(token, _)| !SpecialToken::is_special(token))
            .collect();
        learned.sort_by(|(ta, ca), (tb, cb)| cb.cmp(ca).then_with(|| tb.cmp(ta)));
        debug!(
            entries,
            learned = learned.len(),
            longest,
            "adapted vocabulary"
        );

        Self::new(learned.into_iter().map(|(token, _)| token), longest + 2)
    }

    /// One learned token per line; blank lines are skipped.
    pub fn from_reader<R: BufRead>(r: R, sequence_length: usize) -> Result<Self> {
        let mut learned = Vec::new();
        for line in r.lines() {
            let line = line?;
            let token = line.trim_end_matches('\r');
            if !token.is_empty() {
                learned.push(token.to_string());
            }
        }
        Self::new(learned, sequence_length)
    }

    pub fn from_file<P: AsRef<Path>>(path: P, sequence_length: usize) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file), sequence_length)
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        for token in self.learned() {
            writeln!(w, "{token}")?;
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        self.write_to(&mut file)?;
        file.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    pub fn learned(&self) -> impl Iterator<Item = &str> + '_ {
        self.tokens[SpecialToken::ALL.len()..]
            .iter()
            .map(String::as_str)
    }

    pub fn token_to_id(&self, token: &str) -> Option<usize> {
        self.ids.get(token).copied()
    }

    pub fn id_to_token(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }
}

/// SMILES tokenizer over a fixed [`Vocabulary`].
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: Vocabulary,
}

impl Tokenizer {
    pub fn new(vocab: Vocabulary) -> Self {
        Self { vocab }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocab.len()
    }

    pub fn sequence_length(&self) -> usize {
        self.vocab.sequence_length()
    }

    pub fn pad_id(&self) -> usize {
        SpecialToken::Pad as usize
    }

    pub fn bos_id(&self) -> usize {
        SpecialToken::Bos as usize
    }

    pub fn eos_id(&self) -> usize {
        SpecialToken::Eos as usize
    }

    /// Unknown tokens map to [`SpecialToken::Unk`].
    pub fn encode(&self, text: &str, bos: bool, eos: bool) -> Vec<usize> {
        let mut ids = Vec::with_capacity(text.len() + 2);
        if bos {
            ids.push(self.bos_id());
        }
        ids.extend(pretokenize(text).into_iter().map(|token| {
            self.vocab
                .token_to_id(token)
                .unwrap_or(SpecialToken::Unk as usize)
        }));
        if eos {
            ids.push(self.eos_id());
        }
        ids
    }

    /// Joins tokens, dropping padding and begin tokens and cutting at the
    /// first end token.
    pub fn decode(&self, ids: &[usize]) -> String {
        let mut text = String::new();
        let mut unknown = false;
        for &id in ids {
            if id == self.eos_id() {
                break;
            }
            if id == self.pad_id() || id == self.bos_id() {
                continue;
            }
            let token = self
                .vocab
                .id_to_token(id)
                .unwrap_or(SpecialToken::Unk.as_str());
            unknown |= token == SpecialToken::Unk.as_str();
            text.push_str(token);
        }
        if unknown {
            warn!(smiles = %text, "unknown token found in decoded SMILES");
        }
        text
    }

    /// Begin + tokens + end, right-padded to the sequence length.
    pub fn tokenize<S: AsRef<str>>(&self, texts: &[S]) -> Result<TokenBatch> {
        let rows: Vec<Vec<usize>> = texts
            .iter()
            .map(|t| self.encode(t.as_ref(), true, true))
            .collect();
        TokenBatch::from_rows(&rows, self.sequence_length(), self.pad_id())
    }

    /// Begin + tokens, right-padded to `width`, ready for generation. Every
    /// token of every prefix must be in the vocabulary.
    pub fn tokenize_prefixes<S: AsRef<str>>(&self, texts: &[S], width: usize) -> Result<TokenBatch> {
        let mut rows = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let text = text.as_ref();
            if let Some(token) = pretokenize(text)
                .into_iter()
                .find(|t| self.vocab.token_to_id(t).is_none())
            {
                return Err(MolgenError::Tokenization(format!(
                    "prefix {i} ({text:?}) holds token {token:?} outside the vocabulary"
                )));
            }
            let ids = self.encode(text, true, false);
            if ids.len() > width {
                return Err(MolgenError::Tokenization(format!(
                    "prefix {i} ({text:?}) needs {} tokens but the maximum length is {width}",
                    ids.len()
                )));
            }
            rows.push(ids);
        }
        TokenBatch::from_rows(&rows, width, self.pad_id())
    }

    pub fn detokenize(&self, batch: &TokenBatch) -> Vec<String> {
        batch.rows().map(|row| self.decode(row)).collect()
    }
}

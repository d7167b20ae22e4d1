//! Corpus-level statistics of generated SMILES.

use std::collections::HashSet;

/// Fraction of unique strings among `samples`.
pub fn diversity<S: AsRef<str>>(samples: &[S]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let unique: HashSet<&str> = samples.iter().map(AsRef::as_ref).collect();
    unique.len() as f32 / samples.len() as f32
}

/// Unique samples absent from `reference`, over the number of samples.
pub fn novelty<S: AsRef<str>, T: AsRef<str>>(samples: &[S], reference: &[T]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let known: HashSet<&str> = reference.iter().map(AsRef::as_ref).collect();
    let unique: HashSet<&str> = samples.iter().map(AsRef::as_ref).collect();
    let novel = unique.iter().filter(|s| !known.contains(*s)).count();
    novel as f32 / samples.len() as f32
}

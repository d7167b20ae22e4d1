//! Integration tests for the sampling engine.

mod common;

use common::{letters, one_hot, ScriptedModel, EOS};
use molgen::{MolgenError, Policy, SamplingEngine, SamplingParams};

fn greedy(max_length: Option<usize>) -> SamplingParams {
    SamplingParams {
        greedy: true,
        max_length,
        ..SamplingParams::default()
    }
}

/// C N O S cycling with the history length, EOS once six tokens are in.
fn cycling(history: &[usize]) -> Vec<f32> {
    if history.len() >= 6 {
        one_hot(8, EOS)
    } else {
        one_hot(8, 4 + history.len() % 4)
    }
}

#[test]
fn test_greedy_batch_from_begin_token_only() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, cycling);
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();

    let batch = tokenizer
        .tokenize_prefixes(&["", "", "", ""], engine.max_length())
        .unwrap();
    let generation = engine.generate(batch).unwrap();

    for row in generation.sequences.rows() {
        assert_eq!(row, &[2, 5, 6, 7, 4, 5, EOS]);
    }
    assert!(generation.sequences.lengths().iter().all(|&l| l <= 10));
    assert_eq!(generation.model_calls, 6);

    let samples = engine.sample(&["", "", "", ""]).unwrap();
    assert_eq!(samples, vec!["NOSCN"; 4]);
}

#[test]
fn test_sequence_without_end_token_runs_to_max_length() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, |_: &[usize]| one_hot(8, 4));
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();

    let batch = tokenizer.tokenize_prefixes(&[""], 10).unwrap();
    let generation = engine.generate(batch).unwrap();

    assert_eq!(generation.sequences.len(0), 10);
    assert_eq!(generation.model_calls, 9);
    assert_eq!(tokenizer.detokenize(&generation.sequences), vec!["CCCCCCCCC"]);
}

#[test]
fn test_immediate_end_token_uses_one_model_call() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, |_: &[usize]| one_hot(8, EOS));
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();

    let batch = tokenizer.tokenize_prefixes(&["", "CN", "O"], 10).unwrap();
    let generation = engine.generate(batch).unwrap();

    assert_eq!(generation.sequences.lengths(), &[2, 4, 3]);
    assert_eq!(generation.model_calls, 1);
    assert_eq!(model.calls.get(), 1);
    assert!(generation
        .sequences
        .rows()
        .all(|row| row.last() == Some(&EOS)));
}

#[test]
fn test_full_batch_returns_unchanged_without_model_calls() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, cycling);
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(Some(3))).unwrap();

    let batch = tokenizer.tokenize_prefixes(&["CN", "NO"], 3).unwrap();
    let generation = engine.generate(batch.clone()).unwrap();
    assert_eq!(generation.sequences, batch);
    assert_eq!(generation.model_calls, 0);

    assert_eq!(engine.sample(&["CN", "NO"]).unwrap(), vec!["CN", "NO"]);
    assert_eq!(model.calls.get(), 0);
}

#[test]
fn test_empty_request_returns_nothing() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, cycling);
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();
    assert!(engine.sample::<&str>(&[]).unwrap().is_empty());
    assert_eq!(model.calls.get(), 0);
}

#[test]
fn test_mixed_prefix_lengths_do_not_bleed() {
    // next token depends on the whole history of the row
    let next = |history: &[usize]| {
        if history.len() >= 7 {
            one_hot(8, EOS)
        } else {
            one_hot(8, 4 + history.iter().sum::<usize>() % 4)
        }
    };
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, next);
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();

    let prefixes = ["", "CNO", "N", "SSSSSS"];
    let together = engine.sample(&prefixes).unwrap();
    let alone: Vec<String> = prefixes
        .iter()
        .map(|p| engine.sample(&[*p]).unwrap().remove(0))
        .collect();

    assert_eq!(together, alone);
    for (sample, prefix) in together.iter().zip(prefixes.iter()) {
        assert!(sample.starts_with(prefix));
    }
}

#[test]
fn test_greedy_ignores_monotonic_rescaling() {
    let base = |history: &[usize]| -> Vec<f32> {
        let sum: usize = history.iter().sum();
        (0..8)
            .map(|i| {
                let bonus = if i == EOS && history.len() > 5 { 9.0 } else { 0.0 };
                ((i * 7 + sum) % 5) as f32 + bonus
            })
            .collect()
    };
    let tokenizer = letters(4, 10);
    let plain = ScriptedModel::new(8, 10, base);
    let rescaled = ScriptedModel::new(8, 10, |h: &[usize]| -> Vec<f32> {
        base(h).into_iter().map(|v| 3.0 * v + 7.0).collect()
    });

    let prefixes = ["", "C", "NO"];
    let a = SamplingEngine::new(&plain, &tokenizer, greedy(None))
        .unwrap()
        .sample(&prefixes)
        .unwrap();
    let b = SamplingEngine::new(&rescaled, &tokenizer, greedy(None))
        .unwrap()
        .sample(&prefixes)
        .unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_scores_follow_generated_tokens() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, cycling);
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();

    let batch = tokenizer.tokenize_prefixes(&["", "CN"], 10).unwrap();
    let generation = engine.generate(batch).unwrap();

    for row in 0..2 {
        assert_eq!(generation.log_probs[row].len(), generation.entropies[row].len());
        assert!(generation.log_probs[row].iter().all(|&lp| lp <= 0.0 && lp > -0.01));
        assert!(generation.entropies[row].iter().all(|&e| e >= 0.0));
        assert!(generation.score(row) <= 0.0);
    }
    // "" grows from 1 to 7 tokens, "CN" from 3 to 7
    assert_eq!(generation.log_probs[0].len(), 6);
    assert_eq!(generation.log_probs[1].len(), 4);
}

#[test]
fn test_invalid_parameters_fail_before_any_model_call() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, cycling);

    let bad = [
        SamplingParams {
            temperature: 0.0,
            ..SamplingParams::default()
        },
        SamplingParams {
            top_k: Some(0),
            ..SamplingParams::default()
        },
        SamplingParams {
            top_p: Some(1.01),
            ..SamplingParams::default()
        },
        SamplingParams {
            max_length: Some(11),
            ..SamplingParams::default()
        },
        SamplingParams {
            max_length: Some(0),
            ..SamplingParams::default()
        },
    ];
    for params in bad {
        assert!(matches!(
            SamplingEngine::new(&model, &tokenizer, params),
            Err(MolgenError::Configuration(_))
        ));
    }

    let mismatched = ScriptedModel::new(9, 10, |_: &[usize]| one_hot(9, EOS));
    assert!(matches!(
        SamplingEngine::new(&mismatched, &tokenizer, greedy(None)),
        Err(MolgenError::Configuration(_))
    ));
    assert_eq!(model.calls.get(), 0);
}

#[test]
fn test_unrepresentable_prefix_is_a_tokenization_error() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, cycling);
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();

    assert!(matches!(
        engine.sample(&["CXe"]),
        Err(MolgenError::Tokenization(_))
    ));
    assert!(matches!(
        engine.sample(&["CCCCCCCCCC"]),
        Err(MolgenError::Tokenization(_))
    ));
    assert_eq!(model.calls.get(), 0);
}

#[test]
fn test_cache_drift_aborts_the_batch() {
    let tokenizer = letters(4, 10);
    let mut model = ScriptedModel::new(8, 10, |_: &[usize]| one_hot(8, 4));
    model.forget_steps = true;
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();

    assert!(matches!(
        engine.sample(&["", "C"]),
        Err(MolgenError::CacheConsistency(_))
    ));
}

#[test]
fn test_batch_width_must_match_max_length() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, cycling);
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();

    let batch = tokenizer.tokenize_prefixes(&["C"], 6).unwrap();
    assert!(matches!(
        engine.generate(batch),
        Err(MolgenError::Configuration(_))
    ));
}

/// Rows starting with C end right after their first free token; every other
/// row spreads its mass over N, O and S and never ends early.
fn early_stop(history: &[usize]) -> Vec<f32> {
    let mut logits = vec![f32::NEG_INFINITY; 8];
    if history.get(1) == Some(&4) && history.len() >= 3 {
        logits[EOS] = 0.0;
    } else {
        logits[5..8].iter_mut().for_each(|v| *v = 0.0);
    }
    logits
}

#[test]
fn test_finished_rows_stay_frozen_under_sampling() {
    let tokenizer = letters(4, 10);
    let model = ScriptedModel::new(8, 10, early_stop);

    for params in [
        SamplingParams {
            top_k: Some(2),
            seed: Some(11),
            ..SamplingParams::default()
        },
        SamplingParams {
            top_p: Some(0.8),
            temperature: 0.7,
            seed: Some(11),
            ..SamplingParams::default()
        },
    ] {
        let engine = SamplingEngine::new(&model, &tokenizer, params).unwrap();
        assert!(!matches!(engine.policy(), Policy::Greedy));

        let batch = tokenizer.tokenize_prefixes(&["C", "N", "OS"], 10).unwrap();
        let together = engine.generate(batch).unwrap();

        // row 0 is done after two selections while the others run to the end
        assert_eq!(together.sequences.lengths(), &[4, 10, 10]);
        assert_eq!(together.sequences.last(0), Some(EOS));
        assert!(together.sequences.padded_row(0)[4..].iter().all(|&id| id == 0));
        assert_eq!(together.log_probs[0].len(), 2);
        assert_eq!(together.log_probs[0][1], 0.0);
        assert_eq!(together.log_probs[1].len(), 8);
        assert_eq!(together.log_probs[2].len(), 7);
        assert!(!together.sequences.row(1).contains(&EOS));
        assert!(!together.sequences.row(2).contains(&EOS));
        assert_eq!(together.model_calls, 8);

        // the longer rows kept stepping without touching row 0
        let batch = tokenizer.tokenize_prefixes(&["C"], 10).unwrap();
        let alone = engine.generate(batch).unwrap();
        assert_eq!(alone.sequences.row(0), together.sequences.row(0));
        assert_eq!(alone.log_probs[0], together.log_probs[0]);
        assert_eq!(alone.entropies[0], together.entropies[0]);
        assert_eq!(alone.model_calls, 2);
    }
}

#[test]
fn test_resized_cache_is_a_consistency_error() {
    let tokenizer = letters(4, 10);
    let mut model = ScriptedModel::new(8, 10, |_: &[usize]| one_hot(8, 4));
    model.resize_cache = true;
    let engine = SamplingEngine::new(&model, &tokenizer, greedy(None)).unwrap();

    assert!(matches!(
        engine.sample(&["", "C"]),
        Err(MolgenError::CacheConsistency(_))
    ));
    assert_eq!(model.calls.get(), 2);
}

use rand::Rng;

/// W(d, n) * x(n,) -> out(d,)
pub fn matmul(out: &mut [f32], w: &[f32], x: &[f32], n: usize, d: usize) {
    debug_assert_eq!(w.len(), d * n);
    debug_assert_eq!(out.len(), d);
    debug_assert_eq!(x.len(), n);

    for (row, o) in w.chunks_exact(n).zip(out.iter_mut()) {
        *o = row
            .iter()
            .zip(x.iter())
            .fold(0f32, |acc, (&w, &x)| acc + w * x);
    }
}

/// W(d, n) * x(n,) + b(d,) -> out(d,)
pub fn linear(out: &mut [f32], w: &[f32], b: &[f32], x: &[f32], n: usize, d: usize) {
    debug_assert_eq!(b.len(), d);
    matmul(out, w, x, n, d);
    add_inplace(out, b);
}

pub fn add_inplace(x: &mut [f32], y: &[f32]) {
    debug_assert_eq!(x.len(), y.len());
    x.iter_mut().zip(y.iter()).for_each(|(x, y)| *x += y);
}

pub fn relu(x: &mut [f32]) {
    x.iter_mut().for_each(|v| *v = v.max(0.0));
}

/// y = (x - mean) / sqrt(var + eps) * gamma + beta, in place
pub fn layernorm(x: &mut [f32], gamma: &[f32], beta: &[f32], eps: f32) {
    debug_assert_eq!(x.len(), gamma.len());
    debug_assert_eq!(x.len(), beta.len());

    let n = x.len() as f32;
    let mean = x.iter().sum::<f32>() / n;
    let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let inv = 1.0 / (var + eps).sqrt();
    x.iter_mut()
        .zip(gamma.iter().zip(beta.iter()))
        .for_each(|(x, (g, b))| *x = (*x - mean) * inv * g + b);
}

/// Index of the largest value; the lowest index wins ties.
pub fn argmax(x: &[f32]) -> usize {
    debug_assert!(!x.is_empty());
    x.iter()
        .enumerate()
        .fold(None::<(usize, f32)>, |best, (i, &v)| match best {
            Some((_, b)) if v <= b => best,
            _ => Some((i, v)),
        })
        .map_or(0, |(index, _)| index)
}

pub fn softmax(x: &mut [f32]) {
    debug_assert!(!x.is_empty());
    let max_val = x.iter().fold(f32::NAN, |acc, &v| v.max(acc));
    let mut sum = 0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    x.iter_mut().for_each(|v| *v /= sum);
}

pub fn log_softmax(x: &[f32]) -> Vec<f32> {
    let max_val = x.iter().fold(f32::NAN, |acc, &v| v.max(acc));
    let log_sum = x.iter().map(|v| (v - max_val).exp()).sum::<f32>().ln() + max_val;
    x.iter().map(|v| v - log_sum).collect()
}

/// Shannon entropy (nats) of a log-probability vector; zero-probability
/// entries contribute nothing.
pub fn entropy(log_probs: &[f32]) -> f32 {
    -log_probs
        .iter()
        .filter(|lp| lp.is_finite())
        .map(|&lp| lp.exp() * lp)
        .sum::<f32>()
}

/// Draws an index from a categorical distribution. `probs` need not be
/// normalized.
pub fn sample<R: Rng>(probs: &[f32], rng: &mut R) -> usize {
    let total: f32 = probs.iter().sum();
    let r = rng.gen::<f32>() * total;

    let mut cdf = 0f32;
    for (idx, p) in probs.iter().enumerate() {
        cdf += *p;
        if r < cdf {
            return idx;
        }
    }
    // rounding left r at the very top of the cdf
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(probs.len() - 1)
}

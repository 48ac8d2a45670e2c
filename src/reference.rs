//! Sequential single-threaded forward pass.
//!
//! Every function here is the plain loop version of a device kernel and is
//! what the parity tests compare against. Dot products accumulate in the
//! same order as the kernels; reductions are sequential instead of trees.

use crate::config::ModelConfig;
use crate::error::{EngineError, EngineResult};
use crate::state::KvCacheLayout;
use crate::weights::{WeightRole, Weights};

/// `out[i] = weight[i] * x[i] / sqrt(mean(x^2) + eps)`
pub fn rmsnorm(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
    let size = x.len();
    let mut ss = 0.0f32;
    for v in x {
        ss += v * v;
    }
    let scale = 1.0 / (ss / size as f32 + eps).sqrt();
    for i in 0..size {
        out[i] = weight[i] * (scale * x[i]);
    }
}

/// `out = W x` with `W` row-major `[out_dim][in_dim]`.
pub fn matvec(out: &mut [f32], x: &[f32], w: &[f32], in_dim: usize, out_dim: usize) {
    for row in 0..out_dim {
        let wr = &w[row * in_dim..(row + 1) * in_dim];
        let mut acc = 0.0f32;
        for j in 0..in_dim {
            acc += wr[j] * x[j];
        }
        out[row] = acc;
    }
}

/// Rotate consecutive pairs of `q` and the first `k.len()` values of `k`.
pub fn rope(q: &mut [f32], k: &mut [f32], position: usize, head_size: usize, theta: f32) {
    for i in (0..q.len()).step_by(2) {
        let head_dim = i % head_size;
        let freq = 1.0 / theta.powf(head_dim as f32 / head_size as f32);
        let angle = position as f32 * freq;
        let (sin, cos) = angle.sin_cos();
        rotate(q, i, cos, sin);
        if i < k.len() {
            rotate(k, i, cos, sin);
        }
    }
}

fn rotate(v: &mut [f32], i: usize, cos: f32, sin: f32) {
    let (v0, v1) = (v[i], v[i + 1]);
    v[i] = v0 * cos - v1 * sin;
    v[i + 1] = v0 * sin + v1 * cos;
}

/// Numerically stable softmax in place.
pub fn softmax(x: &mut [f32]) {
    let mut max = f32::NEG_INFINITY;
    for v in x.iter() {
        max = max.max(*v);
    }
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

pub fn silu(v: f32) -> f32 {
    v / (1.0 + (-v).exp())
}

/// Causal attention of every query head over cache positions `0..=position`
/// of `layer`. Query head `h` reads kv head `h / kv_mul`.
#[allow(clippy::too_many_arguments)]
pub fn attention(
    out: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    cache: &KvCacheLayout,
    layer: usize,
    position: usize,
    kv_mul: usize,
) {
    let hs = cache.head_size;
    let n_heads = q.len() / hs;
    let scale = (hs as f32).sqrt();
    let mut att = vec![0.0f32; position + 1];
    for h in 0..n_heads {
        let qh = &q[h * hs..(h + 1) * hs];
        let kv_head = h / kv_mul;
        for (t, score) in att.iter_mut().enumerate() {
            let kt = &key_cache[cache.head_offset(layer, t, kv_head)..][..hs];
            let mut dot = 0.0f32;
            for i in 0..hs {
                dot += qh[i] * kt[i];
            }
            *score = dot / scale;
        }
        softmax(&mut att);
        for i in 0..hs {
            let mut acc = 0.0f32;
            for (t, weight) in att.iter().enumerate() {
                acc += weight * value_cache[cache.head_offset(layer, t, kv_head) + i];
            }
            out[h * hs + i] = acc;
        }
    }
}

/// `out = W2 (silu(W1 x) * W3 x)` for one layer's weights.
pub fn swiglu_ffn(out: &mut [f32], x: &[f32], w1: &[f32], w2: &[f32], w3: &[f32], hidden: usize) {
    let dim = x.len();
    let mut hb = vec![0.0f32; hidden];
    let mut hb2 = vec![0.0f32; hidden];
    matvec(&mut hb, x, w1, dim, hidden);
    matvec(&mut hb2, x, w3, dim, hidden);
    for i in 0..hidden {
        hb[i] = silu(hb[i]) * hb2[i];
    }
    matvec(out, &hb, w2, hidden, dim);
}

fn layer_slice(w: &[f32], layer: usize, len: usize) -> &[f32] {
    &w[layer * len..(layer + 1) * len]
}

/// The whole model run sequentially with its own KV cache.
pub struct ReferenceModel {
    config: ModelConfig,
    weights: Weights,
    cache: KvCacheLayout,
    key_cache: Vec<f32>,
    value_cache: Vec<f32>,
    position: usize,
}

impl ReferenceModel {
    pub fn new(config: ModelConfig, weights: Weights) -> EngineResult<Self> {
        config.validate()?;
        let cache = KvCacheLayout::new(&config);
        Ok(Self {
            key_cache: vec![0.0; cache.len()],
            value_cache: vec![0.0; cache.len()],
            config,
            weights,
            cache,
            position: 0,
        })
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn key_cache(&self) -> &[f32] {
        &self.key_cache
    }

    pub fn value_cache(&self) -> &[f32] {
        &self.value_cache
    }

    pub fn forward(&mut self, token: u32) -> EngineResult<Vec<f32>> {
        let c = &self.config;
        let pos = self.position;
        if pos >= c.context_length {
            return Err(EngineError::ContextOverflow {
                position: pos,
                context_length: c.context_length,
            });
        }
        let w = &self.weights;
        let (dim, kv_dim, hidden) = (c.dim, c.kv_dim(), c.hidden_dim);

        let mut x = w.embedding(c, token)?.to_vec();
        let mut xb = vec![0.0f32; dim];
        let mut xb2 = vec![0.0f32; dim];
        let mut q = vec![0.0f32; dim];
        let mut k = vec![0.0f32; kv_dim];
        let mut v = vec![0.0f32; kv_dim];

        for l in 0..c.n_layers {
            rmsnorm(&mut xb, &x, layer_slice(w.get(WeightRole::RmsAttention), l, dim), c.norm_eps);

            matvec(&mut q, &xb, layer_slice(w.get(WeightRole::Wq), l, dim * dim), dim, dim);
            matvec(&mut k, &xb, layer_slice(w.get(WeightRole::Wk), l, kv_dim * dim), dim, kv_dim);
            matvec(&mut v, &xb, layer_slice(w.get(WeightRole::Wv), l, kv_dim * dim), dim, kv_dim);
            rope(&mut q, &mut k, pos, c.head_size(), c.rope_theta);

            let slot = self.cache.offset(l, pos);
            self.key_cache[slot..slot + kv_dim].copy_from_slice(&k);
            self.value_cache[slot..slot + kv_dim].copy_from_slice(&v);

            attention(
                &mut xb,
                &q,
                &self.key_cache,
                &self.value_cache,
                &self.cache,
                l,
                pos,
                c.kv_mul(),
            );

            matvec(&mut xb2, &xb, layer_slice(w.get(WeightRole::Wo), l, dim * dim), dim, dim);
            for i in 0..dim {
                x[i] += xb2[i];
            }

            rmsnorm(&mut xb, &x, layer_slice(w.get(WeightRole::RmsFfn), l, dim), c.norm_eps);
            swiglu_ffn(
                &mut xb2,
                &xb,
                layer_slice(w.get(WeightRole::W1), l, hidden * dim),
                layer_slice(w.get(WeightRole::W2), l, dim * hidden),
                layer_slice(w.get(WeightRole::W3), l, hidden * dim),
                hidden,
            );
            for i in 0..dim {
                x[i] += xb2[i];
            }
        }

        rmsnorm(&mut xb, &x, w.get(WeightRole::RmsFinal), c.norm_eps);
        let mut logits = vec![0.0f32; c.vocab_size];
        matvec(&mut logits, &xb, w.get(WeightRole::Classifier), dim, c.vocab_size);

        self.position += 1;
        Ok(logits)
    }
}

//! Flattened weight buffers, one per role.
//!
//! Per-layer matrices of every layer are stacked into a single row-major
//! buffer and addressed as `layer * out_dim * in_dim + row * in_dim + col`,
//! so a statically built kernel can select the active layer from the cursor.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::{BufferId, BufferRegistry};
use crate::config::ModelConfig;
use crate::error::{EngineError, EngineResult};

/// What a weight buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightRole {
    TokenEmbedding,
    RmsAttention,
    Wq,
    Wk,
    Wv,
    Wo,
    RmsFfn,
    W1,
    W2,
    W3,
    RmsFinal,
    Classifier,
}

impl WeightRole {
    pub const ALL: [WeightRole; 12] = [
        WeightRole::TokenEmbedding,
        WeightRole::RmsAttention,
        WeightRole::Wq,
        WeightRole::Wk,
        WeightRole::Wv,
        WeightRole::Wo,
        WeightRole::RmsFfn,
        WeightRole::W1,
        WeightRole::W2,
        WeightRole::W3,
        WeightRole::RmsFinal,
        WeightRole::Classifier,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WeightRole::TokenEmbedding => "token_embedding",
            WeightRole::RmsAttention => "rms_att_weight",
            WeightRole::Wq => "wq",
            WeightRole::Wk => "wk",
            WeightRole::Wv => "wv",
            WeightRole::Wo => "wo",
            WeightRole::RmsFfn => "rms_ffn_weight",
            WeightRole::W1 => "w1",
            WeightRole::W2 => "w2",
            WeightRole::W3 => "w3",
            WeightRole::RmsFinal => "rms_final_weight",
            WeightRole::Classifier => "wcls",
        }
    }

    /// Element count for `config`.
    pub fn len(self, config: &ModelConfig) -> usize {
        let dim = config.dim;
        let layers = config.n_layers;
        let hidden = config.hidden_dim;
        let kv_dim = config.kv_dim();
        match self {
            WeightRole::TokenEmbedding | WeightRole::Classifier => config.vocab_size * dim,
            WeightRole::RmsAttention | WeightRole::RmsFfn => layers * dim,
            WeightRole::Wq | WeightRole::Wo => layers * dim * dim,
            WeightRole::Wk | WeightRole::Wv => layers * kv_dim * dim,
            WeightRole::W1 | WeightRole::W2 | WeightRole::W3 => layers * hidden * dim,
            WeightRole::RmsFinal => dim,
        }
    }

    fn is_norm(self) -> bool {
        matches!(
            self,
            WeightRole::RmsAttention | WeightRole::RmsFfn | WeightRole::RmsFinal
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Immutable model weights.
#[derive(Debug, Clone)]
pub struct Weights {
    tensors: Vec<Vec<f32>>,
}

impl Weights {
    /// Assemble weights from `(role, data)` pairs. Every role must be present
    /// exactly once with the length `config` implies.
    pub fn new(config: &ModelConfig, parts: Vec<(WeightRole, Vec<f32>)>) -> EngineResult<Self> {
        config.validate()?;
        let mut tensors: Vec<Option<Vec<f32>>> = vec![None; WeightRole::ALL.len()];
        for (role, data) in parts {
            let expected = role.len(config);
            if data.len() != expected {
                return Err(EngineError::Bounds {
                    buffer: role.name().to_string(),
                    kernel: "weights".to_string(),
                    required: expected,
                    actual: data.len(),
                });
            }
            tensors[role.index()] = Some(data);
        }
        let tensors = WeightRole::ALL
            .iter()
            .map(|&role| {
                tensors[role.index()].take().ok_or_else(|| EngineError::Bounds {
                    buffer: role.name().to_string(),
                    kernel: "weights".to_string(),
                    required: role.len(config),
                    actual: 0,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self { tensors })
    }

    /// Deterministic synthetic weights: projections uniform in ±1/sqrt(fan_in),
    /// norm weights around 1.
    pub fn random(config: &ModelConfig, seed: u64) -> EngineResult<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let parts = WeightRole::ALL
            .iter()
            .map(|&role| {
                let len = role.len(config);
                let data: Vec<f32> = if role.is_norm() {
                    (0..len).map(|_| rng.gen_range(0.8..1.2)).collect()
                } else {
                    let fan_in = match role {
                        WeightRole::W2 => config.hidden_dim,
                        _ => config.dim,
                    };
                    let bound = 1.0 / (fan_in as f32).sqrt();
                    (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
                };
                (role, data)
            })
            .collect();
        Self::new(config, parts)
    }

    pub fn get(&self, role: WeightRole) -> &[f32] {
        &self.tensors[role.index()]
    }

    /// Embedding row of `token`.
    pub fn embedding(&self, config: &ModelConfig, token: u32) -> EngineResult<&[f32]> {
        embedding_row(
            self.get(WeightRole::TokenEmbedding),
            config.dim,
            config.vocab_size,
            token,
        )
    }

    /// Move every device-side role into `registry` without copying. The
    /// embedding table stays on the host; rows are copied into `x` per token.
    pub fn into_registry(
        mut self,
        config: &ModelConfig,
        registry: &mut BufferRegistry,
    ) -> (WeightBuffers, TokenEmbedding) {
        let mut take = |role: WeightRole| std::mem::take(&mut self.tensors[role.index()]);
        let embedding = TokenEmbedding {
            table: take(WeightRole::TokenEmbedding),
            dim: config.dim,
            vocab_size: config.vocab_size,
        };
        let mut add = |role: WeightRole| registry.register_f32(role.name(), take(role));
        let buffers = WeightBuffers {
            rms_att: add(WeightRole::RmsAttention),
            wq: add(WeightRole::Wq),
            wk: add(WeightRole::Wk),
            wv: add(WeightRole::Wv),
            wo: add(WeightRole::Wo),
            rms_ffn: add(WeightRole::RmsFfn),
            w1: add(WeightRole::W1),
            w2: add(WeightRole::W2),
            w3: add(WeightRole::W3),
            rms_final: add(WeightRole::RmsFinal),
            wcls: add(WeightRole::Classifier),
        };
        (buffers, embedding)
    }
}

fn embedding_row(table: &[f32], dim: usize, vocab_size: usize, token: u32) -> EngineResult<&[f32]> {
    let token_index = token as usize;
    if token_index >= vocab_size {
        return Err(EngineError::TokenOutOfRange { token, vocab_size });
    }
    let start = token_index * dim;
    Ok(&table[start..start + dim])
}

/// The token embedding table, the only weight kept on the host.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    table: Vec<f32>,
    dim: usize,
    vocab_size: usize,
}

impl TokenEmbedding {
    pub fn row(&self, token: u32) -> EngineResult<&[f32]> {
        embedding_row(&self.table, self.dim, self.vocab_size, token)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

/// Registry ids of the device-side weight buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightBuffers {
    pub rms_att: BufferId,
    pub wq: BufferId,
    pub wk: BufferId,
    pub wv: BufferId,
    pub wo: BufferId,
    pub rms_ffn: BufferId,
    pub w1: BufferId,
    pub w2: BufferId,
    pub w3: BufferId,
    pub rms_final: BufferId,
    pub wcls: BufferId,
}

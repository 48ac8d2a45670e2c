//! Model hyperparameters and launch configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::DeviceKind;
use crate::error::{ConfigError, EngineError, EngineResult};
use crate::layout::MAX_GROUP_SIZE;

/// Immutable transformer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model (residual stream) dimension.
    pub dim: usize,
    /// Feed-forward hidden dimension.
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    /// Key/value heads; `n_heads / n_kv_heads` query heads share each one.
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    /// Maximum number of positions held by the KV cache.
    pub context_length: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
}

fn default_norm_eps() -> f32 {
    1e-5
}

fn default_rope_theta() -> f32 {
    10000.0
}

impl ModelConfig {
    /// Build and validate a configuration.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        hidden_dim: usize,
        n_layers: usize,
        n_heads: usize,
        n_kv_heads: usize,
        vocab_size: usize,
        context_length: usize,
        norm_eps: f32,
        rope_theta: f32,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            vocab_size,
            context_length,
            norm_eps,
            rope_theta,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the dimension ratios the kernels' index arithmetic relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("context_length", self.context_length),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        if self.dim % self.n_heads != 0 {
            return Err(ConfigError::HeadsDoNotDivideDim {
                dim: self.dim,
                n_heads: self.n_heads,
            });
        }
        if self.n_heads % self.n_kv_heads != 0 || (self.dim * self.n_kv_heads) % self.n_heads != 0 {
            return Err(ConfigError::KvHeadsDoNotDivideHeads {
                n_heads: self.n_heads,
                n_kv_heads: self.n_kv_heads,
            });
        }
        let head_size = self.dim / self.n_heads;
        if head_size % 2 != 0 {
            return Err(ConfigError::OddHeadSize { head_size });
        }
        let (layers, dim, kv_dim) = (self.n_layers, self.dim, self.kv_dim());
        indexed_len("wcls", &[self.vocab_size, dim])?;
        indexed_len("wq", &[layers, dim, dim])?;
        indexed_len("wk", &[layers, kv_dim, dim])?;
        indexed_len("w1", &[layers, self.hidden_dim, dim])?;
        indexed_len("att", &[self.n_heads, self.context_length])?;
        indexed_len("key_cache", &[layers, self.context_length, kv_dim])?;
        Ok(())
    }

    #[inline]
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Width of one position's key (or value) vector across all kv heads.
    #[inline]
    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Query heads per key/value head.
    #[inline]
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }
}

/// Device kernels index buffers with `u32`.
pub const MAX_INDEXED_LEN: usize = u32::MAX as usize;

fn indexed_len(name: &'static str, factors: &[usize]) -> Result<usize, ConfigError> {
    let len = factors.iter().try_fold(1usize, |acc, &f| acc.checked_mul(f));
    match len {
        Some(len) if len <= MAX_INDEXED_LEN => Ok(len),
        _ => Err(ConfigError::IndexOverflow {
            name,
            len: len.unwrap_or(usize::MAX),
        }),
    }
}

/// Narrow a length or offset to the 32-bit index a kernel receives.
pub fn index_u32(name: &'static str, value: usize) -> Result<u32, ConfigError> {
    u32::try_from(value).map_err(|_| ConfigError::IndexOverflow { name, len: value })
}

/// Which projection and feed-forward kernels the forward graph uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelPlan {
    /// One thread per output row; residual adds and SwiGLU as separate kernels.
    #[default]
    Basic,
    /// One workgroup per output row with a tree reduction. The output
    /// projections add into the residual stream directly and the gate and up
    /// projections run as one fused SwiGLU kernel.
    Fused,
}

/// Which attention kernels the forward graph uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKernel {
    /// Scores, max, exp-sum and weighted sum as four launches.
    #[default]
    Staged,
    /// One thread per head runs the whole softmax sequentially.
    PerHead,
    /// One workgroup per head with a tiled online softmax; no score buffer.
    Flash,
}

/// Work-group sizes and kernel choices used when the forward graph is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Group size of the RMSNorm sum-of-squares reduction (power of two).
    pub norm_group_size: u32,
    /// Group size for projections, rotation, cache writes and elementwise kernels.
    pub linear_group_size: u32,
    /// Threads cooperating on one attention head (power of two).
    pub head_group_size: u32,
    /// Threads cooperating on one matrix row under [`KernelPlan::Fused`] (power of two).
    #[serde(default = "default_row_group_size")]
    pub row_group_size: u32,
    #[serde(default)]
    pub kernels: KernelPlan,
    #[serde(default)]
    pub attention: AttentionKernel,
}

fn default_row_group_size() -> u32 {
    32
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            norm_group_size: 256,
            linear_group_size: 64,
            head_group_size: 64,
            row_group_size: default_row_group_size(),
            kernels: KernelPlan::default(),
            attention: AttentionKernel::default(),
        }
    }
}

impl LaunchConfig {
    /// Pick the largest power-of-two norm group (up to 256) that divides `dim`,
    /// so the partial sums cover the vector without a ragged last group.
    pub fn for_model(config: &ModelConfig) -> Self {
        let mut norm = MAX_GROUP_SIZE;
        while norm > 1 && config.dim % norm as usize != 0 {
            norm /= 2;
        }
        let head = config
            .context_length
            .max(config.head_size())
            .next_power_of_two()
            .min(64) as u32;
        Self {
            norm_group_size: norm,
            linear_group_size: 64,
            head_group_size: head,
            ..Self::default()
        }
    }

    pub fn with_kernels(mut self, kernels: KernelPlan) -> Self {
        self.kernels = kernels;
        self
    }

    pub fn with_attention(mut self, attention: AttentionKernel) -> Self {
        self.attention = attention;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        let groups = [
            ("norm_group_size", self.norm_group_size, true),
            ("linear_group_size", self.linear_group_size, false),
            ("head_group_size", self.head_group_size, true),
            ("row_group_size", self.row_group_size, true),
        ];
        for (name, size, needs_pow2) in groups {
            if size == 0 || size > MAX_GROUP_SIZE {
                return Err(EngineError::Layout {
                    kernel: name.to_string(),
                    reason: format!("group size {size} outside 1..={MAX_GROUP_SIZE}"),
                });
            }
            if needs_pow2 && !size.is_power_of_two() {
                return Err(EngineError::Layout {
                    kernel: name.to_string(),
                    reason: format!("reduction group size {size} is not a power of two"),
                });
            }
        }
        Ok(())
    }
}

/// Everything needed to stand up an [`InferenceEngine`](crate::engine::InferenceEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: ModelConfig,
    pub launch: LaunchConfig,
    pub device: DeviceKind,
}

impl EngineConfig {
    /// Model config with launch sizes derived from it and the device taken
    /// from `GLLM_DEVICE` (defaults to auto-detection).
    pub fn new(model: ModelConfig) -> Self {
        let launch = LaunchConfig::for_model(&model);
        Self {
            model,
            launch,
            device: DeviceKind::from_env(),
        }
    }

    pub fn with_device(mut self, device: DeviceKind) -> Self {
        self.device = device;
        self
    }

    pub fn with_launch(mut self, launch: LaunchConfig) -> Self {
        self.launch = launch;
        self
    }
}

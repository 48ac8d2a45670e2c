//! Per-inference mutable buffers and the index arithmetic over them.

use crate::buffer::{BufferId, BufferRegistry};
use crate::config::{index_u32, ModelConfig};
use crate::error::{EngineError, EngineResult};
use crate::kernels::{CURSOR_CACHE_OFFSET, CURSOR_LAYER, CURSOR_LEN, CURSOR_POSITION};

/// Flat layout of one key or value cache: `[layer][position][kv_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvCacheLayout {
    pub n_layers: usize,
    pub context_length: usize,
    pub kv_dim: usize,
    pub head_size: usize,
}

impl KvCacheLayout {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            n_layers: config.n_layers,
            context_length: config.context_length,
            kv_dim: config.kv_dim(),
            head_size: config.head_size(),
        }
    }

    /// Elements in one cache buffer.
    pub fn len(&self) -> usize {
        self.n_layers * self.context_length * self.kv_dim
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn offset(&self, layer: usize, position: usize) -> usize {
        layer * self.context_length * self.kv_dim + position * self.kv_dim
    }

    #[inline]
    pub fn head_offset(&self, layer: usize, position: usize, kv_head: usize) -> usize {
        self.offset(layer, position) + kv_head * self.head_size
    }

    /// The `kv_dim` values stored for `(layer, position)`.
    pub fn slot<'a>(&self, cache: &'a [f32], layer: usize, position: usize) -> &'a [f32] {
        let start = self.offset(layer, position);
        &cache[start..start + self.kv_dim]
    }
}

/// Host-side sequence position and active layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub position: usize,
    pub layer: usize,
}

impl Cursor {
    /// Device words `[position, layer, cache_offset]`. Fails when a word does
    /// not fit in 32 bits.
    pub fn words(&self, cache: &KvCacheLayout) -> EngineResult<[u32; CURSOR_LEN]> {
        let mut words = [0u32; CURSOR_LEN];
        words[CURSOR_POSITION] = index_u32("position", self.position)?;
        words[CURSOR_LAYER] = index_u32("layer", self.layer)?;
        words[CURSOR_CACHE_OFFSET] = index_u32("cache_offset", cache.offset(self.layer, self.position))?;
        Ok(words)
    }
}

/// Buffer ids of every activation, scratch and cache buffer of one inference context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelState {
    /// Residual stream, `dim`.
    pub x: BufferId,
    /// Normalized activations and attention output, `dim`.
    pub xb: BufferId,
    /// Output projection before the residual add, `dim`.
    pub xb2: BufferId,
    pub hb: BufferId,
    pub hb2: BufferId,
    pub q: BufferId,
    pub k: BufferId,
    pub v: BufferId,
    /// Scores, `n_heads * context_length`.
    pub att: BufferId,
    pub att_max: BufferId,
    pub att_sum: BufferId,
    pub reduce_att: BufferId,
    pub reduce_ffn: BufferId,
    pub reduce_final: BufferId,
    pub logits: BufferId,
    pub key_cache: BufferId,
    pub value_cache: BufferId,
    pub cursor: BufferId,
    pub cache: KvCacheLayout,
}

impl ModelState {
    /// Register every state buffer, zero-filled. `reduce_groups` is the number
    /// of partial sums the norm reductions produce.
    pub fn register(config: &ModelConfig, reduce_groups: usize, registry: &mut BufferRegistry) -> Self {
        let cache = KvCacheLayout::new(config);
        let dim = config.dim;
        let kv_dim = config.kv_dim();
        let reduce_len = reduce_groups.max(1);
        Self {
            x: registry.zeros_f32("x", dim),
            xb: registry.zeros_f32("xb", dim),
            xb2: registry.zeros_f32("xb2", dim),
            hb: registry.zeros_f32("hb", config.hidden_dim),
            hb2: registry.zeros_f32("hb2", config.hidden_dim),
            q: registry.zeros_f32("q", dim),
            k: registry.zeros_f32("k", kv_dim),
            v: registry.zeros_f32("v", kv_dim),
            att: registry.zeros_f32("att", config.n_heads * config.context_length),
            att_max: registry.zeros_f32("att_max", config.n_heads),
            att_sum: registry.zeros_f32("att_sum", config.n_heads),
            reduce_att: registry.zeros_f32("reduce_att", reduce_len),
            reduce_ffn: registry.zeros_f32("reduce_ffn", reduce_len),
            reduce_final: registry.zeros_f32("reduce_final", reduce_len),
            logits: registry.zeros_f32("logits", config.vocab_size),
            key_cache: registry.zeros_f32("key_cache", cache.len()),
            value_cache: registry.zeros_f32("value_cache", cache.len()),
            cursor: registry.register_u32("cursor", vec![0; CURSOR_LEN]),
            cache,
        }
    }

    /// Write the cursor words into the host mirror of the cursor buffer.
    pub fn set_cursor(&self, cursor: Cursor, registry: &mut BufferRegistry) -> EngineResult<()> {
        if cursor.position >= self.cache.context_length {
            return Err(EngineError::ContextOverflow {
                position: cursor.position,
                context_length: self.cache.context_length,
            });
        }
        let words = cursor.words(&self.cache)?;
        registry.u32_mut(self.cursor)?.copy_from_slice(&words);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn config() -> ModelConfig {
        ModelConfig::new(32, 64, 2, 4, 2, 256, 8, 1e-5, 10000.0).unwrap()
    }

    #[test]
    fn cache_offsets() {
        let layout = KvCacheLayout::new(&config());
        assert_eq!(layout.kv_dim, 16);
        assert_eq!(layout.len(), 2 * 8 * 16);
        assert_eq!(layout.offset(1, 3), 8 * 16 + 3 * 16);
        assert_eq!(layout.head_offset(1, 3, 1), 8 * 16 + 3 * 16 + 8);
    }

    #[test]
    fn cursor_words_carry_cache_offset() {
        let layout = KvCacheLayout::new(&config());
        let words = Cursor {
            position: 5,
            layer: 1,
        }
        .words(&layout)
        .unwrap();
        assert_eq!(words, [5, 1, 128 + 80]);
    }

    #[test]
    fn cursor_words_never_wrap() {
        // an unvalidated layout whose last slot starts past u32::MAX
        let layout = KvCacheLayout {
            n_layers: 40,
            context_length: 131072,
            kv_dim: 1024,
            head_size: 128,
        };
        let cursor = Cursor {
            position: 131071,
            layer: 39,
        };
        assert!(layout.offset(39, 131071) > u32::MAX as usize);
        let err = cursor.words(&layout).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Config(ConfigError::IndexOverflow {
                name: "cache_offset",
                ..
            })
        ));

        let words = Cursor {
            position: 131071,
            layer: 0,
        }
        .words(&layout)
        .unwrap();
        assert_eq!(words[CURSOR_CACHE_OFFSET], 131071 * 1024);
    }

    #[test]
    fn set_cursor_rejects_overflow() {
        let mut registry = BufferRegistry::new();
        let state = ModelState::register(&config(), 1, &mut registry);
        state
            .set_cursor(Cursor { position: 7, layer: 1 }, &mut registry)
            .unwrap();
        assert_eq!(registry.u32(state.cursor).unwrap(), &[7, 1, 128 + 112]);

        let err = state
            .set_cursor(Cursor { position: 8, layer: 0 }, &mut registry)
            .unwrap_err();
        assert!(matches!(err, EngineError::ContextOverflow { position: 8, .. }));
    }
}

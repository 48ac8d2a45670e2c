//! Kernel library.
//!
//! Every data-parallel operation of the forward pass is one [`KernelOp`]
//! variant. A [`Kernel`] pairs an op with its [`ThreadLayout`]. Ops are plain
//! data: the CPU device interprets them with the SPMD emulator in [`spmd`],
//! the WGPU device maps each variant to one WGSL compute shader.
//!
//! Cursor words read by layered kernels: `[position, layer, cache_offset]`.

pub mod cpu;
pub mod params;
pub mod spmd;

use crate::buffer::{BufferId, BufferKind};
use crate::error::{EngineError, EngineResult};
use crate::layout::{ThreadLayout, MAX_GROUP_SIZE};

use params::*;

/// Index of the current sequence position in the cursor buffer.
pub const CURSOR_POSITION: usize = 0;
/// Index of the active layer in the cursor buffer.
pub const CURSOR_LAYER: usize = 1;
/// Index of the KV-cache write offset in the cursor buffer.
pub const CURSOR_CACHE_OFFSET: usize = 2;
/// Words in the cursor buffer.
pub const CURSOR_LEN: usize = 3;

/// Shape shared by the attention kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionDims {
    pub n_heads: u32,
    pub head_size: u32,
    pub kv_dim: u32,
    /// Query heads per key/value head.
    pub kv_mul: u32,
    pub context_length: u32,
    pub n_layers: u32,
}

impl AttentionDims {
    /// Elements in one key (or value) cache: every layer, every position.
    pub fn cache_len(&self) -> usize {
        self.n_layers as usize * self.context_length as usize * self.kv_dim as usize
    }

    /// Elements in the score scratch buffer: one row of `context_length` per head.
    pub fn att_len(&self) -> usize {
        self.n_heads as usize * self.context_length as usize
    }

    /// Elements in the query (and attention output) vector.
    pub fn q_len(&self) -> usize {
        self.n_heads as usize * self.head_size as usize
    }

    fn params(&self, logical: u32) -> ShaderParams {
        ShaderParams::Attention(AttentionParams {
            n_heads: self.n_heads,
            head_size: self.head_size,
            kv_dim: self.kv_dim,
            kv_mul: self.kv_mul,
            context_length: self.context_length,
            logical,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelOp {
    /// Per-group partial sum of squares of `input[0..size]` into `reduce[group]`.
    ReduceSumSquares {
        input: BufferId,
        reduce: BufferId,
        size: u32,
    },
    /// Single thread: `reduce[0] = 1 / sqrt(sum(reduce[0..partials]) / size + eps)`.
    FinishRmsNorm {
        reduce: BufferId,
        partials: u32,
        size: u32,
        eps: f32,
    },
    /// `out[i] = weight[layer * size + i] * (scale * input[i])`, scale from `reduce[0]`.
    /// `layer` is read from the cursor when one is bound, otherwise 0.
    ApplyRmsNorm {
        out: BufferId,
        input: BufferId,
        weight: BufferId,
        reduce: BufferId,
        cursor: Option<BufferId>,
        size: u32,
        layers: u32,
    },
    /// One thread per output row: `out[row] = sum_j weight[off + row * in_dim + j] * input[j]`
    /// with `off = layer * out_dim * in_dim`.
    MatVec {
        out: BufferId,
        input: BufferId,
        weight: BufferId,
        cursor: Option<BufferId>,
        in_dim: u32,
        out_dim: u32,
        layers: u32,
    },
    /// One group per output row: the threads stride over `in_dim` and combine
    /// their partial dot products with a tree reduction. With `accumulate` the
    /// row is added into `out` instead of stored.
    RowMatVec {
        out: BufferId,
        input: BufferId,
        weight: BufferId,
        cursor: Option<BufferId>,
        in_dim: u32,
        out_dim: u32,
        layers: u32,
        accumulate: bool,
    },
    /// One group per hidden row: `out[row] = silu(w1_row . input) * (w3_row . input)`.
    FusedSwiGlu {
        out: BufferId,
        input: BufferId,
        w1: BufferId,
        w3: BufferId,
        cursor: Option<BufferId>,
        in_dim: u32,
        hidden: u32,
        layers: u32,
    },
    /// Rotary embedding over `dim / 2` pairs of `q`, and of `k` for pairs below `kv_dim`.
    Rope {
        q: BufferId,
        k: BufferId,
        cursor: BufferId,
        dim: u32,
        kv_dim: u32,
        head_size: u32,
        theta: f32,
    },
    /// `cache[cache_offset + i] = src[i]` for `i < kv_dim`.
    CacheWrite {
        cache: BufferId,
        src: BufferId,
        cursor: BufferId,
        kv_dim: u32,
        cache_len: u32,
    },
    /// One group per head: `att[h, t] = q_h . key[t, h / kv_mul] / sqrt(head_size)` for `t <= position`.
    AttentionScores {
        att: BufferId,
        q: BufferId,
        key_cache: BufferId,
        cursor: BufferId,
        dims: AttentionDims,
    },
    /// One group per head: `att_max[h] = max(att[h, 0..=position])`.
    AttentionMax {
        att: BufferId,
        att_max: BufferId,
        cursor: BufferId,
        dims: AttentionDims,
    },
    /// One group per head: `att[h, t] = exp(att[h, t] - att_max[h])`, `att_sum[h] = sum_t att[h, t]`.
    AttentionExpSum {
        att: BufferId,
        att_max: BufferId,
        att_sum: BufferId,
        cursor: BufferId,
        dims: AttentionDims,
    },
    /// One group per head: normalize `att[h, 0..=position]` by `att_sum[h]`, then
    /// `out[h * head_size + i] = sum_t att[h, t] * value[t, h / kv_mul, i]`.
    AttentionWeightedSum {
        out: BufferId,
        att: BufferId,
        att_sum: BufferId,
        value_cache: BufferId,
        cursor: BufferId,
        dims: AttentionDims,
    },
    /// One thread per head runs scores, softmax and the weighted sum in
    /// sequence, using its row of `att` as scratch.
    AttentionHeads {
        out: BufferId,
        att: BufferId,
        q: BufferId,
        key_cache: BufferId,
        value_cache: BufferId,
        cursor: BufferId,
        dims: AttentionDims,
    },
    /// One group per head. Positions are scored a tile of `group_size` at a
    /// time and folded into the output with an online softmax, so no score
    /// buffer is needed.
    FlashAttention {
        out: BufferId,
        q: BufferId,
        key_cache: BufferId,
        value_cache: BufferId,
        cursor: BufferId,
        dims: AttentionDims,
    },
    /// `out[i] += input[i]`
    AddInPlace {
        out: BufferId,
        input: BufferId,
        len: u32,
    },
    /// `data[i] = data[i] / (1 + exp(-data[i]))`
    Silu { data: BufferId, len: u32 },
    /// `out[i] *= input[i]`
    MulInPlace {
        out: BufferId,
        input: BufferId,
        len: u32,
    },
}

/// How a kernel touches a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// One buffer argument of a kernel, with the smallest length the kernel indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub buffer: BufferId,
    pub access: Access,
    pub kind: BufferKind,
    pub min_len: usize,
}

impl Binding {
    fn f32(buffer: BufferId, access: Access, min_len: usize) -> Self {
        Self {
            buffer,
            access,
            kind: BufferKind::F32,
            min_len,
        }
    }

    fn cursor(buffer: BufferId) -> Self {
        Self {
            buffer,
            access: Access::Read,
            kind: BufferKind::U32,
            min_len: CURSOR_LEN,
        }
    }
}

impl KernelOp {
    pub fn name(&self) -> &'static str {
        match self {
            KernelOp::ReduceSumSquares { .. } => "reduce_sum_squares",
            KernelOp::FinishRmsNorm { .. } => "finish_rms_norm",
            KernelOp::ApplyRmsNorm { .. } => "apply_rms_norm",
            KernelOp::MatVec { .. } => "matvec",
            KernelOp::RowMatVec { .. } => "row_matvec",
            KernelOp::FusedSwiGlu { .. } => "fused_swiglu",
            KernelOp::Rope { .. } => "rope",
            KernelOp::CacheWrite { .. } => "cache_write",
            KernelOp::AttentionScores { .. } => "attention_scores",
            KernelOp::AttentionMax { .. } => "attention_max",
            KernelOp::AttentionExpSum { .. } => "attention_exp_sum",
            KernelOp::AttentionWeightedSum { .. } => "attention_weighted_sum",
            KernelOp::AttentionHeads { .. } => "attention_heads",
            KernelOp::FlashAttention { .. } => "flash_attention",
            KernelOp::AddInPlace { .. } => "add_in_place",
            KernelOp::Silu { .. } => "silu",
            KernelOp::MulInPlace { .. } => "mul_in_place",
        }
    }

    /// Kernels whose group-local tree reduction needs a power-of-two group.
    pub fn is_tree_reduction(&self) -> bool {
        matches!(
            self,
            KernelOp::ReduceSumSquares { .. }
                | KernelOp::AttentionMax { .. }
                | KernelOp::AttentionExpSum { .. }
                | KernelOp::RowMatVec { .. }
                | KernelOp::FusedSwiGlu { .. }
        )
    }

    /// The cursor buffer the op reads, if any.
    pub fn cursor(&self) -> Option<BufferId> {
        match *self {
            KernelOp::ApplyRmsNorm { cursor, .. }
            | KernelOp::MatVec { cursor, .. }
            | KernelOp::RowMatVec { cursor, .. }
            | KernelOp::FusedSwiGlu { cursor, .. } => cursor,
            KernelOp::Rope { cursor, .. }
            | KernelOp::CacheWrite { cursor, .. }
            | KernelOp::AttentionScores { cursor, .. }
            | KernelOp::AttentionMax { cursor, .. }
            | KernelOp::AttentionExpSum { cursor, .. }
            | KernelOp::AttentionWeightedSum { cursor, .. }
            | KernelOp::AttentionHeads { cursor, .. }
            | KernelOp::FlashAttention { cursor, .. } => Some(cursor),
            KernelOp::ReduceSumSquares { .. }
            | KernelOp::FinishRmsNorm { .. }
            | KernelOp::AddInPlace { .. }
            | KernelOp::Silu { .. }
            | KernelOp::MulInPlace { .. } => None,
        }
    }

    /// Check the cursor words a launch will read against the slices the op
    /// indexes with them: the layer against the stacked weights or cache, the
    /// position against the attention window and the cache offset against the
    /// cache. Both devices run this before every launch.
    pub fn check_cursor(&self, words: &[u32]) -> EngineResult<()> {
        let fail = |word: &str, required: usize, actual: usize| EngineError::Bounds {
            buffer: format!("cursor.{word}"),
            kernel: self.name().to_string(),
            required,
            actual,
        };
        if self.cursor().is_none() {
            return Ok(());
        }
        if words.len() < CURSOR_LEN {
            return Err(fail("len", CURSOR_LEN, words.len()));
        }
        let position = words[CURSOR_POSITION] as usize;
        let layer = words[CURSOR_LAYER] as usize;
        let layers = match *self {
            KernelOp::ApplyRmsNorm { layers, .. }
            | KernelOp::MatVec { layers, .. }
            | KernelOp::RowMatVec { layers, .. }
            | KernelOp::FusedSwiGlu { layers, .. } => Some(layers),
            _ => self.attention_dims().map(|d| d.n_layers),
        };
        if let Some(layers) = layers {
            if layer >= layers.max(1) as usize {
                return Err(fail("layer", layer + 1, layers.max(1) as usize));
            }
        }
        if let Some(dims) = self.attention_dims() {
            if position >= dims.context_length as usize {
                return Err(fail("position", position + 1, dims.context_length as usize));
            }
        }
        if let KernelOp::CacheWrite {
            kv_dim, cache_len, ..
        } = *self
        {
            let end = words[CURSOR_CACHE_OFFSET] as usize + kv_dim as usize;
            if end > cache_len as usize {
                return Err(fail("cache_offset", end, cache_len as usize));
            }
        }
        Ok(())
    }

    fn attention_dims(&self) -> Option<AttentionDims> {
        match *self {
            KernelOp::AttentionScores { dims, .. }
            | KernelOp::AttentionMax { dims, .. }
            | KernelOp::AttentionExpSum { dims, .. }
            | KernelOp::AttentionWeightedSum { dims, .. }
            | KernelOp::AttentionHeads { dims, .. }
            | KernelOp::FlashAttention { dims, .. } => Some(dims),
            _ => None,
        }
    }

    /// Buffer arguments in shader binding order (bindings 1..n; 0 is the uniform block).
    pub fn bindings(&self, layout: &ThreadLayout) -> Vec<Binding> {
        use Access::*;
        match *self {
            KernelOp::ReduceSumSquares {
                input,
                reduce,
                size,
            } => vec![
                Binding::f32(input, Read, size as usize),
                Binding::f32(reduce, Write, layout.num_groups() as usize),
            ],
            KernelOp::FinishRmsNorm {
                reduce, partials, ..
            } => vec![Binding::f32(reduce, ReadWrite, partials.max(1) as usize)],
            KernelOp::ApplyRmsNorm {
                out,
                input,
                weight,
                reduce,
                cursor,
                size,
                layers,
            } => {
                let mut bindings = vec![
                    Binding::f32(out, Write, size as usize),
                    Binding::f32(input, Read, size as usize),
                    Binding::f32(weight, Read, (layers.max(1) * size) as usize),
                    Binding::f32(reduce, Read, 1),
                ];
                bindings.extend(cursor.map(Binding::cursor));
                bindings
            }
            KernelOp::MatVec {
                out,
                input,
                weight,
                cursor,
                in_dim,
                out_dim,
                layers,
            } => {
                let per_layer = in_dim as usize * out_dim as usize;
                let mut bindings = vec![
                    Binding::f32(out, Write, out_dim as usize),
                    Binding::f32(input, Read, in_dim as usize),
                    Binding::f32(weight, Read, layers.max(1) as usize * per_layer),
                ];
                bindings.extend(cursor.map(Binding::cursor));
                bindings
            }
            KernelOp::RowMatVec {
                out,
                input,
                weight,
                cursor,
                in_dim,
                out_dim,
                layers,
                accumulate,
            } => {
                let per_layer = in_dim as usize * out_dim as usize;
                let out_access = if accumulate { ReadWrite } else { Write };
                let mut bindings = vec![
                    Binding::f32(out, out_access, out_dim as usize),
                    Binding::f32(input, Read, in_dim as usize),
                    Binding::f32(weight, Read, layers.max(1) as usize * per_layer),
                ];
                bindings.extend(cursor.map(Binding::cursor));
                bindings
            }
            KernelOp::FusedSwiGlu {
                out,
                input,
                w1,
                w3,
                cursor,
                in_dim,
                hidden,
                layers,
            } => {
                let stacked = layers.max(1) as usize * in_dim as usize * hidden as usize;
                let mut bindings = vec![
                    Binding::f32(out, Write, hidden as usize),
                    Binding::f32(input, Read, in_dim as usize),
                    Binding::f32(w1, Read, stacked),
                    Binding::f32(w3, Read, stacked),
                ];
                bindings.extend(cursor.map(Binding::cursor));
                bindings
            }
            KernelOp::Rope {
                q,
                k,
                cursor,
                dim,
                kv_dim,
                ..
            } => vec![
                Binding::f32(q, ReadWrite, dim as usize),
                Binding::f32(k, ReadWrite, kv_dim as usize),
                Binding::cursor(cursor),
            ],
            KernelOp::CacheWrite {
                cache,
                src,
                cursor,
                kv_dim,
                cache_len,
            } => vec![
                Binding::f32(cache, ReadWrite, cache_len as usize),
                Binding::f32(src, Read, kv_dim as usize),
                Binding::cursor(cursor),
            ],
            KernelOp::AttentionScores {
                att,
                q,
                key_cache,
                cursor,
                dims,
            } => vec![
                Binding::f32(att, Write, dims.att_len()),
                Binding::f32(q, Read, dims.q_len()),
                Binding::f32(key_cache, Read, dims.cache_len()),
                Binding::cursor(cursor),
            ],
            KernelOp::AttentionMax {
                att,
                att_max,
                cursor,
                dims,
            } => vec![
                Binding::f32(att, Read, dims.att_len()),
                Binding::f32(att_max, Write, dims.n_heads as usize),
                Binding::cursor(cursor),
            ],
            KernelOp::AttentionExpSum {
                att,
                att_max,
                att_sum,
                cursor,
                dims,
            } => vec![
                Binding::f32(att, ReadWrite, dims.att_len()),
                Binding::f32(att_max, Read, dims.n_heads as usize),
                Binding::f32(att_sum, Write, dims.n_heads as usize),
                Binding::cursor(cursor),
            ],
            KernelOp::AttentionWeightedSum {
                out,
                att,
                att_sum,
                value_cache,
                cursor,
                dims,
            } => vec![
                Binding::f32(out, Write, dims.q_len()),
                Binding::f32(att, ReadWrite, dims.att_len()),
                Binding::f32(att_sum, Read, dims.n_heads as usize),
                Binding::f32(value_cache, Read, dims.cache_len()),
                Binding::cursor(cursor),
            ],
            KernelOp::AttentionHeads {
                out,
                att,
                q,
                key_cache,
                value_cache,
                cursor,
                dims,
            } => vec![
                Binding::f32(out, Write, dims.q_len()),
                Binding::f32(att, Write, dims.att_len()),
                Binding::f32(q, Read, dims.q_len()),
                Binding::f32(key_cache, Read, dims.cache_len()),
                Binding::f32(value_cache, Read, dims.cache_len()),
                Binding::cursor(cursor),
            ],
            KernelOp::FlashAttention {
                out,
                q,
                key_cache,
                value_cache,
                cursor,
                dims,
            } => vec![
                Binding::f32(out, Write, dims.q_len()),
                Binding::f32(q, Read, dims.q_len()),
                Binding::f32(key_cache, Read, dims.cache_len()),
                Binding::f32(value_cache, Read, dims.cache_len()),
                Binding::cursor(cursor),
            ],
            KernelOp::AddInPlace { out, input, len } | KernelOp::MulInPlace { out, input, len } => {
                vec![
                    Binding::f32(out, ReadWrite, len as usize),
                    Binding::f32(input, Read, len as usize),
                ]
            }
            KernelOp::Silu { data, len } => vec![Binding::f32(data, ReadWrite, len as usize)],
        }
    }

    /// The uniform block the op's shader declares.
    pub fn params(&self, layout: &ThreadLayout) -> ShaderParams {
        let logical = layout.logical;
        match *self {
            KernelOp::ReduceSumSquares { size, .. } => ShaderParams::Reduce(ReduceParams {
                size,
                logical,
                ..Default::default()
            }),
            KernelOp::FinishRmsNorm {
                partials,
                size,
                eps,
                ..
            } => ShaderParams::FinishNorm(FinishNormParams {
                size,
                partials,
                eps,
                logical,
            }),
            KernelOp::ApplyRmsNorm { cursor, size, .. } => ShaderParams::ApplyNorm(ApplyNormParams {
                size,
                layered: cursor.is_some() as u32,
                logical,
                ..Default::default()
            }),
            KernelOp::MatVec {
                cursor,
                in_dim,
                out_dim,
                ..
            } => ShaderParams::MatVec(MatVecParams {
                in_dim,
                out_dim,
                layered: cursor.is_some() as u32,
                logical,
            }),
            KernelOp::RowMatVec {
                cursor,
                in_dim,
                out_dim,
                accumulate,
                ..
            } => ShaderParams::RowMatVec(RowMatVecParams {
                in_dim,
                out_dim,
                layered: cursor.is_some() as u32,
                accumulate: accumulate as u32,
                logical,
                ..Default::default()
            }),
            KernelOp::FusedSwiGlu {
                cursor,
                in_dim,
                hidden,
                ..
            } => ShaderParams::SwiGlu(SwiGluParams {
                in_dim,
                hidden,
                layered: cursor.is_some() as u32,
                logical,
            }),
            KernelOp::Rope {
                dim,
                kv_dim,
                head_size,
                theta,
                ..
            } => ShaderParams::Rope(RopeParams {
                dim,
                kv_dim,
                head_size,
                theta,
                logical,
                ..Default::default()
            }),
            KernelOp::CacheWrite {
                kv_dim, cache_len, ..
            } => ShaderParams::CacheWrite(CacheWriteParams {
                kv_dim,
                cache_len,
                logical,
                ..Default::default()
            }),
            KernelOp::AttentionScores { dims, .. }
            | KernelOp::AttentionMax { dims, .. }
            | KernelOp::AttentionExpSum { dims, .. }
            | KernelOp::AttentionWeightedSum { dims, .. }
            | KernelOp::AttentionHeads { dims, .. }
            | KernelOp::FlashAttention { dims, .. } => dims.params(logical),
            KernelOp::AddInPlace { len, .. }
            | KernelOp::Silu { len, .. }
            | KernelOp::MulInPlace { len, .. } => ShaderParams::Elementwise(ElementwiseParams {
                len,
                logical,
                ..Default::default()
            }),
        }
    }

    /// Threads that must be launched for the op to cover its output.
    fn required_threads(&self) -> Option<u32> {
        match *self {
            KernelOp::ReduceSumSquares { size, .. } | KernelOp::ApplyRmsNorm { size, .. } => {
                Some(size)
            }
            KernelOp::MatVec { out_dim, .. } => Some(out_dim),
            KernelOp::AttentionHeads { dims, .. } => Some(dims.n_heads),
            KernelOp::Rope { dim, .. } => Some(dim / 2),
            KernelOp::CacheWrite { kv_dim, .. } => Some(kv_dim),
            KernelOp::AddInPlace { len, .. }
            | KernelOp::Silu { len, .. }
            | KernelOp::MulInPlace { len, .. } => Some(len),
            KernelOp::FinishRmsNorm { .. }
            | KernelOp::RowMatVec { .. }
            | KernelOp::FusedSwiGlu { .. }
            | KernelOp::AttentionScores { .. }
            | KernelOp::AttentionMax { .. }
            | KernelOp::AttentionExpSum { .. }
            | KernelOp::AttentionWeightedSum { .. }
            | KernelOp::FlashAttention { .. } => None,
        }
    }

    /// Ops that map one group to one head or one matrix row.
    fn required_groups(&self) -> Option<u32> {
        match *self {
            KernelOp::AttentionScores { dims, .. }
            | KernelOp::AttentionMax { dims, .. }
            | KernelOp::AttentionExpSum { dims, .. }
            | KernelOp::AttentionWeightedSum { dims, .. }
            | KernelOp::FlashAttention { dims, .. } => Some(dims.n_heads),
            KernelOp::RowMatVec { out_dim, .. } => Some(out_dim),
            KernelOp::FusedSwiGlu { hidden, .. } => Some(hidden),
            _ => None,
        }
    }
}

/// An op bound to its launch shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub op: KernelOp,
    pub layout: ThreadLayout,
}

impl Kernel {
    pub fn new(op: KernelOp, layout: ThreadLayout) -> Self {
        Self { op, layout }
    }

    pub fn name(&self) -> &'static str {
        self.op.name()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.op.bindings(&self.layout)
    }

    pub fn params(&self) -> ShaderParams {
        self.op.params(&self.layout)
    }

    /// Launch-shape checks that do not depend on buffer sizes.
    pub fn check_layout(&self) -> EngineResult<()> {
        let group = self.layout.group_size;
        let fail = |reason: String| EngineError::Layout {
            kernel: self.name().to_string(),
            reason,
        };
        if group == 0 || group > MAX_GROUP_SIZE {
            return Err(fail(format!(
                "group size {group} outside 1..={MAX_GROUP_SIZE}"
            )));
        }
        if self.op.is_tree_reduction() && !group.is_power_of_two() {
            return Err(fail(format!(
                "tree reduction needs a power-of-two group size, got {group}"
            )));
        }
        if self.layout.global % group != 0 {
            return Err(fail(format!(
                "global size {} is not a multiple of group size {group}",
                self.layout.global
            )));
        }
        if let Some(needed) = self.op.required_threads() {
            if self.layout.logical < needed || self.layout.global < self.layout.logical {
                return Err(fail(format!(
                    "{} logical threads cannot cover {needed} outputs",
                    self.layout.logical
                )));
            }
        }
        if let Some(needed) = self.op.required_groups() {
            if self.layout.num_groups() != needed {
                return Err(fail(format!(
                    "{} groups launched, one per head or row needs {needed}",
                    self.layout.num_groups()
                )));
            }
        }
        if let KernelOp::FinishRmsNorm { .. } = self.op {
            if self.layout.global != 1 {
                return Err(fail("finishing a reduction runs on a single thread".into()));
            }
        }
        Ok(())
    }
}

//! The forward graph: six per-layer stages followed by two terminal stages.
//!
//! | stage        | kernels                                               |
//! |--------------|-------------------------------------------------------|
//! | `rmsnorm`    | sum of squares, finish, apply (`x` → `xb`)            |
//! | `qkv`        | `wq`, `wk`, `wv` projections                          |
//! | `rotation`   | RoPE on `q` and `k`                                   |
//! | `kv-cache`   | key and value cache writes                            |
//! | `attention`  | scores, max, exp-sum, weighted sum (→ `xb`)           |
//! | `ffn`        | `wo` + residual, RMSNorm, SwiGLU, `w2` + residual     |
//! | `final-rms`  | RMSNorm of `x` with the final weight (→ `xb`)         |
//! | `logits`     | classifier projection, copied back to the host        |
//!
//! The layer stages are built once and run `n_layers` times per token; the
//! cursor buffer tells them which layer slice and cache slot to use.
//!
//! [`KernelPlan::Fused`] replaces the per-thread projections with
//! row-per-group ones, folds both residual adds into the projection and runs
//! SwiGLU as one kernel. [`AttentionKernel`] picks the staged four-kernel
//! attention or one of the single-kernel variants.

use crate::buffer::{BufferId, TransferPolicy};
use crate::config::{index_u32, AttentionKernel, KernelPlan, LaunchConfig, ModelConfig};
use crate::error::{EngineError, EngineResult};
use crate::kernels::{AttentionDims, Kernel, KernelOp};
use crate::layout::{ThreadLayout, MAX_DISPATCH_GROUPS};
use crate::pipeline::PipelineBuilder;
use crate::stage::{Stage, StageId};
use crate::state::ModelState;
use crate::weights::WeightBuffers;

/// Ids of the forward stages inside their pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStages {
    pub rmsnorm: StageId,
    pub qkv: StageId,
    pub rotation: StageId,
    pub kv_cache: StageId,
    pub attention: StageId,
    pub ffn: StageId,
    pub final_rms: StageId,
    pub logits: StageId,
}

impl ForwardStages {
    fn starting_at(base: usize) -> Self {
        Self {
            rmsnorm: StageId(base),
            qkv: StageId(base + 1),
            rotation: StageId(base + 2),
            kv_cache: StageId(base + 3),
            attention: StageId(base + 4),
            ffn: StageId(base + 5),
            final_rms: StageId(base + 6),
            logits: StageId(base + 7),
        }
    }

    /// Stages run once per layer, in order.
    pub fn layer_stages(&self) -> [StageId; 6] {
        [
            self.rmsnorm,
            self.qkv,
            self.rotation,
            self.kv_cache,
            self.attention,
            self.ffn,
        ]
    }
}

/// Partial sums produced by the norm reductions for `config`.
pub fn reduce_groups(config: &ModelConfig, launch: &LaunchConfig) -> usize {
    ThreadLayout::linear(config.dim, launch.norm_group_size).num_groups() as usize
}

/// Model sizes as the kernels index them.
#[derive(Debug, Clone, Copy)]
struct GraphDims {
    dim: u32,
    hidden: u32,
    kv_dim: u32,
    layers: u32,
    vocab: u32,
    cache_len: u32,
    attention: AttentionDims,
}

impl GraphDims {
    fn new(config: &ModelConfig, state: &ModelState) -> EngineResult<Self> {
        let layers = index_u32("n_layers", config.n_layers)?;
        Ok(Self {
            dim: index_u32("dim", config.dim)?,
            hidden: index_u32("hidden_dim", config.hidden_dim)?,
            kv_dim: index_u32("kv_dim", config.kv_dim())?,
            layers,
            vocab: index_u32("vocab_size", config.vocab_size)?,
            cache_len: index_u32("key_cache", state.cache.len())?,
            attention: AttentionDims {
                n_heads: index_u32("n_heads", config.n_heads)?,
                head_size: index_u32("head_size", config.head_size())?,
                kv_dim: index_u32("kv_dim", config.kv_dim())?,
                kv_mul: index_u32("kv_mul", config.kv_mul())?,
                context_length: index_u32("context_length", config.context_length)?,
                n_layers: layers,
            },
        })
    }
}

/// Builds the kernels of the forward pass for one configuration.
pub struct ForwardGraph<'a> {
    config: &'a ModelConfig,
    launch: LaunchConfig,
    state: &'a ModelState,
    weights: &'a WeightBuffers,
    dims: GraphDims,
}

impl<'a> ForwardGraph<'a> {
    /// Fails when a size does not fit 32-bit kernel indexing, or when the
    /// fused plan would dispatch more row groups than a device guarantees.
    pub fn new(
        config: &'a ModelConfig,
        launch: LaunchConfig,
        state: &'a ModelState,
        weights: &'a WeightBuffers,
    ) -> EngineResult<Self> {
        let dims = GraphDims::new(config, state)?;
        if launch.kernels == KernelPlan::Fused {
            let rows = dims.dim.max(dims.hidden);
            if rows > MAX_DISPATCH_GROUPS {
                return Err(EngineError::Unsupported(format!(
                    "fused kernels dispatch one group per row; {rows} rows exceed {MAX_DISPATCH_GROUPS}"
                )));
            }
        }
        Ok(Self {
            config,
            launch,
            state,
            weights,
            dims,
        })
    }

    fn layers(&self, layered: bool) -> u32 {
        if layered {
            self.dims.layers
        } else {
            1
        }
    }

    fn linear(&self, logical: u32) -> ThreadLayout {
        ThreadLayout::linear(logical as usize, self.launch.linear_group_size)
    }

    fn fused(&self) -> bool {
        self.launch.kernels == KernelPlan::Fused
    }

    pub fn attention_dims(&self) -> AttentionDims {
        self.dims.attention
    }

    /// The three RMSNorm kernels: `out = weight * normalize(input)`.
    pub fn rms_norm(
        &self,
        out: BufferId,
        input: BufferId,
        weight: BufferId,
        reduce: BufferId,
        layered: bool,
    ) -> [Kernel; 3] {
        let size = self.dims.dim;
        let layout = ThreadLayout::linear(size as usize, self.launch.norm_group_size);
        let partials = layout.num_groups();
        [
            Kernel::new(
                KernelOp::ReduceSumSquares {
                    input,
                    reduce,
                    size,
                },
                layout,
            ),
            Kernel::new(
                KernelOp::FinishRmsNorm {
                    reduce,
                    partials,
                    size,
                    eps: self.config.norm_eps,
                },
                ThreadLayout::single(),
            ),
            Kernel::new(
                KernelOp::ApplyRmsNorm {
                    out,
                    input,
                    weight,
                    reduce,
                    cursor: layered.then_some(self.state.cursor),
                    size,
                    layers: self.layers(layered),
                },
                self.linear(size),
            ),
        ]
    }

    pub fn matvec(
        &self,
        out: BufferId,
        input: BufferId,
        weight: BufferId,
        in_dim: u32,
        out_dim: u32,
        layered: bool,
    ) -> Kernel {
        Kernel::new(
            KernelOp::MatVec {
                out,
                input,
                weight,
                cursor: layered.then_some(self.state.cursor),
                in_dim,
                out_dim,
                layers: self.layers(layered),
            },
            self.linear(out_dim),
        )
    }

    /// One group per row; with `accumulate` the result is added into `out`.
    #[allow(clippy::too_many_arguments)]
    pub fn row_matvec(
        &self,
        out: BufferId,
        input: BufferId,
        weight: BufferId,
        in_dim: u32,
        out_dim: u32,
        layered: bool,
        accumulate: bool,
    ) -> Kernel {
        Kernel::new(
            KernelOp::RowMatVec {
                out,
                input,
                weight,
                cursor: layered.then_some(self.state.cursor),
                in_dim,
                out_dim,
                layers: self.layers(layered),
                accumulate,
            },
            ThreadLayout::groups(out_dim as usize, self.launch.row_group_size),
        )
    }

    /// The projection kernel the plan picks for `out_dim` rows.
    fn project(
        &self,
        out: BufferId,
        input: BufferId,
        weight: BufferId,
        in_dim: u32,
        out_dim: u32,
        layered: bool,
    ) -> Kernel {
        if self.fused() && out_dim <= MAX_DISPATCH_GROUPS {
            self.row_matvec(out, input, weight, in_dim, out_dim, layered, false)
        } else {
            self.matvec(out, input, weight, in_dim, out_dim, layered)
        }
    }

    pub fn fused_swiglu(&self, out: BufferId, input: BufferId) -> Kernel {
        let w = self.weights;
        Kernel::new(
            KernelOp::FusedSwiGlu {
                out,
                input,
                w1: w.w1,
                w3: w.w3,
                cursor: Some(self.state.cursor),
                in_dim: self.dims.dim,
                hidden: self.dims.hidden,
                layers: self.dims.layers,
            },
            ThreadLayout::groups(self.dims.hidden as usize, self.launch.row_group_size),
        )
    }

    pub fn rope(&self) -> Kernel {
        Kernel::new(
            KernelOp::Rope {
                q: self.state.q,
                k: self.state.k,
                cursor: self.state.cursor,
                dim: self.dims.dim,
                kv_dim: self.dims.kv_dim,
                head_size: self.dims.attention.head_size,
                theta: self.config.rope_theta,
            },
            self.linear(self.dims.dim / 2),
        )
    }

    pub fn cache_write(&self, cache: BufferId, src: BufferId) -> Kernel {
        Kernel::new(
            KernelOp::CacheWrite {
                cache,
                src,
                cursor: self.state.cursor,
                kv_dim: self.dims.kv_dim,
                cache_len: self.dims.cache_len,
            },
            self.linear(self.dims.kv_dim),
        )
    }

    /// Scores, max, exp-sum and weighted sum into `out`, one group per head.
    pub fn attention(&self, out: BufferId) -> [Kernel; 4] {
        let s = self.state;
        let dims = self.dims.attention;
        let layout = ThreadLayout::groups(dims.n_heads as usize, self.launch.head_group_size);
        [
            Kernel::new(
                KernelOp::AttentionScores {
                    att: s.att,
                    q: s.q,
                    key_cache: s.key_cache,
                    cursor: s.cursor,
                    dims,
                },
                layout,
            ),
            Kernel::new(
                KernelOp::AttentionMax {
                    att: s.att,
                    att_max: s.att_max,
                    cursor: s.cursor,
                    dims,
                },
                layout,
            ),
            Kernel::new(
                KernelOp::AttentionExpSum {
                    att: s.att,
                    att_max: s.att_max,
                    att_sum: s.att_sum,
                    cursor: s.cursor,
                    dims,
                },
                layout,
            ),
            Kernel::new(
                KernelOp::AttentionWeightedSum {
                    out,
                    att: s.att,
                    att_sum: s.att_sum,
                    value_cache: s.value_cache,
                    cursor: s.cursor,
                    dims,
                },
                layout,
            ),
        ]
    }

    /// The attention stage's kernels for the configured variant, with the
    /// scratch buffers they need besides `out`.
    pub fn attention_kernels(&self, out: BufferId) -> (Vec<Kernel>, Vec<BufferId>) {
        let s = self.state;
        let dims = self.dims.attention;
        match self.launch.attention {
            AttentionKernel::Staged => (self.attention(out).to_vec(), vec![s.att, s.att_max, s.att_sum]),
            AttentionKernel::PerHead => {
                let op = KernelOp::AttentionHeads {
                    out,
                    att: s.att,
                    q: s.q,
                    key_cache: s.key_cache,
                    value_cache: s.value_cache,
                    cursor: s.cursor,
                    dims,
                };
                let layout = ThreadLayout::linear(dims.n_heads as usize, self.launch.linear_group_size);
                (vec![Kernel::new(op, layout)], vec![s.att])
            }
            AttentionKernel::Flash => {
                let op = KernelOp::FlashAttention {
                    out,
                    q: s.q,
                    key_cache: s.key_cache,
                    value_cache: s.value_cache,
                    cursor: s.cursor,
                    dims,
                };
                let layout = ThreadLayout::groups(dims.n_heads as usize, self.launch.head_group_size);
                (vec![Kernel::new(op, layout)], Vec::new())
            }
        }
    }

    pub fn add(&self, out: BufferId, input: BufferId, len: u32) -> Kernel {
        Kernel::new(KernelOp::AddInPlace { out, input, len }, self.linear(len))
    }

    pub fn mul(&self, out: BufferId, input: BufferId, len: u32) -> Kernel {
        Kernel::new(KernelOp::MulInPlace { out, input, len }, self.linear(len))
    }

    pub fn silu(&self, data: BufferId, len: u32) -> Kernel {
        Kernel::new(KernelOp::Silu { data, len }, self.linear(len))
    }

    /// Output projection, residual, RMSNorm, SwiGLU and the second residual.
    pub fn ffn_kernels(&self) -> Vec<Kernel> {
        let s = self.state;
        let w = self.weights;
        let dim = self.dims.dim;
        let hidden = self.dims.hidden;
        if self.fused() {
            let mut kernels = vec![self.row_matvec(s.x, s.xb, w.wo, dim, dim, true, true)];
            kernels.extend(self.rms_norm(s.xb, s.x, w.rms_ffn, s.reduce_ffn, true));
            kernels.extend([
                self.fused_swiglu(s.hb, s.xb),
                self.row_matvec(s.x, s.hb, w.w2, hidden, dim, true, true),
            ]);
            return kernels;
        }
        let mut kernels = vec![
            self.matvec(s.xb2, s.xb, w.wo, dim, dim, true),
            self.add(s.x, s.xb2, dim),
        ];
        kernels.extend(self.rms_norm(s.xb, s.x, w.rms_ffn, s.reduce_ffn, true));
        kernels.extend([
            self.matvec(s.hb, s.xb, w.w1, dim, hidden, true),
            self.matvec(s.hb2, s.xb, w.w3, dim, hidden, true),
            self.silu(s.hb, hidden),
            self.mul(s.hb, s.hb2, hidden),
            self.matvec(s.xb, s.hb, w.w2, hidden, dim, true),
            self.add(s.x, s.xb, dim),
        ]);
        kernels
    }

    fn ffn_scratch(&self) -> Vec<BufferId> {
        let s = self.state;
        if self.fused() {
            vec![s.hb, s.reduce_ffn]
        } else {
            vec![s.xb2, s.hb, s.hb2, s.reduce_ffn]
        }
    }

    /// Add the eight forward stages to `builder`.
    pub fn add_stages(&self, builder: &mut PipelineBuilder) -> EngineResult<ForwardStages> {
        let ids = ForwardStages::starting_at(builder.next_id().index());
        let s = self.state;
        let w = self.weights;
        let dim = self.dims.dim;
        let kv_dim = self.dims.kv_dim;
        let once = TransferPolicy::CopyOnce;

        let [reduce, finish, apply] = self.rms_norm(s.xb, s.x, w.rms_att, s.reduce_att, true);
        let rmsnorm = Stage::new("rmsnorm")
            .transfer_to_device(TransferPolicy::CopyEveryCall, &[s.cursor])
            .transfer_to_device(once, &[w.rms_att])
            .consume_from(ids.ffn, &[s.x])
            .scratch(&[s.reduce_att])
            .persist_on_device(&[s.x, s.xb, s.cursor])
            .task(reduce)
            .task(finish)
            .task(apply);

        let qkv = Stage::new("qkv")
            .consume_from(ids.rmsnorm, &[s.xb, s.cursor])
            .transfer_to_device(once, &[w.wq, w.wk, w.wv])
            .scratch(&[s.q, s.k, s.v])
            .persist_on_device(&[s.q, s.k, s.v, s.cursor])
            .task(self.project(s.q, s.xb, w.wq, dim, dim, true))
            .task(self.project(s.k, s.xb, w.wk, dim, kv_dim, true))
            .task(self.project(s.v, s.xb, w.wv, dim, kv_dim, true));

        let rotation = Stage::new("rotation")
            .consume_from(ids.qkv, &[s.q, s.k, s.cursor])
            .persist_on_device(&[s.q, s.k, s.cursor])
            .task(self.rope());

        let kv_cache = Stage::new("kv-cache")
            .consume_from(ids.rotation, &[s.k, s.cursor])
            .consume_from(ids.qkv, &[s.v])
            .transfer_to_device(once, &[s.key_cache, s.value_cache])
            .persist_on_device(&[s.key_cache, s.value_cache, s.cursor])
            .task(self.cache_write(s.key_cache, s.k))
            .task(self.cache_write(s.value_cache, s.v));

        let (attention_kernels, attention_scratch) = self.attention_kernels(s.xb);
        let mut attention = Stage::new("attention")
            .consume_from(ids.rotation, &[s.q])
            .consume_from(ids.kv_cache, &[s.key_cache, s.value_cache, s.cursor])
            .scratch(&attention_scratch)
            .scratch(&[s.xb])
            .persist_on_device(&[s.xb, s.key_cache, s.value_cache, s.cursor]);
        for kernel in attention_kernels {
            attention = attention.task(kernel);
        }

        let mut ffn = Stage::new("ffn")
            .consume_from(ids.attention, &[s.xb, s.cursor])
            .consume_from(ids.rmsnorm, &[s.x])
            .transfer_to_device(once, &[w.wo, w.rms_ffn, w.w1, w.w2, w.w3])
            .scratch(&self.ffn_scratch())
            .persist_on_device(&[s.x]);
        for kernel in self.ffn_kernels() {
            ffn = ffn.task(kernel);
        }

        let [reduce, finish, apply] = self.rms_norm(s.xb, s.x, w.rms_final, s.reduce_final, false);
        let final_rms = Stage::new("final-rms")
            .consume_from(ids.ffn, &[s.x])
            .transfer_to_device(once, &[w.rms_final])
            .scratch(&[s.reduce_final, s.xb])
            .persist_on_device(&[s.xb])
            .task(reduce)
            .task(finish)
            .task(apply);

        let logits = Stage::new("logits")
            .consume_from(ids.final_rms, &[s.xb])
            .transfer_to_device(once, &[w.wcls])
            .scratch(&[s.logits])
            .transfer_to_host(&[s.logits])
            .task(self.project(s.logits, s.xb, w.wcls, dim, self.dims.vocab, false));

        let added = [
            builder.add_stage(rmsnorm),
            builder.add_stage(qkv),
            builder.add_stage(rotation),
            builder.add_stage(kv_cache),
            builder.add_stage(attention),
            builder.add_stage(ffn),
            builder.add_stage(final_rms),
            builder.add_stage(logits),
        ];
        let expected = [
            ids.rmsnorm,
            ids.qkv,
            ids.rotation,
            ids.kv_cache,
            ids.attention,
            ids.ffn,
            ids.final_rms,
            ids.logits,
        ];
        if added != expected {
            return Err(EngineError::Ordering {
                stage: "forward".to_string(),
                reason: format!("stage ids {added:?} differ from reserved {expected:?}"),
            });
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferRegistry;
    use crate::device::CpuDevice;
    use crate::pipeline::Pipeline;
    use crate::weights::Weights;

    fn build(config: &ModelConfig, launch: LaunchConfig) -> EngineResult<(ForwardStages, Pipeline)> {
        let mut registry = BufferRegistry::new();
        let (weights, _) = Weights::random(config, 3)?.into_registry(config, &mut registry);
        let state = ModelState::register(config, reduce_groups(config, &launch), &mut registry);
        let mut builder = PipelineBuilder::new();
        let ids = ForwardGraph::new(config, launch, &state, &weights)?.add_stages(&mut builder)?;
        Ok((ids, builder.build(&registry, Box::new(CpuDevice::new()))?))
    }

    fn config() -> ModelConfig {
        ModelConfig::new(32, 64, 2, 4, 2, 64, 16, 1e-5, 10000.0).unwrap()
    }

    #[test]
    fn forward_graph_builds_and_validates() {
        let config = config();
        let (ids, pipeline) = build(&config, LaunchConfig::for_model(&config)).unwrap();
        assert_eq!(ids.logits, StageId(7));
        assert_eq!(pipeline.num_stages(), 8);
        assert_eq!(pipeline.stage(ids.ffn).unwrap().kernels().len(), 11);
        assert_eq!(pipeline.stage(ids.attention).unwrap().kernels().len(), 4);
    }

    #[test]
    fn fused_plan_selects_row_kernels() {
        let config = config();
        let launch = LaunchConfig::for_model(&config)
            .with_kernels(KernelPlan::Fused)
            .with_attention(AttentionKernel::Flash);
        let (ids, pipeline) = build(&config, launch).unwrap();

        let names = |id| -> Vec<&'static str> {
            pipeline
                .stage(id)
                .unwrap()
                .kernels()
                .iter()
                .map(Kernel::name)
                .collect()
        };
        assert_eq!(names(ids.qkv), ["row_matvec"; 3]);
        assert_eq!(names(ids.attention), ["flash_attention"]);
        assert_eq!(
            names(ids.ffn),
            [
                "row_matvec",
                "reduce_sum_squares",
                "finish_rms_norm",
                "apply_rms_norm",
                "fused_swiglu",
                "row_matvec"
            ]
        );
        assert_eq!(names(ids.logits), ["row_matvec"]);
        let attention = pipeline.stage(ids.attention).unwrap();
        assert_eq!(attention.decls().len(), 5);
    }

    #[test]
    fn per_head_attention_keeps_score_scratch() {
        let config = config();
        let launch = LaunchConfig::for_model(&config).with_attention(AttentionKernel::PerHead);
        let (ids, pipeline) = build(&config, launch).unwrap();
        let attention = pipeline.stage(ids.attention).unwrap();
        assert_eq!(attention.kernels().len(), 1);
        assert_eq!(attention.kernels()[0].name(), "attention_heads");
        assert_eq!(attention.decls().len(), 6);
    }

    #[test]
    fn fused_plan_refuses_undispatchable_rows() {
        let config = ModelConfig::new(8, 70_000, 1, 2, 2, 16, 4, 1e-5, 10000.0).unwrap();
        let launch = LaunchConfig::for_model(&config).with_kernels(KernelPlan::Fused);
        let err = build(&config, launch).err().unwrap();
        assert!(matches!(err, EngineError::Unsupported(_)));
        build(&config, LaunchConfig::for_model(&config)).unwrap();
    }
}

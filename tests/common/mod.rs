//! Shared helpers for the integration tests.

#![allow(dead_code)]

use gllm_forward::buffer::{BufferId, BufferRegistry, TransferPolicy};
use gllm_forward::config::AttentionKernel;
use gllm_forward::device::{ComputeDevice, CpuDevice};
use gllm_forward::error::EngineResult;
use gllm_forward::kernels::{AttentionDims, Kernel, KernelOp};
use gllm_forward::layout::ThreadLayout;
use gllm_forward::pipeline::{Pipeline, PipelineBuilder};
use gllm_forward::reference;
use gllm_forward::stage::Stage;
use gllm_forward::state::KvCacheLayout;
use gllm_forward::validation::{compare_buffers, ComparisonReport, Tolerance};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic values uniform in `[-scale, scale)`.
pub fn random_vec(len: usize, scale: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-scale..scale)).collect()
}

/// Run `kernels` as one stage on `device`. Every registry buffer is uploaded
/// once; `outputs` are copied back into the registry.
pub fn run_kernels_on(
    device: Box<dyn ComputeDevice>,
    registry: &mut BufferRegistry,
    kernels: Vec<Kernel>,
    outputs: &[BufferId],
) -> Pipeline {
    try_run_kernels_on(device, registry, kernels, outputs).unwrap()
}

pub fn try_run_kernels_on(
    device: Box<dyn ComputeDevice>,
    registry: &mut BufferRegistry,
    kernels: Vec<Kernel>,
    outputs: &[BufferId],
) -> EngineResult<Pipeline> {
    let all: Vec<BufferId> = registry.ids().collect();
    let mut stage = Stage::new("under-test")
        .transfer_to_device(TransferPolicy::CopyOnce, &all)
        .transfer_to_host(outputs);
    for kernel in kernels {
        stage = stage.task(kernel);
    }
    let mut builder = PipelineBuilder::new();
    let id = builder.add_stage(stage);
    let mut pipeline = builder.build(registry, device)?;
    pipeline.execute(id, registry)?;
    Ok(pipeline)
}

pub fn run_kernels(registry: &mut BufferRegistry, kernels: Vec<Kernel>, outputs: &[BufferId]) -> Pipeline {
    run_kernels_on(Box::new(CpuDevice::new()), registry, kernels, outputs)
}

// ═══════════════════════════════════════════════════════════════════════
// Scenarios shared by the CPU and WGPU parity tests
// ═══════════════════════════════════════════════════════════════════════

pub const RMS_TOLERANCE: Tolerance = Tolerance::new(1e-5, 1e-4);

/// The three RMSNorm kernels over `dim` values with reduction groups of `group`.
pub fn rms_norm_report(device: Box<dyn ComputeDevice>, dim: usize, group: u32, seed: u64) -> ComparisonReport {
    let x = random_vec(dim, 2.0, seed);
    let w: Vec<f32> = random_vec(dim, 0.2, seed + 1).iter().map(|v| 1.0 + v).collect();
    let mut expected = vec![0.0; dim];
    reference::rmsnorm(&mut expected, &x, &w, 1e-5);

    let reduce_layout = ThreadLayout::linear(dim, group);
    let mut registry = BufferRegistry::new();
    let input = registry.register_f32("x", x);
    let weight = registry.register_f32("w", w);
    let reduce = registry.zeros_f32("reduce", reduce_layout.num_groups() as usize);
    let out = registry.zeros_f32("out", dim);
    let size = dim as u32;
    let kernels = vec![
        Kernel::new(KernelOp::ReduceSumSquares { input, reduce, size }, reduce_layout),
        Kernel::new(
            KernelOp::FinishRmsNorm {
                reduce,
                partials: reduce_layout.num_groups(),
                size,
                eps: 1e-5,
            },
            ThreadLayout::single(),
        ),
        Kernel::new(
            KernelOp::ApplyRmsNorm {
                out,
                input,
                weight,
                reduce,
                cursor: None,
                size,
                layers: 1,
            },
            ThreadLayout::linear(dim, group),
        ),
    ];
    run_kernels_on(device, &mut registry, kernels, &[out]);
    compare_buffers(registry.f32(out).unwrap(), &expected, RMS_TOLERANCE)
}

fn matvec(out: BufferId, input: BufferId, weight: BufferId, in_dim: usize, out_dim: usize) -> Kernel {
    Kernel::new(
        KernelOp::MatVec {
            out,
            input,
            weight,
            cursor: None,
            in_dim: in_dim as u32,
            out_dim: out_dim as u32,
            layers: 1,
        },
        ThreadLayout::linear(out_dim, 64),
    )
}

/// SwiGLU block (dim 16, hidden 32) against the sequential version.
pub fn swiglu_report(device: Box<dyn ComputeDevice>, seed: u64) -> ComparisonReport {
    let (dim, hidden) = (16usize, 32usize);
    let x = random_vec(dim, 1.0, seed);
    let w1 = random_vec(hidden * dim, 0.25, seed + 1);
    let w2 = random_vec(dim * hidden, 0.18, seed + 2);
    let w3 = random_vec(hidden * dim, 0.25, seed + 3);
    let mut expected = vec![0.0; dim];
    reference::swiglu_ffn(&mut expected, &x, &w1, &w2, &w3, hidden);

    let mut registry = BufferRegistry::new();
    let x = registry.register_f32("x", x);
    let w1 = registry.register_f32("w1", w1);
    let w2 = registry.register_f32("w2", w2);
    let w3 = registry.register_f32("w3", w3);
    let hb = registry.zeros_f32("hb", hidden);
    let hb2 = registry.zeros_f32("hb2", hidden);
    let out = registry.zeros_f32("out", dim);
    let len = hidden as u32;
    let kernels = vec![
        matvec(hb, x, w1, dim, hidden),
        matvec(hb2, x, w3, dim, hidden),
        Kernel::new(KernelOp::Silu { data: hb, len }, ThreadLayout::linear(hidden, 64)),
        Kernel::new(
            KernelOp::MulInPlace {
                out: hb,
                input: hb2,
                len,
            },
            ThreadLayout::linear(hidden, 64),
        ),
        matvec(out, hb, w2, hidden, dim),
    ];
    run_kernels_on(device, &mut registry, kernels, &[out]);
    compare_buffers(registry.f32(out).unwrap(), &expected, Tolerance::relative(1e-3))
}

fn row_matvec(
    out: BufferId,
    input: BufferId,
    weight: BufferId,
    in_dim: usize,
    out_dim: usize,
    group: u32,
    accumulate: bool,
) -> Kernel {
    Kernel::new(
        KernelOp::RowMatVec {
            out,
            input,
            weight,
            cursor: None,
            in_dim: in_dim as u32,
            out_dim: out_dim as u32,
            layers: 1,
            accumulate,
        },
        ThreadLayout::groups(out_dim, group),
    )
}

/// Row-per-group projection of `in_dim` values, stored or added onto a residual.
pub fn row_matvec_report(
    device: Box<dyn ComputeDevice>,
    in_dim: usize,
    out_dim: usize,
    group: u32,
    accumulate: bool,
    seed: u64,
) -> ComparisonReport {
    let x = random_vec(in_dim, 1.0, seed);
    let w = random_vec(in_dim * out_dim, 0.5, seed + 1);
    let residual = random_vec(out_dim, 1.0, seed + 2);
    let mut expected = vec![0.0; out_dim];
    reference::matvec(&mut expected, &x, &w, in_dim, out_dim);
    if accumulate {
        for (e, r) in expected.iter_mut().zip(&residual) {
            *e += r;
        }
    }

    let mut registry = BufferRegistry::new();
    let x = registry.register_f32("x", x);
    let w = registry.register_f32("w", w);
    let out = registry.register_f32("out", residual);
    let kernels = vec![row_matvec(out, x, w, in_dim, out_dim, group, accumulate)];
    run_kernels_on(device, &mut registry, kernels, &[out]);
    compare_buffers(registry.f32(out).unwrap(), &expected, Tolerance::new(1e-5, 1e-4))
}

/// The SwiGLU block as one gate kernel and one accumulating down projection,
/// added onto a residual (dim 16, hidden 48).
pub fn fused_swiglu_report(device: Box<dyn ComputeDevice>, group: u32, seed: u64) -> ComparisonReport {
    let (dim, hidden) = (16usize, 48usize);
    let x = random_vec(dim, 1.0, seed);
    let w1 = random_vec(hidden * dim, 0.25, seed + 1);
    let w2 = random_vec(dim * hidden, 0.18, seed + 2);
    let w3 = random_vec(hidden * dim, 0.25, seed + 3);
    let residual = random_vec(dim, 1.0, seed + 4);
    let mut expected = vec![0.0; dim];
    reference::swiglu_ffn(&mut expected, &x, &w1, &w2, &w3, hidden);
    for (e, r) in expected.iter_mut().zip(&residual) {
        *e += r;
    }

    let mut registry = BufferRegistry::new();
    let x = registry.register_f32("x", x);
    let w1 = registry.register_f32("w1", w1);
    let w2 = registry.register_f32("w2", w2);
    let w3 = registry.register_f32("w3", w3);
    let hb = registry.zeros_f32("hb", hidden);
    let out = registry.register_f32("out", residual);
    let kernels = vec![
        Kernel::new(
            KernelOp::FusedSwiGlu {
                out: hb,
                input: x,
                w1,
                w3,
                cursor: None,
                in_dim: dim as u32,
                hidden: hidden as u32,
                layers: 1,
            },
            ThreadLayout::groups(hidden, group),
        ),
        row_matvec(out, hb, w2, hidden, dim, group, true),
    ];
    run_kernels_on(device, &mut registry, kernels, &[out]);
    compare_buffers(registry.f32(out).unwrap(), &expected, Tolerance::relative(1e-3))
}

/// One layer of cached keys/values plus the attention kernels of one variant.
pub struct AttentionCase {
    pub registry: BufferRegistry,
    pub kernels: Vec<Kernel>,
    pub cache: KvCacheLayout,
    pub dims: AttentionDims,
    pub position: usize,
    pub q: BufferId,
    pub key_cache: BufferId,
    pub value_cache: BufferId,
    pub att: BufferId,
    pub out: BufferId,
}

pub struct AttentionShape {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_size: usize,
    pub context_length: usize,
    pub position: usize,
    pub group_size: u32,
}

impl AttentionCase {
    /// `att_fill` is written to every score slot before the kernels run.
    pub fn new(shape: &AttentionShape, att_fill: f32, seed: u64) -> Self {
        Self::with_kernel(shape, att_fill, seed, AttentionKernel::Staged)
    }

    pub fn with_kernel(shape: &AttentionShape, att_fill: f32, seed: u64, variant: AttentionKernel) -> Self {
        let kv_dim = shape.n_kv_heads * shape.head_size;
        let cache = KvCacheLayout {
            n_layers: 1,
            context_length: shape.context_length,
            kv_dim,
            head_size: shape.head_size,
        };
        let dims = AttentionDims {
            n_heads: shape.n_heads as u32,
            head_size: shape.head_size as u32,
            kv_dim: kv_dim as u32,
            kv_mul: (shape.n_heads / shape.n_kv_heads) as u32,
            context_length: shape.context_length as u32,
            n_layers: 1,
        };
        let mut registry = BufferRegistry::new();
        let q = registry.register_f32("q", random_vec(shape.n_heads * shape.head_size, 1.0, seed));
        let key_cache = registry.register_f32("key_cache", random_vec(cache.len(), 1.0, seed + 1));
        let value_cache = registry.register_f32("value_cache", random_vec(cache.len(), 1.0, seed + 2));
        let att = registry.register_f32("att", vec![att_fill; shape.n_heads * shape.context_length]);
        let att_max = registry.zeros_f32("att_max", shape.n_heads);
        let att_sum = registry.zeros_f32("att_sum", shape.n_heads);
        let out = registry.zeros_f32("out", shape.n_heads * shape.head_size);
        let cursor = registry.register_u32(
            "cursor",
            vec![shape.position as u32, 0, cache.offset(0, shape.position) as u32],
        );

        let layout = ThreadLayout::groups(shape.n_heads, shape.group_size);
        let kernels = match variant {
            AttentionKernel::Staged => vec![
                Kernel::new(
                    KernelOp::AttentionScores {
                        att,
                        q,
                        key_cache,
                        cursor,
                        dims,
                    },
                    layout,
                ),
                Kernel::new(
                    KernelOp::AttentionMax {
                        att,
                        att_max,
                        cursor,
                        dims,
                    },
                    layout,
                ),
                Kernel::new(
                    KernelOp::AttentionExpSum {
                        att,
                        att_max,
                        att_sum,
                        cursor,
                        dims,
                    },
                    layout,
                ),
                Kernel::new(
                    KernelOp::AttentionWeightedSum {
                        out,
                        att,
                        att_sum,
                        value_cache,
                        cursor,
                        dims,
                    },
                    layout,
                ),
            ],
            AttentionKernel::PerHead => vec![Kernel::new(
                KernelOp::AttentionHeads {
                    out,
                    att,
                    q,
                    key_cache,
                    value_cache,
                    cursor,
                    dims,
                },
                ThreadLayout::linear(shape.n_heads, shape.group_size),
            )],
            AttentionKernel::Flash => vec![Kernel::new(
                KernelOp::FlashAttention {
                    out,
                    q,
                    key_cache,
                    value_cache,
                    cursor,
                    dims,
                },
                layout,
            )],
        };
        Self {
            registry,
            kernels,
            cache,
            dims,
            position: shape.position,
            q,
            key_cache,
            value_cache,
            att,
            out,
        }
    }

    /// Overwrite cache slots after the current position with `value`.
    pub fn poison_future(&mut self, value: f32) {
        let start = self.cache.offset(0, self.position + 1);
        for id in [self.key_cache, self.value_cache] {
            for v in &mut self.registry.f32_mut(id).unwrap()[start..] {
                *v = value;
            }
        }
    }

    pub fn expected(&self) -> Vec<f32> {
        let mut out = vec![0.0; (self.dims.n_heads * self.dims.head_size) as usize];
        reference::attention(
            &mut out,
            self.registry.f32(self.q).unwrap(),
            self.registry.f32(self.key_cache).unwrap(),
            self.registry.f32(self.value_cache).unwrap(),
            &self.cache,
            0,
            self.position,
            self.dims.kv_mul as usize,
        );
        out
    }

    /// Run on `device`; `out` and `att` are copied back.
    pub fn run(&mut self, device: Box<dyn ComputeDevice>) {
        self.try_run(device).unwrap();
    }

    pub fn try_run(&mut self, device: Box<dyn ComputeDevice>) -> EngineResult<()> {
        let kernels = self.kernels.clone();
        try_run_kernels_on(device, &mut self.registry, kernels, &[self.out, self.att]).map(|_| ())
    }
}

/// 4 heads sharing 2 kv heads, head size 32, 16 cached positions, querying the last.
pub fn attention_scenario() -> AttentionShape {
    AttentionShape {
        n_heads: 4,
        n_kv_heads: 2,
        head_size: 32,
        context_length: 16,
        position: 15,
        group_size: 16,
    }
}

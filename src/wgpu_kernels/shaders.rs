//! WGSL sources, one compute shader per [`KernelOp`] variant.

use crate::buffer::BufferId;
use crate::kernels::{Access, KernelOp};

const WORKGROUP_TEMPLATE: &str = "{{WG}}";

const REDUCE_SUM_SQUARES: &str = include_str!("kernels/reduce_sum_squares.wgsl");
const FINISH_RMS_NORM: &str = include_str!("kernels/finish_rms_norm.wgsl");
const APPLY_RMS_NORM: &str = include_str!("kernels/apply_rms_norm.wgsl");
const MATVEC: &str = include_str!("kernels/matvec.wgsl");
const ROW_MATVEC: &str = include_str!("kernels/row_matvec.wgsl");
const FUSED_SWIGLU: &str = include_str!("kernels/fused_swiglu.wgsl");
const ROPE: &str = include_str!("kernels/rope.wgsl");
const CACHE_WRITE: &str = include_str!("kernels/cache_write.wgsl");
const ATTENTION_SCORES: &str = include_str!("kernels/attention_scores.wgsl");
const ATTENTION_MAX: &str = include_str!("kernels/attention_max.wgsl");
const ATTENTION_EXP_SUM: &str = include_str!("kernels/attention_exp_sum.wgsl");
const ATTENTION_WEIGHTED_SUM: &str = include_str!("kernels/attention_weighted_sum.wgsl");
const ATTENTION_HEADS: &str = include_str!("kernels/attention_heads.wgsl");
const FLASH_ATTENTION: &str = include_str!("kernels/flash_attention.wgsl");
const ADD_IN_PLACE: &str = include_str!("kernels/add_in_place.wgsl");
const MUL_IN_PLACE: &str = include_str!("kernels/mul_in_place.wgsl");
const SILU: &str = include_str!("kernels/silu.wgsl");

fn template(op: &KernelOp) -> &'static str {
    match op {
        KernelOp::ReduceSumSquares { .. } => REDUCE_SUM_SQUARES,
        KernelOp::FinishRmsNorm { .. } => FINISH_RMS_NORM,
        KernelOp::ApplyRmsNorm { .. } => APPLY_RMS_NORM,
        KernelOp::MatVec { .. } => MATVEC,
        KernelOp::RowMatVec { .. } => ROW_MATVEC,
        KernelOp::FusedSwiGlu { .. } => FUSED_SWIGLU,
        KernelOp::Rope { .. } => ROPE,
        KernelOp::CacheWrite { .. } => CACHE_WRITE,
        KernelOp::AttentionScores { .. } => ATTENTION_SCORES,
        KernelOp::AttentionMax { .. } => ATTENTION_MAX,
        KernelOp::AttentionExpSum { .. } => ATTENTION_EXP_SUM,
        KernelOp::AttentionWeightedSum { .. } => ATTENTION_WEIGHTED_SUM,
        KernelOp::AttentionHeads { .. } => ATTENTION_HEADS,
        KernelOp::FlashAttention { .. } => FLASH_ATTENTION,
        KernelOp::AddInPlace { .. } => ADD_IN_PLACE,
        KernelOp::MulInPlace { .. } => MUL_IN_PLACE,
        KernelOp::Silu { .. } => SILU,
    }
}

/// Shader source with the workgroup size baked in.
pub fn source(op: &KernelOp, group_size: u32) -> String {
    template(op).replace(WORKGROUP_TEMPLATE, &group_size.to_string())
}

/// A storage binding as the shader declares it. `buffer` is `None` where the
/// shader declares an optional cursor the op does not use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub buffer: Option<BufferId>,
    pub read_only: bool,
}

/// Storage slots in binding order, starting at binding 1.
pub fn slots(op: &KernelOp, bindings: &[crate::kernels::Binding]) -> Vec<Slot> {
    let mut slots: Vec<Slot> = bindings
        .iter()
        .map(|b| Slot {
            buffer: Some(b.buffer),
            read_only: b.access == Access::Read,
        })
        .collect();
    let optional_cursor = match op {
        KernelOp::ApplyRmsNorm { cursor, .. }
        | KernelOp::MatVec { cursor, .. }
        | KernelOp::RowMatVec { cursor, .. }
        | KernelOp::FusedSwiGlu { cursor, .. } => cursor.is_none(),
        _ => false,
    };
    if optional_cursor {
        slots.push(Slot {
            buffer: None,
            read_only: true,
        });
    }
    slots
}

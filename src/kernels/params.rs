//! Uniform blocks of the WGSL kernels.
//!
//! Field order matches the `Params` struct of the shader; every block is a
//! multiple of 16 bytes. `logical` is the number of invocations that map to
//! real work.

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ElementwiseParams {
    pub len: u32,
    pub logical: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ReduceParams {
    pub size: u32,
    pub logical: u32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FinishNormParams {
    pub size: u32,
    pub partials: u32,
    pub eps: f32,
    pub logical: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ApplyNormParams {
    pub size: u32,
    /// Non-zero when the layer is read from the cursor.
    pub layered: u32,
    pub _pad: u32,
    pub logical: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MatVecParams {
    pub in_dim: u32,
    pub out_dim: u32,
    pub layered: u32,
    pub logical: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RowMatVecParams {
    pub in_dim: u32,
    pub out_dim: u32,
    pub layered: u32,
    /// Non-zero to add the row result into the output instead of storing it.
    pub accumulate: u32,
    pub logical: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct SwiGluParams {
    pub in_dim: u32,
    pub hidden: u32,
    pub layered: u32,
    pub logical: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RopeParams {
    pub dim: u32,
    pub kv_dim: u32,
    pub head_size: u32,
    pub theta: f32,
    pub logical: u32,
    pub _pad: [u32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CacheWriteParams {
    pub kv_dim: u32,
    pub cache_len: u32,
    pub _pad: u32,
    pub logical: u32,
}

/// Shared by every attention kernel.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct AttentionParams {
    pub n_heads: u32,
    pub head_size: u32,
    pub kv_dim: u32,
    pub kv_mul: u32,
    pub context_length: u32,
    pub logical: u32,
    pub _pad: [u32; 2],
}

/// The uniform block of one launch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ShaderParams {
    Elementwise(ElementwiseParams),
    Reduce(ReduceParams),
    FinishNorm(FinishNormParams),
    ApplyNorm(ApplyNormParams),
    MatVec(MatVecParams),
    RowMatVec(RowMatVecParams),
    SwiGlu(SwiGluParams),
    Rope(RopeParams),
    CacheWrite(CacheWriteParams),
    Attention(AttentionParams),
}

impl ShaderParams {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ShaderParams::Elementwise(p) => bytemuck::bytes_of(p),
            ShaderParams::Reduce(p) => bytemuck::bytes_of(p),
            ShaderParams::FinishNorm(p) => bytemuck::bytes_of(p),
            ShaderParams::ApplyNorm(p) => bytemuck::bytes_of(p),
            ShaderParams::MatVec(p) => bytemuck::bytes_of(p),
            ShaderParams::RowMatVec(p) => bytemuck::bytes_of(p),
            ShaderParams::SwiGlu(p) => bytemuck::bytes_of(p),
            ShaderParams::Rope(p) => bytemuck::bytes_of(p),
            ShaderParams::CacheWrite(p) => bytemuck::bytes_of(p),
            ShaderParams::Attention(p) => bytemuck::bytes_of(p),
        }
    }
}

//! gllm-forward: a device-resident forward pass for decoder-only transformers.
//!
//! The forward pass of one token is a fixed graph of stages, each an ordered
//! list of compute kernels plus a declaration of how every buffer it touches
//! reaches the device and how long it stays there. The graph is validated
//! and compiled once; per token only the embedding row and a three-word
//! cursor (position, layer, cache offset) cross the host boundary.
//!
//! - **Kernels**: RMSNorm (tree reduction), projections, RoPE, KV cache
//!   writes, causal multi-head attention with grouped KV heads, SwiGLU.
//! - **Devices**: a CPU emulator of the workgroup model (always available)
//!   and WGSL compute shaders on `wgpu` (feature `wgpu`, default).
//! - **Parity**: a sequential [`reference`] model and the [`validation`]
//!   comparison used to check the devices against it.
//!
//! # Quick Start
//!
//! ```ignore
//! use gllm_forward::{EngineConfig, InferenceEngine, ModelConfig, Weights};
//!
//! let model = ModelConfig::from_json_file("model.json")?;
//! let weights = Weights::random(&model, 42)?;
//! let mut engine = InferenceEngine::new(EngineConfig::new(model), weights)?;
//! let tokens = engine.generate(&[1, 2, 3], 16)?;
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod layout;
pub mod model;
pub mod pipeline;
pub mod reference;
pub mod sampling;
pub mod stage;
pub mod state;
pub mod validation;
pub mod weights;

// WGSL compute shaders on wgpu
#[cfg(feature = "wgpu")]
pub mod wgpu_kernels;

pub use buffer::{BufferId, BufferKind, BufferRegistry, HostData, TransferPolicy};
pub use config::{AttentionKernel, EngineConfig, KernelPlan, LaunchConfig, ModelConfig};
pub use device::{select_device, ComputeDevice, CpuDevice, DeviceKind};
pub use engine::InferenceEngine;
pub use error::{ConfigError, EngineError, EngineResult};
pub use kernels::{Kernel, KernelOp};
pub use layout::{ThreadId, ThreadLayout};
pub use model::{ForwardGraph, ForwardStages};
pub use pipeline::{Pipeline, PipelineBuilder, TransferStats};
pub use reference::ReferenceModel;
pub use stage::{Stage, StageId};
pub use state::{Cursor, KvCacheLayout, ModelState};
pub use validation::{compare_buffers, ComparisonReport, Tolerance};
pub use weights::{TokenEmbedding, WeightBuffers, WeightRole, Weights};

#[cfg(feature = "wgpu")]
pub use wgpu_kernels::WgpuDevice;

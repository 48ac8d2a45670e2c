//! Error taxonomy for pipeline construction and execution.
//!
//! Configuration, layout, bounds, declaration and ordering errors are raised
//! while a [`Pipeline`](crate::pipeline::Pipeline) is built, before any kernel
//! is launched. Residency, range and device errors are raised while a pipeline
//! runs. Numerical drift is never an error here; it is reported by
//! [`validation`](crate::validation).

use thiserror::Error;

/// Invalid model hyperparameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must be > 0")]
    Zero { name: &'static str },
    #[error("dim {dim} is not divisible by n_heads {n_heads}")]
    HeadsDoNotDivideDim { dim: usize, n_heads: usize },
    #[error("n_heads {n_heads} is not divisible by n_kv_heads {n_kv_heads}")]
    KvHeadsDoNotDivideHeads { n_heads: usize, n_kv_heads: usize },
    #[error("head_size {head_size} must be even for rotary embedding")]
    OddHeadSize { head_size: usize },
    #[error("{name} spans {len} elements, beyond 32-bit kernel indexing")]
    IndexOverflow { name: &'static str, len: usize },
    #[error("invalid config file: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid launch layout for {kernel}: {reason}")]
    Layout { kernel: String, reason: String },
    #[error("buffer '{buffer}' has {actual} elements but {kernel} needs {required}")]
    Bounds {
        buffer: String,
        kernel: String,
        required: usize,
        actual: usize,
    },
    #[error("stage '{stage}' uses buffer '{buffer}' without declaring it")]
    UndeclaredBuffer { stage: String, buffer: String },
    #[error("stage '{stage}': {reason}")]
    Ordering { stage: String, reason: String },
    #[error("stage '{stage}' reads buffer '{buffer}' which is not resident on the device")]
    NotResident { stage: String, buffer: String },
    #[error("unknown buffer id {0}")]
    UnknownBuffer(usize),
    #[error("unknown stage id {0}")]
    UnknownStage(usize),
    #[error("buffer '{buffer}' holds {actual} data, expected {expected}")]
    BufferKind {
        buffer: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("token {token} is outside the vocabulary of {vocab_size}")]
    TokenOutOfRange { token: u32, vocab_size: usize },
    #[error("position {position} exceeds context length {context_length}")]
    ContextOverflow {
        position: usize,
        context_length: usize,
    },
    #[error("device error: {0}")]
    Device(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

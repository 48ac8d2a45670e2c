//! Token-by-token driver of the forward pipeline.

use crate::buffer::{BufferId, BufferRegistry};
use crate::config::{EngineConfig, LaunchConfig, ModelConfig};
use crate::device::{select_device, ComputeDevice};
use crate::error::{EngineError, EngineResult};
use crate::model::{reduce_groups, ForwardGraph, ForwardStages};
use crate::pipeline::{Pipeline, PipelineBuilder, TransferStats};
use crate::sampling;
use crate::state::{Cursor, ModelState};
use crate::weights::{TokenEmbedding, WeightBuffers, Weights};

/// Owns the registry, the built pipeline and the sequence position of one
/// inference context.
pub struct InferenceEngine {
    config: ModelConfig,
    embedding: TokenEmbedding,
    weight_buffers: WeightBuffers,
    state: ModelState,
    registry: BufferRegistry,
    pipeline: Pipeline,
    stages: ForwardStages,
    position: usize,
}

impl InferenceEngine {
    /// Select the configured device and build the forward pipeline.
    pub fn new(config: EngineConfig, weights: Weights) -> EngineResult<Self> {
        let device = select_device(config.device)?;
        Self::with_device(config.model, config.launch, weights, device)
    }

    pub fn with_device(
        config: ModelConfig,
        launch: LaunchConfig,
        weights: Weights,
        device: Box<dyn ComputeDevice>,
    ) -> EngineResult<Self> {
        config.validate()?;
        launch.validate()?;

        let mut registry = BufferRegistry::new();
        let (weight_buffers, embedding) = weights.into_registry(&config, &mut registry);
        let state = ModelState::register(&config, reduce_groups(&config, &launch), &mut registry);

        let mut builder = PipelineBuilder::new();
        let stages =
            ForwardGraph::new(&config, launch, &state, &weight_buffers)?.add_stages(&mut builder)?;
        let pipeline = builder.build(&registry, device)?;

        log::info!(
            "Inference engine ready: dim={} layers={} heads={}/{} vocab={} context={} on {}",
            config.dim,
            config.n_layers,
            config.n_heads,
            config.n_kv_heads,
            config.vocab_size,
            config.context_length,
            pipeline.device_name()
        );

        Ok(Self {
            config,
            embedding,
            weight_buffers,
            state,
            registry,
            pipeline,
            stages,
            position: 0,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Position the next token will be written at.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn state(&self) -> &ModelState {
        &self.state
    }

    pub fn weight_buffers(&self) -> &WeightBuffers {
        &self.weight_buffers
    }

    pub fn stages(&self) -> &ForwardStages {
        &self.stages
    }

    pub fn registry(&self) -> &BufferRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn stats(&self) -> TransferStats {
        self.pipeline.stats()
    }

    /// Logits of the last forward pass.
    pub fn logits(&self) -> EngineResult<&[f32]> {
        self.registry.f32(self.state.logits)
    }

    /// Refresh the host mirror of `buffer` from the device and return it.
    pub fn read_buffer(&mut self, buffer: BufferId) -> EngineResult<&[f32]> {
        self.pipeline.read_to_host(buffer, &mut self.registry)?;
        self.registry.f32(buffer)
    }

    /// Start a new sequence. Cache slots are overwritten before they are read,
    /// so the device cache is not cleared.
    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Run `token` at the current position and return the logits.
    pub fn forward(&mut self, token: u32) -> EngineResult<&[f32]> {
        if self.position >= self.config.context_length {
            return Err(EngineError::ContextOverflow {
                position: self.position,
                context_length: self.config.context_length,
            });
        }
        let embedding = self.embedding.row(token)?;
        self.registry.f32_mut(self.state.x)?.copy_from_slice(embedding);
        self.pipeline.write_from_host(self.state.x, &self.registry)?;

        for layer in 0..self.config.n_layers {
            let cursor = Cursor {
                position: self.position,
                layer,
            };
            self.state.set_cursor(cursor, &mut self.registry)?;
            for stage in self.stages.layer_stages() {
                self.pipeline.execute(stage, &mut self.registry)?;
            }
        }
        self.pipeline.execute(self.stages.final_rms, &mut self.registry)?;
        self.pipeline.execute(self.stages.logits, &mut self.registry)?;

        log::debug!("token {token} at position {} done", self.position);
        self.position += 1;
        self.logits()
    }

    /// Feed `prompt`, then greedily generate `steps` tokens. Returns the
    /// generated tokens only.
    pub fn generate(&mut self, prompt: &[u32], steps: usize) -> EngineResult<Vec<u32>> {
        let Some((&last, head)) = prompt.split_last() else {
            return Ok(Vec::new());
        };
        for &token in head {
            self.forward(token)?;
        }
        let mut next = sampling::argmax(self.forward(last)?);
        let mut generated = Vec::with_capacity(steps);
        for step in 0..steps {
            generated.push(next);
            if step + 1 < steps {
                next = sampling::argmax(self.forward(next)?);
            }
        }
        Ok(generated)
    }

    /// One throwaway forward pass so every kernel is compiled and every
    /// `CopyOnce` buffer is resident, then reset.
    pub fn warmup(&mut self) -> EngineResult<()> {
        self.forward(0)?;
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuDevice;

    fn engine(context: usize) -> InferenceEngine {
        let config = ModelConfig::new(16, 32, 1, 2, 1, 32, context, 1e-5, 10000.0).unwrap();
        let launch = LaunchConfig::for_model(&config);
        let weights = Weights::random(&config, 11).unwrap();
        InferenceEngine::with_device(config, launch, weights, Box::new(CpuDevice::new())).unwrap()
    }

    #[test]
    fn forward_advances_position_and_fills_logits() {
        let mut engine = engine(8);
        let logits = engine.forward(3).unwrap().to_vec();
        assert_eq!(logits.len(), 32);
        assert!(logits.iter().all(|v| v.is_finite()));
        assert!(logits.iter().any(|v| *v != 0.0));
        assert_eq!(engine.position(), 1);
    }

    #[test]
    fn context_overflow_and_token_range() {
        let mut engine = engine(2);
        assert!(matches!(
            engine.forward(99),
            Err(EngineError::TokenOutOfRange { token: 99, .. })
        ));
        engine.forward(1).unwrap();
        engine.forward(2).unwrap();
        assert!(matches!(
            engine.forward(3),
            Err(EngineError::ContextOverflow { position: 2, .. })
        ));
        engine.reset();
        engine.forward(3).unwrap();
    }

    #[test]
    fn copy_once_weights_upload_once() {
        let mut engine = engine(8);
        engine.warmup().unwrap();
        let after_first = engine.stats().uploads;
        engine.forward(1).unwrap();
        // per token: x, and the cursor once per layer
        assert_eq!(engine.stats().uploads - after_first, 2);
    }

    #[test]
    fn generate_returns_requested_count() {
        let mut engine = engine(8);
        let out = engine.generate(&[1, 2], 3).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(engine.position(), 4);
        assert!(out.iter().all(|&t| (t as usize) < 32));
    }
}

//! Pipelines: a chain of stages validated once and executed one stage at a
//! time against a single [`ComputeDevice`].
//!
//! # Buffer lifetime
//!
//! The pipeline keeps a residency table: whether the device copy of each
//! registry buffer is valid. Before a stage runs, its inbound transfers are
//! performed (`CopyOnce` only before the stage's first invocation,
//! `CopyEveryCall` every time). Consumed buffers, and every buffer a kernel
//! reads, must already be resident. Kernel writes make a buffer resident.
//! After the stage, `CopyOut` buffers are downloaded into the registry and
//! declared buffers that are neither persisted nor `CopyOnce` are released.
//!
//! Cursor words are shadowed on the host as they are uploaded, and every
//! launch that reads a cursor has them checked against the ranges the kernel
//! indexes, so an out-of-window position fails the same way on every device.
//!
//! Structural mistakes (undeclared buffers, undersized buffers, bad launch
//! shapes, consuming a buffer the producer does not persist) are rejected by
//! [`PipelineBuilder::build`] before any kernel is launched.

use std::collections::BTreeSet;

use crate::buffer::{BufferId, BufferRegistry, HostData, TransferPolicy};
use crate::device::ComputeDevice;
use crate::error::{EngineError, EngineResult};
use crate::kernels::Kernel;
use crate::stage::{Inbound, Stage, StageId};

/// Host↔device traffic and launches since the pipeline was built.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub uploads: u64,
    pub downloads: u64,
    pub launches: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
}

#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id the next added stage will receive.
    pub fn next_id(&self) -> StageId {
        StageId(self.stages.len())
    }

    pub fn add_stage(&mut self, stage: Stage) -> StageId {
        let id = self.next_id();
        self.stages.push(stage);
        id
    }

    /// Validate every stage against `registry`, allocate the declared buffers
    /// on `device` and prepare every kernel.
    pub fn build(
        self,
        registry: &BufferRegistry,
        mut device: Box<dyn ComputeDevice>,
    ) -> EngineResult<Pipeline> {
        let stages = self.stages;
        let mut declared = BTreeSet::new();

        for (index, stage) in stages.iter().enumerate() {
            if let Some(conflict) = stage.conflicts().first() {
                return Err(EngineError::Ordering {
                    stage: stage.name().to_string(),
                    reason: conflict.clone(),
                });
            }
            for decl in stage.decls() {
                registry.desc(decl.buffer)?;
                declared.insert(decl.buffer);
                if let Some(Inbound::Consume(producer)) = decl.inbound {
                    check_producer(&stages, index, producer, decl.buffer, registry)?;
                }
            }
            for kernel in stage.kernels() {
                kernel.check_layout()?;
                check_kernel_bindings(stage, kernel, registry)?;
            }
        }

        for &id in &declared {
            device.allocate(id, registry.desc(id)?)?;
        }
        for stage in &stages {
            for kernel in stage.kernels() {
                device.prepare(kernel)?;
            }
        }

        log::info!(
            "Built pipeline on {}: {} stages, {} kernels, {} device buffers",
            device.name(),
            stages.len(),
            stages.iter().map(|s| s.kernels().len()).sum::<usize>(),
            declared.len()
        );

        let n_buffers = registry.len();
        Ok(Pipeline {
            invocations: vec![0; stages.len()],
            stages,
            ctx: DeviceContext {
                device,
                allocated: (0..n_buffers).map(|i| declared.contains(&BufferId(i))).collect(),
                resident: vec![false; n_buffers],
                cursors: vec![None; n_buffers],
                stats: TransferStats::default(),
            },
        })
    }
}

fn check_producer(
    stages: &[Stage],
    consumer: usize,
    producer: StageId,
    buffer: BufferId,
    registry: &BufferRegistry,
) -> EngineResult<()> {
    let stage = &stages[consumer];
    let fail = |reason: String| EngineError::Ordering {
        stage: stage.name().to_string(),
        reason,
    };
    let Some(source) = stages.get(producer.index()) else {
        return Err(fail(format!(
            "consumes '{}' from unknown stage {}",
            registry.name(buffer),
            producer.index()
        )));
    };
    if producer.index() == consumer {
        return Err(fail(format!(
            "consumes '{}' from itself",
            registry.name(buffer)
        )));
    }
    if !source.decl(buffer).is_some_and(|d| d.persist) {
        return Err(fail(format!(
            "consumes '{}' from '{}' which does not persist it",
            registry.name(buffer),
            source.name()
        )));
    }
    Ok(())
}

fn check_kernel_bindings(
    stage: &Stage,
    kernel: &Kernel,
    registry: &BufferRegistry,
) -> EngineResult<()> {
    let bindings = kernel.bindings();
    for (i, binding) in bindings.iter().enumerate() {
        if stage.decl(binding.buffer).is_none() {
            return Err(EngineError::UndeclaredBuffer {
                stage: stage.name().to_string(),
                buffer: registry.name(binding.buffer),
            });
        }
        let desc = registry.desc(binding.buffer)?;
        if desc.kind != binding.kind {
            return Err(EngineError::BufferKind {
                buffer: desc.name.clone(),
                expected: binding.kind.name(),
                actual: desc.kind.name(),
            });
        }
        if desc.len < binding.min_len {
            return Err(EngineError::Bounds {
                buffer: desc.name.clone(),
                kernel: kernel.name().to_string(),
                required: binding.min_len,
                actual: desc.len,
            });
        }
        let aliased = bindings[i + 1..]
            .iter()
            .any(|other| other.buffer == binding.buffer);
        if aliased {
            return Err(EngineError::Layout {
                kernel: kernel.name().to_string(),
                reason: format!("buffer '{}' bound more than once", desc.name),
            });
        }
    }
    Ok(())
}

/// The device plus what the pipeline knows about the device copies.
struct DeviceContext {
    device: Box<dyn ComputeDevice>,
    allocated: Vec<bool>,
    resident: Vec<bool>,
    /// Last uploaded contents of every u32 buffer. Kernels never write them.
    cursors: Vec<Option<Vec<u32>>>,
    stats: TransferStats,
}

impl DeviceContext {
    fn check_allocated(&self, buffer: BufferId) -> EngineResult<()> {
        if self.allocated.get(buffer.0).copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(EngineError::UnknownBuffer(buffer.0))
        }
    }

    fn is_resident(&self, buffer: BufferId) -> bool {
        self.resident.get(buffer.0).copied().unwrap_or(false)
    }

    fn set_resident(&mut self, buffer: BufferId, resident: bool) {
        if let Some(slot) = self.resident.get_mut(buffer.0) {
            *slot = resident;
        }
    }

    fn upload(&mut self, buffer: BufferId, registry: &BufferRegistry) -> EngineResult<()> {
        self.check_allocated(buffer)?;
        let host = registry.host(buffer)?;
        self.device.upload(buffer, host)?;
        if let (HostData::U32(words), Some(shadow)) = (host, self.cursors.get_mut(buffer.0)) {
            *shadow = Some(words.clone());
        }
        self.stats.uploads += 1;
        self.stats.bytes_uploaded += host.size_bytes() as u64;
        self.set_resident(buffer, true);
        log::debug!("upload '{}' ({} bytes)", registry.name(buffer), host.size_bytes());
        Ok(())
    }

    fn check_cursor(&self, kernel: &Kernel) -> EngineResult<()> {
        let words = kernel
            .op
            .cursor()
            .and_then(|id| self.cursors.get(id.0))
            .and_then(Option::as_deref);
        match words {
            Some(words) => kernel.op.check_cursor(words),
            None => Ok(()),
        }
    }

    fn download(&mut self, buffer: BufferId, registry: &mut BufferRegistry) -> EngineResult<()> {
        self.check_allocated(buffer)?;
        let name = registry.name(buffer);
        let host = registry.host_mut(buffer)?;
        self.device.download(buffer, host)?;
        self.stats.downloads += 1;
        self.stats.bytes_downloaded += host.size_bytes() as u64;
        log::debug!("download '{name}' ({} bytes)", host.size_bytes());
        Ok(())
    }
}

/// A validated chain of stages bound to one device.
pub struct Pipeline {
    stages: Vec<Stage>,
    invocations: Vec<u64>,
    ctx: DeviceContext,
}

impl Pipeline {
    pub fn stage(&self, id: StageId) -> EngineResult<&Stage> {
        self.stages
            .get(id.index())
            .ok_or(EngineError::UnknownStage(id.index()))
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn device_name(&self) -> &str {
        self.ctx.device.name()
    }

    pub fn stats(&self) -> TransferStats {
        self.ctx.stats
    }

    /// Times `id` has completed.
    pub fn invocations(&self, id: StageId) -> u64 {
        self.invocations.get(id.index()).copied().unwrap_or(0)
    }

    pub fn is_resident(&self, buffer: BufferId) -> bool {
        self.ctx.is_resident(buffer)
    }

    /// Run one stage to completion.
    pub fn execute(&mut self, id: StageId, registry: &mut BufferRegistry) -> EngineResult<()> {
        let stage = self
            .stages
            .get(id.index())
            .ok_or(EngineError::UnknownStage(id.index()))?;
        let first = self.invocations[id.index()] == 0;
        let ctx = &mut self.ctx;
        log::debug!(
            "stage '{}' invocation {}",
            stage.name(),
            self.invocations[id.index()]
        );

        for decl in stage.decls() {
            match decl.inbound {
                Some(Inbound::Transfer(TransferPolicy::CopyEveryCall)) => {
                    ctx.upload(decl.buffer, registry)?;
                }
                Some(Inbound::Transfer(TransferPolicy::CopyOnce)) if first => {
                    ctx.upload(decl.buffer, registry)?;
                }
                Some(Inbound::Consume(_)) if !ctx.is_resident(decl.buffer) => {
                    return Err(EngineError::NotResident {
                        stage: stage.name().to_string(),
                        buffer: registry.name(decl.buffer),
                    });
                }
                _ => {}
            }
        }

        for kernel in stage.kernels() {
            let bindings = kernel.bindings();
            for binding in &bindings {
                if binding.access.reads() && !ctx.is_resident(binding.buffer) {
                    return Err(EngineError::NotResident {
                        stage: stage.name().to_string(),
                        buffer: registry.name(binding.buffer),
                    });
                }
            }
            ctx.check_cursor(kernel)?;
            ctx.device.launch(kernel)?;
            ctx.stats.launches += 1;
            for binding in &bindings {
                if binding.access.writes() {
                    ctx.set_resident(binding.buffer, true);
                }
            }
        }

        for decl in stage.decls() {
            if decl.copy_out {
                if !ctx.is_resident(decl.buffer) {
                    return Err(EngineError::NotResident {
                        stage: stage.name().to_string(),
                        buffer: registry.name(decl.buffer),
                    });
                }
                ctx.download(decl.buffer, registry)?;
            }
        }
        for decl in stage.decls() {
            if decl.released_after() {
                ctx.set_resident(decl.buffer, false);
            }
        }

        self.invocations[id.index()] += 1;
        Ok(())
    }

    /// Make `buffer` valid on the device for stage `as_of`.
    ///
    /// Uploads the host copy only when the device copy is not resident, so
    /// calling it again is a no-op. Returns after the device has drained.
    pub fn ensure_resident(
        &mut self,
        buffer: BufferId,
        as_of: StageId,
        registry: &BufferRegistry,
    ) -> EngineResult<()> {
        let stage = self
            .stages
            .get(as_of.index())
            .ok_or(EngineError::UnknownStage(as_of.index()))?;
        if stage.decl(buffer).is_none() {
            return Err(EngineError::UndeclaredBuffer {
                stage: stage.name().to_string(),
                buffer: registry.name(buffer),
            });
        }
        if !self.ctx.is_resident(buffer) {
            self.ctx.upload(buffer, registry)?;
        }
        self.ctx.device.synchronize()
    }

    /// Unconditional host→device copy of `buffer`.
    pub fn write_from_host(&mut self, buffer: BufferId, registry: &BufferRegistry) -> EngineResult<()> {
        self.ctx.upload(buffer, registry)
    }

    /// Device→host copy of a resident buffer, outside any stage.
    pub fn read_to_host(&mut self, buffer: BufferId, registry: &mut BufferRegistry) -> EngineResult<()> {
        if !self.ctx.is_resident(buffer) {
            return Err(EngineError::NotResident {
                stage: "host read".to_string(),
                buffer: registry.name(buffer),
            });
        }
        self.ctx.download(buffer, registry)
    }
}

//! CPU device: device memory is a table of host vectors, kernels run on the
//! SPMD emulator.

use super::{check_bindings, ComputeDevice};
use crate::buffer::{BufferDesc, BufferId, BufferKind, HostData};
use crate::error::{EngineError, EngineResult};
use crate::kernels::{cpu, Kernel, KernelOp, CURSOR_CACHE_OFFSET, CURSOR_LAYER, CURSOR_POSITION};

#[derive(Debug, Default)]
pub struct CpuDevice {
    memory: Vec<Option<HostData>>,
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: BufferId) -> EngineResult<&HostData> {
        self.memory
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(EngineError::UnknownBuffer(id.0))
    }

    fn f32(&self, id: BufferId) -> EngineResult<&[f32]> {
        match self.slot(id)? {
            HostData::F32(v) => Ok(v),
            HostData::U32(_) => Err(kind_error(id, BufferKind::F32, BufferKind::U32)),
        }
    }

    fn u32(&self, id: BufferId) -> EngineResult<&[u32]> {
        match self.slot(id)? {
            HostData::U32(v) => Ok(v),
            HostData::F32(_) => Err(kind_error(id, BufferKind::U32, BufferKind::F32)),
        }
    }

    fn cursor_word(&self, cursor: Option<BufferId>, word: usize) -> EngineResult<usize> {
        match cursor {
            Some(id) => Ok(self.u32(id)?[word] as usize),
            None => Ok(0),
        }
    }

    /// Move an output out of device memory so it can be written while the
    /// inputs stay borrowed. Must be paired with [`CpuDevice::put`].
    fn take_f32(&mut self, id: BufferId) -> EngineResult<Vec<f32>> {
        let slot = self
            .memory
            .get_mut(id.0)
            .ok_or(EngineError::UnknownBuffer(id.0))?;
        match slot.take() {
            Some(HostData::F32(v)) => Ok(v),
            Some(other) => {
                *slot = Some(other);
                Err(kind_error(id, BufferKind::F32, BufferKind::U32))
            }
            None => Err(EngineError::UnknownBuffer(id.0)),
        }
    }

    fn put(&mut self, id: BufferId, data: Vec<f32>) {
        if let Some(slot) = self.memory.get_mut(id.0) {
            *slot = Some(HostData::F32(data));
        }
    }

    /// Run `body` with `out` writable and the rest of device memory readable.
    fn with_output<F>(&mut self, out: BufferId, body: F) -> EngineResult<()>
    where
        F: FnOnce(&Self, &mut [f32]) -> EngineResult<()>,
    {
        let mut data = self.take_f32(out)?;
        let result = body(self, &mut data);
        self.put(out, data);
        result
    }

    fn with_outputs<F>(&mut self, a: BufferId, b: BufferId, body: F) -> EngineResult<()>
    where
        F: FnOnce(&Self, &mut [f32], &mut [f32]) -> EngineResult<()>,
    {
        let mut first = self.take_f32(a)?;
        let mut second = match self.take_f32(b) {
            Ok(v) => v,
            Err(e) => {
                self.put(a, first);
                return Err(e);
            }
        };
        let result = body(self, &mut first, &mut second);
        self.put(a, first);
        self.put(b, second);
        result
    }

    fn run(&mut self, kernel: &Kernel) -> EngineResult<()> {
        let layout = &kernel.layout;
        match kernel.op {
            KernelOp::ReduceSumSquares {
                input,
                reduce,
                size,
            } => self.with_output(reduce, |dev, reduce| {
                cpu::reduce_sum_squares(layout, dev.f32(input)?, reduce, size as usize);
                Ok(())
            }),
            KernelOp::FinishRmsNorm {
                reduce,
                partials,
                size,
                eps,
            } => self.with_output(reduce, |_, reduce| {
                cpu::finish_rms_norm(reduce, partials as usize, size as usize, eps);
                Ok(())
            }),
            KernelOp::ApplyRmsNorm {
                out,
                input,
                weight,
                reduce,
                cursor,
                size,
                ..
            } => self.with_output(out, |dev, out| {
                let layer = dev.cursor_word(cursor, CURSOR_LAYER)?;
                let scale = dev.f32(reduce)?[0];
                cpu::apply_rms_norm(
                    layout,
                    out,
                    dev.f32(input)?,
                    dev.f32(weight)?,
                    scale,
                    layer,
                    size as usize,
                )
            }),
            KernelOp::MatVec {
                out,
                input,
                weight,
                cursor,
                in_dim,
                out_dim,
                ..
            } => self.with_output(out, |dev, out| {
                let layer = dev.cursor_word(cursor, CURSOR_LAYER)?;
                cpu::matvec(
                    layout,
                    out,
                    dev.f32(input)?,
                    dev.f32(weight)?,
                    layer,
                    in_dim as usize,
                    out_dim as usize,
                )
            }),
            KernelOp::RowMatVec {
                out,
                input,
                weight,
                cursor,
                in_dim,
                out_dim,
                accumulate,
                ..
            } => self.with_output(out, |dev, out| {
                let layer = dev.cursor_word(cursor, CURSOR_LAYER)?;
                cpu::row_matvec(
                    layout,
                    out,
                    dev.f32(input)?,
                    dev.f32(weight)?,
                    layer,
                    in_dim as usize,
                    out_dim as usize,
                    accumulate,
                )
            }),
            KernelOp::FusedSwiGlu {
                out,
                input,
                w1,
                w3,
                cursor,
                in_dim,
                hidden,
                ..
            } => self.with_output(out, |dev, out| {
                let layer = dev.cursor_word(cursor, CURSOR_LAYER)?;
                cpu::fused_swiglu(
                    layout,
                    out,
                    dev.f32(input)?,
                    dev.f32(w1)?,
                    dev.f32(w3)?,
                    layer,
                    in_dim as usize,
                    hidden as usize,
                )
            }),
            KernelOp::Rope {
                q,
                k,
                cursor,
                dim,
                kv_dim,
                head_size,
                theta,
            } => self.with_outputs(q, k, |dev, q, k| {
                let position = dev.cursor_word(Some(cursor), CURSOR_POSITION)?;
                cpu::rope(
                    layout,
                    q,
                    k,
                    position,
                    dim as usize,
                    kv_dim as usize,
                    head_size as usize,
                    theta,
                );
                Ok(())
            }),
            KernelOp::CacheWrite {
                cache,
                src,
                cursor,
                kv_dim,
                ..
            } => self.with_output(cache, |dev, cache| {
                let offset = dev.cursor_word(Some(cursor), CURSOR_CACHE_OFFSET)?;
                cpu::cache_write(layout, cache, dev.f32(src)?, offset, kv_dim as usize)
            }),
            KernelOp::AttentionScores {
                att,
                q,
                key_cache,
                cursor,
                dims,
            } => self.with_output(att, |dev, att| {
                let position = dev.cursor_word(Some(cursor), CURSOR_POSITION)?;
                let layer = dev.cursor_word(Some(cursor), CURSOR_LAYER)?;
                cpu::attention_scores(
                    layout,
                    att,
                    dev.f32(q)?,
                    dev.f32(key_cache)?,
                    position,
                    layer,
                    &dims,
                )
            }),
            KernelOp::AttentionMax {
                att,
                att_max,
                cursor,
                dims,
            } => self.with_output(att_max, |dev, att_max| {
                let position = dev.cursor_word(Some(cursor), CURSOR_POSITION)?;
                cpu::attention_max(layout, dev.f32(att)?, att_max, position, &dims)
            }),
            KernelOp::AttentionExpSum {
                att,
                att_max,
                att_sum,
                cursor,
                dims,
            } => self.with_outputs(att, att_sum, |dev, att, att_sum| {
                let position = dev.cursor_word(Some(cursor), CURSOR_POSITION)?;
                cpu::attention_exp_sum(layout, att, dev.f32(att_max)?, att_sum, position, &dims)
            }),
            KernelOp::AttentionWeightedSum {
                out,
                att,
                att_sum,
                value_cache,
                cursor,
                dims,
            } => self.with_outputs(out, att, |dev, out, att| {
                let position = dev.cursor_word(Some(cursor), CURSOR_POSITION)?;
                let layer = dev.cursor_word(Some(cursor), CURSOR_LAYER)?;
                cpu::attention_weighted_sum(
                    layout,
                    out,
                    att,
                    dev.f32(att_sum)?,
                    dev.f32(value_cache)?,
                    position,
                    layer,
                    &dims,
                )
            }),
            KernelOp::AttentionHeads {
                out,
                att,
                q,
                key_cache,
                value_cache,
                cursor,
                dims,
            } => self.with_outputs(out, att, |dev, out, att| {
                let position = dev.cursor_word(Some(cursor), CURSOR_POSITION)?;
                let layer = dev.cursor_word(Some(cursor), CURSOR_LAYER)?;
                cpu::attention_heads(
                    out,
                    att,
                    dev.f32(q)?,
                    dev.f32(key_cache)?,
                    dev.f32(value_cache)?,
                    position,
                    layer,
                    &dims,
                )
            }),
            KernelOp::FlashAttention {
                out,
                q,
                key_cache,
                value_cache,
                cursor,
                dims,
            } => self.with_output(out, |dev, out| {
                let position = dev.cursor_word(Some(cursor), CURSOR_POSITION)?;
                let layer = dev.cursor_word(Some(cursor), CURSOR_LAYER)?;
                cpu::flash_attention(
                    layout,
                    out,
                    dev.f32(q)?,
                    dev.f32(key_cache)?,
                    dev.f32(value_cache)?,
                    position,
                    layer,
                    &dims,
                )
            }),
            KernelOp::AddInPlace { out, input, len } => self.with_output(out, |dev, out| {
                cpu::add_in_place(layout, out, dev.f32(input)?, len as usize);
                Ok(())
            }),
            KernelOp::MulInPlace { out, input, len } => self.with_output(out, |dev, out| {
                cpu::mul_in_place(layout, out, dev.f32(input)?, len as usize);
                Ok(())
            }),
            KernelOp::Silu { data, len } => self.with_output(data, |_, data| {
                cpu::silu(layout, data, len as usize);
                Ok(())
            }),
        }
    }
}

fn kind_error(id: BufferId, expected: BufferKind, actual: BufferKind) -> EngineError {
    EngineError::BufferKind {
        buffer: format!("#{}", id.0),
        expected: expected.name(),
        actual: actual.name(),
    }
}

impl ComputeDevice for CpuDevice {
    fn name(&self) -> &str {
        "cpu-spmd"
    }

    fn allocate(&mut self, id: BufferId, desc: &BufferDesc) -> EngineResult<()> {
        if self.memory.len() <= id.0 {
            self.memory.resize_with(id.0 + 1, || None);
        }
        let data = match desc.kind {
            BufferKind::F32 => HostData::F32(vec![0.0; desc.len]),
            BufferKind::U32 => HostData::U32(vec![0; desc.len]),
        };
        self.memory[id.0] = Some(data);
        Ok(())
    }

    fn upload(&mut self, id: BufferId, data: &HostData) -> EngineResult<()> {
        let slot = self
            .memory
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(EngineError::UnknownBuffer(id.0))?;
        if slot.kind() != data.kind() || slot.len() != data.len() {
            return Err(EngineError::Device(format!(
                "upload of {} {} elements into #{} holding {} {}",
                data.len(),
                data.kind().name(),
                id.0,
                slot.len(),
                slot.kind().name()
            )));
        }
        slot.clone_from(data);
        Ok(())
    }

    fn download(&mut self, id: BufferId, data: &mut HostData) -> EngineResult<()> {
        let slot = self.slot(id)?;
        data.copy_from_bytes(slot.as_bytes());
        Ok(())
    }

    fn launch(&mut self, kernel: &Kernel) -> EngineResult<()> {
        check_bindings(kernel, |id| self.slot(id).ok().map(HostData::len))?;
        if let Some(cursor) = kernel.op.cursor() {
            kernel.op.check_cursor(self.u32(cursor)?)?;
        }
        log::trace!("cpu launch {} {:?}", kernel.name(), kernel.layout);
        self.run(kernel)
    }

    fn synchronize(&mut self) -> EngineResult<()> {
        Ok(())
    }
}

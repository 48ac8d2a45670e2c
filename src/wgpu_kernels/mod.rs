//! WGPU compute device.
//!
//! Each [`KernelOp`](crate::kernels::KernelOp) variant is one WGSL shader
//! module, compiled once per workgroup size. Launches are blocking: every
//! dispatch is submitted on its own and the queue is drained before
//! `launch` returns.

pub mod shaders;

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::buffer::{BufferDesc, BufferId, BufferKind, HostData};
use crate::device::{check_bindings, ComputeDevice};
use crate::error::{EngineError, EngineResult};
use crate::kernels::Kernel;

use shaders::Slot;

struct DeviceBuffer {
    buffer: wgpu::Buffer,
    len: usize,
    kind: BufferKind,
}

struct CompiledKernel {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    buffers: Vec<Option<DeviceBuffer>>,
    kernels: HashMap<(&'static str, u32), CompiledKernel>,
    limits: wgpu::Limits,
    /// Bound where a shader declares a cursor the op does not use.
    placeholder: wgpu::Buffer,
}

fn device_error(context: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Device(format!("{context}: {err}"))
}

/// Every buffer is bound as a whole storage binding, so it must fit both the
/// allocation limit and the binding limit of the device.
pub(crate) fn check_buffer_limits(desc: &BufferDesc, limits: &wgpu::Limits) -> EngineResult<()> {
    let bytes = desc.len.max(1) as u64 * 4;
    let cap = limits
        .max_buffer_size
        .min(u64::from(limits.max_storage_buffer_binding_size));
    if bytes > cap {
        return Err(EngineError::Bounds {
            buffer: desc.name.clone(),
            kernel: "allocate".to_string(),
            required: desc.len,
            actual: (cap / 4) as usize,
        });
    }
    Ok(())
}

pub(crate) fn check_dispatch_limits(kernel: &Kernel, limits: &wgpu::Limits) -> EngineResult<()> {
    let groups = kernel.layout.num_groups();
    if groups > limits.max_compute_workgroups_per_dimension {
        return Err(EngineError::Layout {
            kernel: kernel.name().to_string(),
            reason: format!(
                "{groups} workgroups exceed the device limit of {}",
                limits.max_compute_workgroups_per_dimension
            ),
        });
    }
    if kernel.layout.group_size > limits.max_compute_invocations_per_workgroup {
        return Err(EngineError::Layout {
            kernel: kernel.name().to_string(),
            reason: format!(
                "group size {} exceeds the device limit of {}",
                kernel.layout.group_size, limits.max_compute_invocations_per_workgroup
            ),
        });
    }
    Ok(())
}

fn uniform_layout_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_layout_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl WgpuDevice {
    /// Request a high-performance adapter and a device with everything the
    /// adapter supports, so large weight matrices can be bound whole.
    pub fn new() -> EngineResult<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| device_error("request adapter", e))?;
        let adapter_name = adapter.get_info().name;
        let limits = adapter.limits();

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("gllm-forward"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| device_error("request device", e))?;

        let placeholder = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("cursor placeholder"),
            contents: bytemuck::cast_slice(&[0u32; 4]),
            usage: wgpu::BufferUsages::STORAGE,
        });

        log::info!(
            "WGPU adapter: {adapter_name} (max buffer {} bytes, max binding {} bytes)",
            limits.max_buffer_size,
            limits.max_storage_buffer_binding_size
        );
        Ok(Self {
            device,
            queue,
            adapter_name,
            buffers: Vec::new(),
            kernels: HashMap::new(),
            limits,
            placeholder,
        })
    }

    fn buffer(&self, id: BufferId) -> EngineResult<&DeviceBuffer> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(EngineError::UnknownBuffer(id.0))
    }

    fn poll(&self) -> EngineResult<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| device_error("poll", e))
    }

    fn compile(&self, kernel: &Kernel) -> EngineResult<CompiledKernel> {
        let name = kernel.name();
        let group_size = kernel.layout.group_size;
        let slots = shaders::slots(&kernel.op, &kernel.bindings());

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(shaders::source(&kernel.op, group_size).into()),
        });

        let mut entries = vec![uniform_layout_entry(0)];
        entries.extend(
            slots
                .iter()
                .enumerate()
                .map(|(i, slot)| storage_layout_entry(i as u32 + 1, slot.read_only)),
        );
        let bind_group_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(name),
                entries: &entries,
            });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(name),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(name),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                cache: None,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            });

        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(device_error(&format!("compile {name} (group {group_size})"), err));
        }
        log::debug!("Compiled WGSL kernel {name} with workgroup size {group_size}");

        Ok(CompiledKernel {
            pipeline,
            bind_group_layout,
        })
    }

    fn resource<'a>(&'a self, slot: &Slot) -> EngineResult<wgpu::BindingResource<'a>> {
        match slot.buffer {
            Some(id) => Ok(self.buffer(id)?.buffer.as_entire_binding()),
            None => Ok(self.placeholder.as_entire_binding()),
        }
    }
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn allocate(&mut self, id: BufferId, desc: &BufferDesc) -> EngineResult<()> {
        check_buffer_limits(desc, &self.limits)?;
        if self.buffers.len() <= id.0 {
            self.buffers.resize_with(id.0 + 1, || None);
        }
        let size = (desc.len.max(1) * 4) as wgpu::BufferAddress;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(desc.name.as_str()),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        self.buffers[id.0] = Some(DeviceBuffer {
            buffer,
            len: desc.len,
            kind: desc.kind,
        });
        Ok(())
    }

    fn upload(&mut self, id: BufferId, data: &HostData) -> EngineResult<()> {
        let target = self.buffer(id)?;
        if target.kind != data.kind() || target.len != data.len() {
            return Err(EngineError::Device(format!(
                "upload of {} {} elements into #{} holding {} {}",
                data.len(),
                data.kind().name(),
                id.0,
                target.len,
                target.kind.name()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.queue.write_buffer(&target.buffer, 0, data.as_bytes());
        Ok(())
    }

    fn download(&mut self, id: BufferId, data: &mut HostData) -> EngineResult<()> {
        let source = self.buffer(id)?;
        let len = data.len().min(source.len);
        if len == 0 {
            return Ok(());
        }
        let size_bytes = (len * 4) as wgpu::BufferAddress;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: size_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging, 0, size_bytes);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.poll()?;
        receiver
            .recv()
            .map_err(|_| EngineError::Device("map_async channel closed".to_string()))?
            .map_err(|e| device_error("map_async", e))?;

        {
            let mapped = slice.get_mapped_range();
            data.copy_from_bytes(&mapped);
        }
        staging.unmap();
        Ok(())
    }

    fn prepare(&mut self, kernel: &Kernel) -> EngineResult<()> {
        check_dispatch_limits(kernel, &self.limits)?;
        let key = (kernel.name(), kernel.layout.group_size);
        if !self.kernels.contains_key(&key) {
            let compiled = self.compile(kernel)?;
            self.kernels.insert(key, compiled);
        }
        Ok(())
    }

    fn launch(&mut self, kernel: &Kernel) -> EngineResult<()> {
        check_bindings(kernel, |id| self.buffer(id).ok().map(|b| b.len))?;
        self.prepare(kernel)?;
        let key = (kernel.name(), kernel.layout.group_size);
        let compiled = self
            .kernels
            .get(&key)
            .ok_or_else(|| EngineError::Device(format!("kernel {} not compiled", key.0)))?;

        let uniforms = kernel.params();
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("kernel params"),
                contents: uniforms.as_bytes(),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let slots = shaders::slots(&kernel.op, &kernel.bindings());
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: params.as_entire_binding(),
        }];
        for (i, slot) in slots.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: self.resource(slot)?,
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(kernel.name()),
            layout: &compiled.bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernel.name()),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(kernel.name()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&compiled.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(kernel.layout.num_groups(), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        log::trace!("wgpu launch {} {:?}", kernel.name(), kernel.layout);
        self.poll()
    }

    fn synchronize(&mut self) -> EngineResult<()> {
        self.poll()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::KernelOp;
    use crate::layout::ThreadLayout;

    fn desc(len: usize) -> BufferDesc {
        BufferDesc {
            name: "wcls".to_string(),
            kind: BufferKind::F32,
            len,
        }
    }

    #[test]
    fn buffers_beyond_binding_limit_are_refused() {
        let limits = wgpu::Limits::default();
        let binding_floats = limits.max_storage_buffer_binding_size as usize / 4;
        check_buffer_limits(&desc(binding_floats), &limits).unwrap();
        let err = check_buffer_limits(&desc(binding_floats + 1), &limits).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Bounds { ref buffer, actual, .. } if buffer == "wcls" && actual == binding_floats
        ));

        let roomy = wgpu::Limits {
            max_storage_buffer_binding_size: u32::MAX,
            max_buffer_size: 1 << 30,
            ..wgpu::Limits::default()
        };
        assert!(check_buffer_limits(&desc((1 << 28) + 1), &roomy).is_err());
    }

    #[test]
    fn dispatch_beyond_workgroup_limit_is_layout_error() {
        let limits = wgpu::Limits::default();
        let rows = limits.max_compute_workgroups_per_dimension + 1;
        let op = KernelOp::RowMatVec {
            out: BufferId(0),
            input: BufferId(1),
            weight: BufferId(2),
            cursor: None,
            in_dim: 8,
            out_dim: rows,
            layers: 1,
            accumulate: false,
        };
        let kernel = Kernel::new(op, ThreadLayout::groups(rows as usize, 32));
        let err = check_dispatch_limits(&kernel, &limits).unwrap_err();
        assert!(matches!(err, EngineError::Layout { .. }));

        let silu = KernelOp::Silu {
            data: BufferId(0),
            len: 1024,
        };
        check_dispatch_limits(&Kernel::new(silu, ThreadLayout::linear(1024, 256)), &limits).unwrap();
    }
}

//! Named, typed buffers and their host mirrors.
//!
//! A [`BufferRegistry`] owns the host copy of every buffer a pipeline touches.
//! Device copies are owned by the [`ComputeDevice`](crate::device::ComputeDevice)
//! and addressed by the same [`BufferId`].

use crate::error::{EngineError, EngineResult};

/// Index of a buffer in its [`BufferRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

/// Element type of a buffer. Both are 4 bytes wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    F32,
    U32,
}

impl BufferKind {
    pub fn name(self) -> &'static str {
        match self {
            BufferKind::F32 => "f32",
            BufferKind::U32 => "u32",
        }
    }
}

/// Host→device transfer policy declared per buffer per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferPolicy {
    /// Copy before the stage's first invocation only.
    CopyOnce,
    /// Copy before every invocation.
    CopyEveryCall,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    U32(Vec<u32>),
}

impl HostData {
    pub fn kind(&self) -> BufferKind {
        match self {
            HostData::F32(_) => BufferKind::F32,
            HostData::U32(_) => BufferKind::U32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostData::F32(v) => v.len(),
            HostData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            HostData::F32(v) => bytemuck::cast_slice(v),
            HostData::U32(v) => bytemuck::cast_slice(v),
        }
    }

    /// Overwrite from raw little-endian words (device readback).
    pub fn copy_from_bytes(&mut self, bytes: &[u8]) {
        match self {
            HostData::F32(v) => {
                let n = v.len().min(bytes.len() / 4);
                bytemuck::cast_slice_mut::<f32, u8>(&mut v[..n]).copy_from_slice(&bytes[..n * 4]);
            }
            HostData::U32(v) => {
                let n = v.len().min(bytes.len() / 4);
                bytemuck::cast_slice_mut::<u32, u8>(&mut v[..n]).copy_from_slice(&bytes[..n * 4]);
            }
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.len() * 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub kind: BufferKind,
    pub len: usize,
}

#[derive(Debug)]
struct Entry {
    desc: BufferDesc,
    host: HostData,
}

/// Host mirrors of every buffer known to one pipeline.
#[derive(Debug, Default)]
pub struct BufferRegistry {
    entries: Vec<Entry>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: &str, host: HostData) -> BufferId {
        let id = BufferId(self.entries.len());
        self.entries.push(Entry {
            desc: BufferDesc {
                name: name.to_string(),
                kind: host.kind(),
                len: host.len(),
            },
            host,
        });
        id
    }

    pub fn register_f32(&mut self, name: &str, data: Vec<f32>) -> BufferId {
        self.push(name, HostData::F32(data))
    }

    pub fn register_u32(&mut self, name: &str, data: Vec<u32>) -> BufferId {
        self.push(name, HostData::U32(data))
    }

    pub fn zeros_f32(&mut self, name: &str, len: usize) -> BufferId {
        self.register_f32(name, vec![0.0; len])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = BufferId> {
        (0..self.entries.len()).map(BufferId)
    }

    fn entry(&self, id: BufferId) -> EngineResult<&Entry> {
        self.entries.get(id.0).ok_or(EngineError::UnknownBuffer(id.0))
    }

    fn entry_mut(&mut self, id: BufferId) -> EngineResult<&mut Entry> {
        self.entries
            .get_mut(id.0)
            .ok_or(EngineError::UnknownBuffer(id.0))
    }

    pub fn desc(&self, id: BufferId) -> EngineResult<&BufferDesc> {
        Ok(&self.entry(id)?.desc)
    }

    /// Buffer name for error messages; unknown ids render as `#n`.
    pub fn name(&self, id: BufferId) -> String {
        self.entries
            .get(id.0)
            .map(|e| e.desc.name.clone())
            .unwrap_or_else(|| format!("#{}", id.0))
    }

    pub fn host(&self, id: BufferId) -> EngineResult<&HostData> {
        Ok(&self.entry(id)?.host)
    }

    pub fn host_mut(&mut self, id: BufferId) -> EngineResult<&mut HostData> {
        Ok(&mut self.entry_mut(id)?.host)
    }

    pub fn f32(&self, id: BufferId) -> EngineResult<&[f32]> {
        let entry = self.entry(id)?;
        match &entry.host {
            HostData::F32(v) => Ok(v),
            HostData::U32(_) => Err(kind_error(&entry.desc, BufferKind::F32)),
        }
    }

    pub fn f32_mut(&mut self, id: BufferId) -> EngineResult<&mut [f32]> {
        let entry = self.entry_mut(id)?;
        match &mut entry.host {
            HostData::F32(v) => Ok(v),
            HostData::U32(_) => Err(kind_error(&entry.desc, BufferKind::F32)),
        }
    }

    pub fn u32(&self, id: BufferId) -> EngineResult<&[u32]> {
        let entry = self.entry(id)?;
        match &entry.host {
            HostData::U32(v) => Ok(v),
            HostData::F32(_) => Err(kind_error(&entry.desc, BufferKind::U32)),
        }
    }

    pub fn u32_mut(&mut self, id: BufferId) -> EngineResult<&mut [u32]> {
        let entry = self.entry_mut(id)?;
        match &mut entry.host {
            HostData::U32(v) => Ok(v),
            HostData::F32(_) => Err(kind_error(&entry.desc, BufferKind::U32)),
        }
    }
}

fn kind_error(desc: &BufferDesc, expected: BufferKind) -> EngineError {
    EngineError::BufferKind {
        buffer: desc.name.clone(),
        expected: expected.name(),
        actual: desc.kind.name(),
    }
}

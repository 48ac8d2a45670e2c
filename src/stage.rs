//! Stages: an ordered list of kernels plus the transfer contract of every
//! buffer they touch.
//!
//! A stage owns no data. It declares, per buffer, how the device copy becomes
//! valid before the stage runs (an inbound transfer policy or consumption
//! from a producing stage), whether it stays resident afterwards, and whether
//! it is copied back to the host.
//!
//! ```ignore
//! let attention = Stage::new("attention")
//!     .consume_from(rotation, &[state.q])
//!     .consume_from(kv_cache, &[state.key_cache, state.value_cache, state.cursor])
//!     .scratch(&[state.att, state.att_max, state.att_sum])
//!     .persist_on_device(&[state.xb, state.key_cache, state.value_cache, state.cursor])
//!     .task(scores)
//!     .task(max);
//! ```

use crate::buffer::{BufferId, TransferPolicy};
use crate::kernels::Kernel;

/// Position of a stage in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub usize);

impl StageId {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// How a buffer's device copy becomes valid before the stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Transfer(TransferPolicy),
    /// Already resident, persisted by the named producing stage.
    Consume(StageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDecl {
    pub buffer: BufferId,
    /// `None` for buffers produced inside the stage.
    pub inbound: Option<Inbound>,
    /// Keep the device copy valid after the stage.
    pub persist: bool,
    /// Copy device→host after the stage.
    pub copy_out: bool,
}

impl BufferDecl {
    fn new(buffer: BufferId) -> Self {
        Self {
            buffer,
            inbound: None,
            persist: false,
            copy_out: false,
        }
    }

    /// Whether the device copy is dropped from the residency table after the stage.
    pub fn released_after(&self) -> bool {
        !self.persist && self.inbound != Some(Inbound::Transfer(TransferPolicy::CopyOnce))
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    name: String,
    kernels: Vec<Kernel>,
    decls: Vec<BufferDecl>,
    conflicts: Vec<String>,
}

impl Stage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kernels: Vec::new(),
            decls: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    fn decl_mut(&mut self, buffer: BufferId) -> &mut BufferDecl {
        let index = match self.decls.iter().position(|d| d.buffer == buffer) {
            Some(index) => index,
            None => {
                self.decls.push(BufferDecl::new(buffer));
                self.decls.len() - 1
            }
        };
        &mut self.decls[index]
    }

    fn set_inbound(&mut self, buffer: BufferId, inbound: Inbound) {
        let current = self.decl_mut(buffer).inbound;
        match current {
            Some(existing) if existing != inbound => {
                let message = format!(
                    "buffer #{} declared with both {existing:?} and {inbound:?}",
                    buffer.0
                );
                self.conflicts.push(message);
            }
            _ => self.decl_mut(buffer).inbound = Some(inbound),
        }
    }

    /// Host→device copy before the stage runs, under `policy`.
    pub fn transfer_to_device(mut self, policy: TransferPolicy, buffers: &[BufferId]) -> Self {
        for &buffer in buffers {
            self.set_inbound(buffer, Inbound::Transfer(policy));
        }
        self
    }

    /// Read buffers left resident by `producer`.
    pub fn consume_from(mut self, producer: StageId, buffers: &[BufferId]) -> Self {
        for &buffer in buffers {
            self.set_inbound(buffer, Inbound::Consume(producer));
        }
        self
    }

    /// Buffers that are written before they are read inside this stage.
    pub fn scratch(mut self, buffers: &[BufferId]) -> Self {
        for &buffer in buffers {
            self.decl_mut(buffer);
        }
        self
    }

    pub fn persist_on_device(mut self, buffers: &[BufferId]) -> Self {
        for &buffer in buffers {
            self.decl_mut(buffer).persist = true;
        }
        self
    }

    pub fn transfer_to_host(mut self, buffers: &[BufferId]) -> Self {
        for &buffer in buffers {
            self.decl_mut(buffer).copy_out = true;
        }
        self
    }

    /// Append a kernel; kernels run in the order they are added.
    pub fn task(mut self, kernel: Kernel) -> Self {
        self.kernels.push(kernel);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    pub fn decls(&self) -> &[BufferDecl] {
        &self.decls
    }

    pub fn decl(&self, buffer: BufferId) -> Option<&BufferDecl> {
        self.decls.iter().find(|d| d.buffer == buffer)
    }

    pub(crate) fn conflicts(&self) -> &[String] {
        &self.conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations_merge_per_buffer() {
        let a = BufferId(0);
        let b = BufferId(1);
        let stage = Stage::new("s")
            .consume_from(StageId(3), &[a])
            .transfer_to_device(TransferPolicy::CopyOnce, &[b])
            .persist_on_device(&[a, b])
            .transfer_to_host(&[a]);

        assert_eq!(stage.decls().len(), 2);
        let da = stage.decl(a).unwrap();
        assert_eq!(da.inbound, Some(Inbound::Consume(StageId(3))));
        assert!(da.persist && da.copy_out);
        assert!(stage.conflicts().is_empty());
    }

    #[test]
    fn release_rules() {
        let once = Stage::new("s").transfer_to_device(TransferPolicy::CopyOnce, &[BufferId(0)]);
        assert!(!once.decl(BufferId(0)).unwrap().released_after());

        let every = Stage::new("s").transfer_to_device(TransferPolicy::CopyEveryCall, &[BufferId(0)]);
        assert!(every.decl(BufferId(0)).unwrap().released_after());

        let scratch = Stage::new("s").scratch(&[BufferId(0)]);
        assert!(scratch.decl(BufferId(0)).unwrap().released_after());
    }

    #[test]
    fn conflicting_inbound_is_recorded() {
        let stage = Stage::new("s")
            .transfer_to_device(TransferPolicy::CopyEveryCall, &[BufferId(0)])
            .consume_from(StageId(0), &[BufferId(0)]);
        assert_eq!(stage.conflicts().len(), 1);
    }
}

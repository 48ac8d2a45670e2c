//! Work-group emulation for the CPU device.
//!
//! A [`WorkGroup`] runs the threads of one group as a sequence of phases. Every
//! thread finishes a phase before any thread starts the next, which is exactly
//! the guarantee a group barrier gives. Threads share the group-local scratch
//! array the same way `var<workgroup>` memory is shared on the GPU.

use crate::layout::ThreadId;

pub struct WorkGroup {
    id: u32,
    size: u32,
    local: Vec<f32>,
}

impl WorkGroup {
    pub fn new(id: u32, size: u32) -> Self {
        Self {
            id,
            size,
            local: vec![0.0; size as usize],
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Run `body` for every thread of the group, then barrier.
    pub fn phase<F>(&mut self, mut body: F)
    where
        F: FnMut(ThreadId, &mut [f32]),
    {
        for local in 0..self.size {
            let tid = ThreadId {
                global: self.id * self.size + local,
                group: self.id,
                local,
                group_size: self.size,
            };
            body(tid, &mut self.local);
        }
    }

    /// Stride-halving tree reduction over the local array with a barrier per
    /// stride. The group size must be a power of two; the result lands in
    /// `local[0]`.
    pub fn tree_reduce<F>(&mut self, combine: F) -> f32
    where
        F: Fn(f32, f32) -> f32,
    {
        let mut stride = self.size / 2;
        while stride > 0 {
            self.phase(|t, local| {
                let i = t.local as usize;
                if t.local < stride {
                    local[i] = combine(local[i], local[i + stride as usize]);
                }
            });
            stride /= 2;
        }
        self.local[0]
    }

    pub fn local(&self) -> &[f32] {
        &self.local
    }
}

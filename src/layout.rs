//! Thread layouts: how many SPMD threads a kernel launches and how they are
//! partitioned into groups.

/// Largest work-group the kernels are written for (wgpu's default
/// `max_compute_invocations_per_workgroup`).
pub const MAX_GROUP_SIZE: u32 = 256;

/// Workgroups every WebGPU device can dispatch along one dimension. Row-per-group
/// kernels are only chosen for matrices with at most this many rows.
pub const MAX_DISPATCH_GROUPS: u32 = 65_535;

/// One-dimensional launch shape. `global` is always a multiple of `group_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadLayout {
    /// Total threads launched (rounded up).
    pub global: u32,
    pub group_size: u32,
    /// Threads that map to real work; threads at or beyond this index return early.
    pub logical: u32,
}

impl ThreadLayout {
    /// `logical` threads rounded up to whole groups of `group_size`.
    ///
    /// Counts that do not fit 32-bit indexing saturate instead of wrapping;
    /// the resulting layout then fails [`Kernel::check_layout`](crate::kernels::Kernel::check_layout).
    pub fn linear(logical: usize, group_size: u32) -> Self {
        let group_size = group_size.max(1);
        let logical = u32::try_from(logical).unwrap_or(u32::MAX);
        let groups = logical.div_ceil(group_size).clamp(1, u32::MAX / group_size);
        Self {
            global: groups * group_size,
            group_size,
            logical,
        }
    }

    /// Exactly `n_groups` groups; every thread is logical.
    pub fn groups(n_groups: usize, group_size: u32) -> Self {
        let group_size = group_size.max(1);
        let groups = u32::try_from(n_groups)
            .unwrap_or(u32::MAX)
            .min(u32::MAX / group_size);
        let global = groups * group_size;
        Self {
            global,
            group_size,
            logical: global,
        }
    }

    /// A single thread in a single group.
    pub fn single() -> Self {
        Self::groups(1, 1)
    }

    #[inline]
    pub fn num_groups(&self) -> u32 {
        self.global / self.group_size
    }

    /// Only one dimension is used by the forward pass.
    #[inline]
    pub fn dimensions(&self) -> u32 {
        1
    }

    pub fn thread(&self, group: u32, local: u32) -> ThreadId {
        ThreadId {
            global: group * self.group_size + local,
            group,
            local,
            group_size: self.group_size,
        }
    }
}

/// Indices a kernel body sees for one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadId {
    pub global: u32,
    pub group: u32,
    pub local: u32,
    pub group_size: u32,
}

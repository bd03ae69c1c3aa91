/// Stack id stored in a [`SampleKey`] when the stack was not collected
pub const STACK_NOT_COLLECTED: i64 = -1;

/// Key of the `COUNTS` aggregation map. Samples with equal keys are the same
/// logical stack.
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SampleKey {
    pub pid: u32,
    /// Reserved, always 0 for frame pointer samples
    pub flags: u32,
    pub kern_stack: i64,
    pub user_stack: i64,
}

impl SampleKey {
    #[inline(always)]
    pub const fn new(pid: u32) -> Self {
        Self {
            pid,
            flags: 0,
            kern_stack: STACK_NOT_COLLECTED,
            user_stack: STACK_NOT_COLLECTED,
        }
    }

    pub fn has_kernel_stack(&self) -> bool {
        self.kern_stack >= 0
    }

    pub fn has_user_stack(&self) -> bool {
        self.user_stack >= 0
    }
}

#[cfg(feature = "aya")]
unsafe impl aya::Pod for SampleKey {}

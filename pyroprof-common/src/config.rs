/// How a process is profiled. The discriminants are the values stored in the
/// `PIDS` map and must not change.
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum ProfilingType {
    Unknown = 1,
    FramePointers = 2,
    Python = 3,
    Error = 4,
}

impl ProfilingType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Unknown),
            2 => Some(Self::FramePointers),
            3 => Some(Self::Python),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Per-process profiling disposition, keyed by tgid.
///
/// Created as `Unknown` by the sampler the first time a pid is seen and
/// corrected in place by the controller once it knows better.
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct PidConfig {
    pub profile_type: u8,
    pub collect_user: u8,
    pub collect_kernel: u8,
    pub padding_: u8,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self::unknown()
    }
}

impl PidConfig {
    pub const fn new(profile_type: ProfilingType, collect_user: bool, collect_kernel: bool) -> Self {
        Self {
            profile_type: profile_type as u8,
            collect_user: collect_user as u8,
            collect_kernel: collect_kernel as u8,
            padding_: 0,
        }
    }

    pub const fn unknown() -> Self {
        Self::new(ProfilingType::Unknown, false, false)
    }

    pub const fn error() -> Self {
        Self::new(ProfilingType::Error, false, false)
    }

    /// `None` for bytes that are not a known profiling type
    #[inline(always)]
    pub fn profiling_type(&self) -> Option<ProfilingType> {
        ProfilingType::from_u8(self.profile_type)
    }

    #[inline(always)]
    pub fn collect_user(&self) -> bool {
        self.collect_user != 0
    }

    #[inline(always)]
    pub fn collect_kernel(&self) -> bool {
        self.collect_kernel != 0
    }
}

#[cfg(feature = "aya")]
unsafe impl aya::Pod for PidConfig {}

/// Lifecycle notification op codes understood by the controller
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PidOp {
    /// A pid was sampled for the first time
    RequestUnknownProcessInfo = 1,
    /// The process exited
    Dead = 2,
    /// The process replaced its image
    RequestExecProcessInfo = 3,
}

impl PidOp {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::RequestUnknownProcessInfo),
            2 => Some(Self::Dead),
            3 => Some(Self::RequestExecProcessInfo),
            _ => None,
        }
    }
}

/// Record written to the `EVENTS` perf buffer. Always 8 bytes.
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PidEvent {
    pub op: u32,
    pub pid: u32,
}

impl PidEvent {
    pub const SIZE: usize = core::mem::size_of::<PidEvent>();

    #[inline(always)]
    pub const fn new(op: PidOp, pid: u32) -> Self {
        Self { op: op as u32, pid }
    }

    pub fn pid_op(&self) -> Option<PidOp> {
        PidOp::from_u32(self.op)
    }

    /// Decode a raw little endian record, `None` if it is too short
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::SIZE {
            return None;
        }
        let op = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let pid = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        Some(Self { op, pid })
    }
}

#[cfg(feature = "aya")]
unsafe impl aya::Pod for PidEvent {}

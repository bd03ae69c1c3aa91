use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum MapError {
    #[error("key already exists")]
    KeyExists,

    #[error("key not found")]
    KeyNotFound,

    #[error("map is full ({max_entries} entries)")]
    Full { max_entries: u32 },

    #[error("index {index} out of bounds (max {max_entries})")]
    OutOfBounds { index: u32, max_entries: u32 },

    #[error("invalid flags {0:#x}")]
    InvalidFlags(u64),

    #[error("buffer for cpu {0} already opened")]
    AlreadyOpened(u32),

    #[error("stack has no frames left after skipping {skip}")]
    NoFrames { skip: u32 },
}

impl MapError {
    /// Negative errno, as a kernel helper would return it
    pub fn errno(&self) -> i64 {
        let e = match self {
            MapError::KeyExists => libc::EEXIST,
            MapError::KeyNotFound => libc::ENOENT,
            MapError::Full { .. } => libc::E2BIG,
            MapError::OutOfBounds { .. } => libc::E2BIG,
            MapError::InvalidFlags(_) => libc::EINVAL,
            MapError::AlreadyOpened(_) => libc::EBUSY,
            MapError::NoFrames { .. } => libc::EFAULT,
        };
        -(e as i64)
    }
}

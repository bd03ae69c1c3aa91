#![allow(non_camel_case_types)]
#![cfg_attr(not(feature = "user"), no_std)]

#[cfg(all(test, not(feature = "user")))]
extern crate std;

pub mod config;
pub mod metrics;
pub mod pidevent;
pub mod profiler;
pub mod sample;

pub use config::{PidConfig, ProfilingType};
pub use metrics::Metrics;
pub use pidevent::{PidEvent, PidOp};
pub use sample::SampleKey;

/// Capacity of the per-process configuration table
pub const MAX_PIDS: u32 = 1024;

/// Capacity of the stack store and of the sample aggregator
pub const PROFILE_MAPS_SIZE: u32 = 16384;

/// Maximum number of frames kept per captured stack
pub const MAX_STACK_DEPTH: usize = 127;

/// `task_struct::flags` bit marking a kernel worker thread
pub const PF_KTHREAD: u32 = 0x0020_0000;

/// Slot of the python unwinder in the program array
pub const PROG_IDX_PYTHON: u32 = 0;
pub const PROG_ARRAY_SIZE: u32 = 1;

/// Map update flags
pub const BPF_ANY: u64 = 0;
pub const BPF_NOEXIST: u64 = 1;
pub const BPF_EXIST: u64 = 2;

/// Stack id flags
pub const BPF_F_SKIP_FIELD_MASK: u64 = 0xff;
pub const BPF_F_USER_STACK: u64 = 1 << 8;
pub const BPF_F_FAST_STACK_CMP: u64 = 1 << 9;
pub const BPF_F_REUSE_STACKID: u64 = 1 << 10;

pub const KERN_STACKID_FLAGS: u64 = BPF_F_FAST_STACK_CMP;
pub const USER_STACKID_FLAGS: u64 = BPF_F_FAST_STACK_CMP | BPF_F_USER_STACK;

pub enum ConfigMapKey {
    DEV = 0,
    INO = 1,
}

pub mod config;
pub mod controller;
#[cfg(feature = "aya")]
pub mod ebpf;
pub mod maps;
pub mod session;
pub mod task;

pub use crate::config::SessionOptions;
pub use crate::session::{ProfileSample, Session};
pub use crate::task::Task;

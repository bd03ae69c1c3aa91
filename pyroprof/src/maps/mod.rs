//! User-space versions of the kernel tables, shareable across threads.

mod error;
mod metrics_map;
mod perf_event_array;
mod program_array;
mod shared_map;
mod stack_trace;

pub use error::MapError;
pub use metrics_map::MetricsMap;
pub use perf_event_array::{Events, PerfBuffer, PerfEventArray};
pub use program_array::{ProgramArray, Sampler};
pub use shared_map::{CountsMap, PidMap, SharedMap};
pub use stack_trace::StackTraceMap;

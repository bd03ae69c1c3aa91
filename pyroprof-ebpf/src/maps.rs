use core::sync::atomic::{AtomicU32, Ordering};

use aya_ebpf::{
    macros::map,
    maps::{HashMap, PerfEventArray, ProgramArray, StackTrace},
    EbpfContext,
};
use pyroprof_common::{
    metrics::Metrics,
    profiler::{EventSink, PidConfigMap, Profiler, SampleCounts, StackStore, TailCall},
    PidConfig, PidEvent, SampleKey, BPF_NOEXIST, MAX_PIDS, PROFILE_MAPS_SIZE, PROG_ARRAY_SIZE,
};

use crate::helpers::Current;

/// pid -> profiling disposition, corrected by user space
#[map(name = "PIDS")]
pub(crate) static PIDS: HashMap<u32, PidConfig> = HashMap::with_max_entries(MAX_PIDS, 0);

/// Used to send pid events to user space
#[map(name = "EVENTS")]
pub(crate) static EVENTS: PerfEventArray<PidEvent> = PerfEventArray::new(0);

/// Specialized unwinders, see PROG_IDX_PYTHON
#[map(name = "PROGS")]
pub(crate) static PROGS: ProgramArray = ProgramArray::with_max_entries(PROG_ARRAY_SIZE, 0);

/// Kernel and user stacks, deduplicated
#[map(name = "STACKS")]
pub(crate) static STACKS: StackTrace = StackTrace::with_max_entries(PROFILE_MAPS_SIZE, 0);

/// Sample key -> number of samples
#[map(name = "COUNTS")]
pub(crate) static COUNTS: HashMap<SampleKey, u32> = HashMap::with_max_entries(PROFILE_MAPS_SIZE, 0);

/// Used to store misc config
#[map(name = "CONFIG")]
pub(crate) static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(10, 0);

/// metrics -> count
#[map(name = "METRICS")]
pub(crate) static METRICS: HashMap<u32, u64> = HashMap::with_max_entries(Metrics::Max as u32, 0);

/// Binds the profiler traits to the maps above
pub(crate) struct Tables;

pub(crate) type KernelProfiler = Profiler<'static, Tables, Tables, Tables, Tables, Tables>;

#[inline(always)]
pub(crate) fn profiler() -> KernelProfiler {
    Profiler {
        pids: &Tables,
        stacks: &Tables,
        counts: &Tables,
        events: &Tables,
        progs: &Tables,
    }
}

impl PidConfigMap for Tables {
    #[inline(always)]
    fn get(&self, pid: u32) -> Option<PidConfig> {
        unsafe { PIDS.get(&pid) }.copied()
    }

    #[inline(always)]
    fn insert_new(&self, pid: u32, config: &PidConfig) -> Result<(), i64> {
        PIDS.insert(&pid, config, BPF_NOEXIST)
    }
}

impl SampleCounts for Tables {
    #[inline(always)]
    fn increment(&self, key: &SampleKey) -> bool {
        match COUNTS.get_ptr_mut(key) {
            Some(val) => {
                unsafe { AtomicU32::from_ptr(val) }.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    #[inline(always)]
    fn insert_new(&self, key: &SampleKey, count: u32) -> Result<(), i64> {
        COUNTS.insert(key, &count, BPF_NOEXIST)
    }
}

impl<C: EbpfContext> StackStore<Current<'_, C>> for Tables {
    #[inline(always)]
    fn get_stackid(&self, current: &Current<'_, C>, flags: u64) -> i64 {
        match unsafe { STACKS.get_stackid(current.ctx, flags) } {
            Ok(id) => id,
            Err(e) => e,
        }
    }
}

impl<C: EbpfContext> EventSink<Current<'_, C>> for Tables {
    #[inline(always)]
    fn output(&self, current: &Current<'_, C>, event: &PidEvent) {
        EVENTS.output(current.ctx, event, 0);
    }
}

impl<C: EbpfContext> TailCall<Current<'_, C>> for Tables {
    #[inline(always)]
    fn tail_call(&self, current: &Current<'_, C>, index: u32) -> Result<(), i64> {
        // only comes back if the slot is empty
        if let Err(e) = unsafe { PROGS.tail_call(current.ctx, index) } {
            return Err(e);
        }
        Ok(())
    }
}

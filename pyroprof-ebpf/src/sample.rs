use aya_ebpf::{macros::perf_event, programs::PerfEventContext};
use aya_log_ebpf::debug;
use pyroprof_common::{metrics::Metrics, profiler::CurrentTask};

use crate::{
    helpers::{incr_metric, Current},
    maps::profiler,
};

#[perf_event]
pub fn do_perf_event(ctx: PerfEventContext) -> u32 {
    let current = Current::new(&ctx);
    let outcome = profiler().do_perf_event(&current);

    match outcome {
        Metrics::ErrSample_TaskRead => debug!(&ctx, "failed to read task->flags"),
        Metrics::ErrSample_KernelThread => {
            debug!(&ctx, "skipping kthread {}", current.current_pid())
        }
        Metrics::TraceMgmt_NewPidRace => {
            debug!(&ctx, "failed to update pids map. probably concurrent update")
        }
        Metrics::ErrSample_PidsFull => {
            debug!(&ctx, "pids map full, dropping {}", current.current_pid())
        }
        Metrics::ErrSample_TailCallMissing => debug!(&ctx, "no python unwinder loaded"),
        _ => (),
    }
    incr_metric(outcome);

    0
}

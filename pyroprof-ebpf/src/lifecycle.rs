use aya_ebpf::{macros::kprobe, programs::ProbeContext};
use pyroprof_common::metrics::Metrics;

use crate::{
    helpers::{incr_metric, Current},
    maps::profiler,
};

/// disassociate_ctty(int on_exit)
#[kprobe]
pub fn disassociate_ctty(ctx: ProbeContext) -> u32 {
    let on_exit: i32 = ctx.arg(0).unwrap_or(0);
    let outcome = profiler().disassociate_ctty(&Current::new(&ctx), on_exit != 0);
    incr_metric(outcome);
    0
}

#[kprobe]
pub fn exec(ctx: ProbeContext) -> u32 {
    report_exec(&ctx)
}

#[kprobe]
pub fn execveat(ctx: ProbeContext) -> u32 {
    report_exec(&ctx)
}

#[inline(always)]
fn report_exec(ctx: &ProbeContext) -> u32 {
    let outcome: Metrics = profiler().exec(&Current::new(ctx));
    incr_metric(outcome);
    0
}

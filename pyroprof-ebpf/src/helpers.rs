use core::{
    ptr::addr_of,
    sync::atomic::{AtomicU64, Ordering},
};

use aya_ebpf::{
    bindings::bpf_pidns_info,
    helpers::{
        bpf_get_current_pid_tgid, bpf_get_current_task, bpf_get_ns_current_pid_tgid,
        bpf_probe_read_kernel,
    },
    EbpfContext,
};
use pyroprof_common::{metrics::Metrics, profiler::CurrentTask, ConfigMapKey};

use crate::{
    maps::{CONFIG, METRICS},
    vmlinux::task_struct,
};

/// tgid of the current task, as seen from the pid namespace of user space
pub fn current_pid() -> u32 {
    let dev = unsafe { CONFIG.get(&(ConfigMapKey::DEV as u32)) }.copied().unwrap_or(0);
    let ino = unsafe { CONFIG.get(&(ConfigMapKey::INO as u32)) }.copied().unwrap_or(0);
    if dev == 0 && ino == 0 {
        return (unsafe { bpf_get_current_pid_tgid() } >> 32) as u32;
    }

    let mut ns: bpf_pidns_info = unsafe { core::mem::zeroed() };
    let ret = unsafe {
        bpf_get_ns_current_pid_tgid(
            dev,
            ino,
            &mut ns as *mut bpf_pidns_info,
            core::mem::size_of::<bpf_pidns_info>() as u32,
        )
    };
    // not in that namespace
    if ret != 0 {
        return 0;
    }
    ns.tgid
}

/// The task a program fired for, together with the program context
pub struct Current<'a, C> {
    pub ctx: &'a C,
    task: *const task_struct,
    pid: u32,
}

impl<'a, C: EbpfContext> Current<'a, C> {
    #[inline(always)]
    pub fn new(ctx: &'a C) -> Self {
        Self {
            ctx,
            task: unsafe { bpf_get_current_task() } as *const task_struct,
            pid: current_pid(),
        }
    }
}

impl<C: EbpfContext> CurrentTask for Current<'_, C> {
    #[inline(always)]
    fn current_pid(&self) -> u32 {
        self.pid
    }

    #[inline(always)]
    fn has_task(&self) -> bool {
        !self.task.is_null()
    }

    #[inline(always)]
    fn task_flags(&self) -> Result<u32, i64> {
        unsafe { bpf_probe_read_kernel(addr_of!((*self.task).flags)) }.map(|flags| flags as u32)
    }
}

pub fn incr_metric(metric: Metrics) {
    let key = metric as u32;
    match METRICS.get_ptr_mut(&key) {
        Some(cnt) => {
            unsafe { AtomicU64::from_ptr(cnt) }.fetch_add(1, Ordering::Relaxed);
        }
        None => {
            let _ = METRICS.insert(&key, &1, 0);
        }
    }
}

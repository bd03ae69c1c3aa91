//! The sampling decision engine.
//!
//! Written against a small set of traits that mirror the helpers available
//! to a perf_event/kprobe program, so the same logic drives the kernel
//! programs and the user-space tables. Nothing in here loops or allocates.

use crate::{
    config::{PidConfig, ProfilingType},
    metrics::Metrics,
    pidevent::{PidEvent, PidOp},
    sample::{SampleKey, STACK_NOT_COLLECTED},
    KERN_STACKID_FLAGS, PF_KTHREAD, PROG_IDX_PYTHON, USER_STACKID_FLAGS,
};

/// The task a program was invoked for
pub trait CurrentTask {
    /// Thread group id, 0 for the idle task or when it can't be resolved
    fn current_pid(&self) -> u32;
    fn has_task(&self) -> bool;
    /// Bounded read of `task->flags`
    fn task_flags(&self) -> Result<u32, i64>;
}

/// Process configuration table as seen by the sampler
pub trait PidConfigMap {
    fn get(&self, pid: u32) -> Option<PidConfig>;
    /// Fails if `pid` is already present
    fn insert_new(&self, pid: u32, config: &PidConfig) -> Result<(), i64>;
}

/// Captures the stack of `ctx` and returns its id, negative on failure
pub trait StackStore<C> {
    fn get_stackid(&self, ctx: &C, flags: u64) -> i64;
}

pub trait SampleCounts {
    /// Atomically bumps an existing counter, `false` if `key` is absent
    fn increment(&self, key: &SampleKey) -> bool;
    /// Fails if `key` is already present
    fn insert_new(&self, key: &SampleKey, count: u32) -> Result<(), i64>;
}

/// Fire-and-forget lifecycle channel
pub trait EventSink<C> {
    fn output(&self, ctx: &C, event: &PidEvent);
}

pub trait TailCall<C> {
    /// One-way transfer to the program at `index`. Implementations that do
    /// hand control back return `Ok` once the target has run; callers must
    /// not do any further work in either case.
    fn tail_call(&self, ctx: &C, index: u32) -> Result<(), i64>;
}

pub struct Profiler<'a, P, S, N, E, J> {
    pub pids: &'a P,
    pub stacks: &'a S,
    pub counts: &'a N,
    pub events: &'a E,
    pub progs: &'a J,
}

impl<'a, P, S, N, E, J> Profiler<'a, P, S, N, E, J>
where
    P: PidConfigMap,
    N: SampleCounts,
{
    /// Periodic sampling interrupt
    pub fn do_perf_event<C>(&self, ctx: &C) -> Metrics
    where
        C: CurrentTask,
        S: StackStore<C>,
        E: EventSink<C>,
        J: TailCall<C>,
    {
        match self.try_perf_event(ctx) {
            Ok(m) | Err(m) => m,
        }
    }

    /// Controlling terminal detached. Only `on_exit` detaches mean the
    /// process is going away.
    pub fn disassociate_ctty<C>(&self, ctx: &C, on_exit: bool) -> Metrics
    where
        C: CurrentTask,
        E: EventSink<C>,
    {
        if !on_exit {
            return Metrics::Lifecycle_NotExiting;
        }
        self.report_pid_event(ctx, PidOp::Dead, Metrics::Lifecycle_PidDead)
    }

    /// execve/execveat
    pub fn exec<C>(&self, ctx: &C) -> Metrics
    where
        C: CurrentTask,
        E: EventSink<C>,
    {
        self.report_pid_event(ctx, PidOp::RequestExecProcessInfo, Metrics::Lifecycle_Exec)
    }

    fn try_perf_event<C>(&self, ctx: &C) -> Result<Metrics, Metrics>
    where
        C: CurrentTask,
        S: StackStore<C>,
        E: EventSink<C>,
        J: TailCall<C>,
    {
        let pid = ctx.current_pid();
        if pid == 0 {
            return Err(Metrics::ErrSample_NoPid);
        }
        if !ctx.has_task() {
            return Err(Metrics::ErrSample_NoTask);
        }
        let flags = ctx.task_flags().map_err(|_| Metrics::ErrSample_TaskRead)?;
        if flags & PF_KTHREAD != 0 {
            return Err(Metrics::ErrSample_KernelThread);
        }

        let Some(config) = self.pids.get(pid) else {
            return self.report_new_pid(ctx, pid);
        };

        match config.profiling_type() {
            None => Err(Metrics::ErrSample_PolicyInvalid),
            Some(ProfilingType::Unknown) => Err(Metrics::ErrSample_PolicyUnknown),
            Some(ProfilingType::Error) => Err(Metrics::ErrSample_PolicyError),
            Some(ProfilingType::Python) => {
                self.progs
                    .tail_call(ctx, PROG_IDX_PYTHON)
                    .map_err(|_| Metrics::ErrSample_TailCallMissing)?;
                Ok(Metrics::Sample_TailCall)
            }
            Some(ProfilingType::FramePointers) => Ok(self.count_sample(ctx, pid, &config)),
        }
    }

    /// Inserts `Unknown` for a pid seen for the first time and asks the
    /// controller about it. The sample itself is not counted.
    fn report_new_pid<C>(&self, ctx: &C, pid: u32) -> Result<Metrics, Metrics>
    where
        E: EventSink<C>,
    {
        self.pids
            .insert_new(pid, &PidConfig::unknown())
            .map_err(|e| match e {
                E2BIG => Metrics::ErrSample_PidsFull,
                _ => Metrics::TraceMgmt_NewPidRace,
            })?;
        self.events
            .output(ctx, &PidEvent::new(PidOp::RequestUnknownProcessInfo, pid));
        Ok(Metrics::TraceMgmt_NewPid)
    }

    fn count_sample<C>(&self, ctx: &C, pid: u32, config: &PidConfig) -> Metrics
    where
        S: StackStore<C>,
    {
        let mut key = SampleKey::new(pid);
        if config.collect_kernel() {
            key.kern_stack = stack_id(self.stacks.get_stackid(ctx, KERN_STACKID_FLAGS));
        }
        if config.collect_user() {
            key.user_stack = stack_id(self.stacks.get_stackid(ctx, USER_STACKID_FLAGS));
        }

        if self.counts.increment(&key) {
            return Metrics::Sample_Counted;
        }
        // no retry: whoever won the race already counted a sample
        match self.counts.insert_new(&key, 1) {
            Ok(()) => Metrics::Sample_NewKey,
            Err(_) => Metrics::Sample_KeyRace,
        }
    }

    fn report_pid_event<C>(&self, ctx: &C, op: PidOp, outcome: Metrics) -> Metrics
    where
        C: CurrentTask,
        E: EventSink<C>,
    {
        let pid = ctx.current_pid();
        if pid == 0 {
            return Metrics::ErrLifecycle_NoPid;
        }
        self.events.output(ctx, &PidEvent::new(op, pid));
        outcome
    }
}

/// Returned by a hash map insert when the map is full
const E2BIG: i64 = -7;

#[inline(always)]
fn stack_id(id: i64) -> i64 {
    if id < 0 {
        STACK_NOT_COLLECTED
    } else {
        id
    }
}

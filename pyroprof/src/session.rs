use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use fnv::FnvHashSet;
use pyroprof_common::{profiler::Profiler, Metrics, SampleKey};
use serde::Serialize;
use tracing::trace;

use crate::{
    config::SessionOptions,
    maps::{CountsMap, MapError, MetricsMap, PerfEventArray, PidMap, ProgramArray, Sampler, SharedMap, StackTraceMap},
    task::Task,
};

/// One aggregated stack, resolved to frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSample {
    pub key: SampleKey,
    pub count: u32,
    pub kernel_frames: Vec<u64>,
    pub user_frames: Vec<u64>,
}

/// The in-process sampling engine.
///
/// Owns every table the sampler uses. Tables are created here once and live
/// as long as the session; the entry points only ever read and update them.
pub struct Session {
    options: SessionOptions,
    pids: PidMap,
    stacks: StackTraceMap,
    counts: CountsMap,
    events: PerfEventArray,
    progs: ProgramArray<Task>,
    metrics: MetricsMap,
    rounds: AtomicU32,
}

type TaskProfiler<'a> = Profiler<'a, PidMap, StackTraceMap, CountsMap, PerfEventArray, ProgramArray<Task>>;

impl Session {
    pub fn new(mut options: SessionOptions) -> Self {
        options.stacks_reset_interval = options.stacks_reset_interval.max(1);
        Self {
            pids: SharedMap::with_max_entries(options.max_pids),
            stacks: StackTraceMap::with_max_entries(options.profile_maps_size),
            counts: SharedMap::with_max_entries(options.profile_maps_size),
            events: PerfEventArray::new(options.cpus(), options.perf_buffer_capacity),
            progs: ProgramArray::with_max_entries(options.prog_array_size),
            metrics: MetricsMap::default(),
            rounds: AtomicU32::new(0),
            options,
        }
    }

    fn profiler(&self) -> TaskProfiler<'_> {
        Profiler {
            pids: &self.pids,
            stacks: &self.stacks,
            counts: &self.counts,
            events: &self.events,
            progs: &self.progs,
        }
    }

    fn record(&self, prog: &str, task: &Task, outcome: Metrics) -> Metrics {
        if outcome.is_err() {
            trace!(cpu = task.cpu, pid = task.pid, ?outcome, "{prog} aborted");
        }
        self.metrics.incr(outcome);
        outcome
    }

    /// Sampling interrupt on `task.cpu`
    pub fn perf_event(&self, task: &Task) -> Metrics {
        let outcome = self.profiler().do_perf_event(task);
        self.record("do_perf_event", task, outcome)
    }

    pub fn disassociate_ctty(&self, task: &Task, on_exit: bool) -> Metrics {
        let outcome = self.profiler().disassociate_ctty(task, on_exit);
        self.record("disassociate_ctty", task, outcome)
    }

    pub fn exec(&self, task: &Task) -> Metrics {
        let outcome = self.profiler().exec(task);
        self.record("exec", task, outcome)
    }

    pub fn register_sampler(&self, index: u32, sampler: Arc<dyn Sampler<Task>>) -> Result<(), MapError> {
        self.progs.set(index, sampler)
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn pids(&self) -> &PidMap {
        &self.pids
    }

    pub fn stacks(&self) -> &StackTraceMap {
        &self.stacks
    }

    pub fn counts(&self) -> &CountsMap {
        &self.counts
    }

    pub fn events(&self) -> &PerfEventArray {
        &self.events
    }

    pub fn progs(&self) -> &ProgramArray<Task> {
        &self.progs
    }

    pub fn metrics(&self) -> &MetricsMap {
        &self.metrics
    }

    /// Drains the aggregated counts and resolves their stacks.
    ///
    /// Stacks referenced by the drained keys are freed afterwards, and the
    /// whole stack store is reset every `stacks_reset_interval` rounds to get
    /// rid of stacks whose samples were lost.
    pub fn collect_profiles(&self) -> Vec<ProfileSample> {
        let round = self.rounds.fetch_add(1, Ordering::AcqRel) + 1;
        let mut used = FnvHashSet::default();

        let samples: Vec<_> = self
            .counts
            .drain_counts()
            .into_iter()
            .map(|(key, count)| ProfileSample {
                key,
                count,
                kernel_frames: self.resolve_stack(key.kern_stack, &mut used),
                user_frames: self.resolve_stack(key.user_stack, &mut used),
            })
            .collect();

        if round % self.options.stacks_reset_interval == 0 {
            self.stacks.clear();
        } else {
            for id in used {
                self.stacks.remove(id);
            }
        }
        samples
    }

    fn resolve_stack(&self, id: i64, used: &mut FnvHashSet<u32>) -> Vec<u64> {
        let Ok(id) = u32::try_from(id) else {
            return vec![];
        };
        used.insert(id);
        self.stacks.lookup(id).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use pyroprof_common::{PidConfig, PidEvent, PidOp, ProfilingType, BPF_ANY};

    use super::*;
    use crate::maps::Events;

    fn session() -> Session {
        Session::new(SessionOptions {
            num_cpus: 2,
            ..Default::default()
        })
    }

    fn set(session: &Session, pid: u32, config: PidConfig) {
        session.pids().insert(pid, config, BPF_ANY).unwrap();
    }

    fn drain(session: &Session, cpu: u32) -> Vec<PidEvent> {
        let mut out = vec![];
        session.events().open(cpu).unwrap().read_events(&mut out);
        out
    }

    #[test]
    fn test_first_sample_reports_pid() {
        let s = session();
        let task = Task::new(0, 4242).with_stacks(vec![1], vec![2]);

        assert_eq!(s.perf_event(&task), Metrics::TraceMgmt_NewPid);
        assert_eq!(s.pids().get(&4242), Some(PidConfig::unknown()));
        assert!(s.counts().is_empty());

        // not resolved yet, nothing reported twice
        assert_eq!(s.perf_event(&task), Metrics::ErrSample_PolicyUnknown);
        assert_eq!(
            drain(&s, 0),
            vec![PidEvent::new(PidOp::RequestUnknownProcessInfo, 4242)]
        );
    }

    #[test]
    fn test_frame_pointer_samples() {
        let s = session();
        set(&s, 7, PidConfig::new(ProfilingType::FramePointers, true, false));
        let task = Task::new(1, 7).with_stacks(vec![0xffff_0001], vec![0x1000, 0x2000]);

        assert_eq!(s.perf_event(&task), Metrics::Sample_NewKey);
        assert_eq!(s.perf_event(&task), Metrics::Sample_Counted);
        assert_eq!(s.perf_event(&task), Metrics::Sample_Counted);

        let profiles = s.collect_profiles();
        assert_eq!(profiles.len(), 1);
        let p = &profiles[0];
        assert_eq!(p.count, 3);
        assert_eq!(p.key.kern_stack, -1);
        assert!(p.key.has_user_stack());
        assert_eq!(p.user_frames, vec![0x1000, 0x2000]);
        assert!(p.kernel_frames.is_empty());

        // collected stacks are freed
        assert!(s.counts().is_empty());
        assert!(s.stacks().is_empty());
        assert_eq!(s.metrics().get(Metrics::Sample_Counted), 2);
    }

    #[test]
    fn test_aborts() {
        let s = session();
        set(&s, 1, PidConfig::error());
        set(&s, 2, PidConfig { profile_type: 9, ..PidConfig::unknown() });
        set(&s, 3, PidConfig::new(ProfilingType::Python, true, true));

        assert_eq!(s.perf_event(&Task::new(0, 0)), Metrics::ErrSample_NoPid);
        assert_eq!(
            s.perf_event(&Task { has_task: false, ..Task::new(0, 5) }),
            Metrics::ErrSample_NoTask
        );
        assert_eq!(
            s.perf_event(&Task { flags: None, ..Task::new(0, 5) }),
            Metrics::ErrSample_TaskRead
        );
        assert_eq!(s.perf_event(&Task::kthread(0, 5)), Metrics::ErrSample_KernelThread);
        assert_eq!(s.perf_event(&Task::new(0, 1)), Metrics::ErrSample_PolicyError);
        assert_eq!(s.perf_event(&Task::new(0, 2)), Metrics::ErrSample_PolicyInvalid);
        assert_eq!(s.perf_event(&Task::new(0, 3)), Metrics::ErrSample_TailCallMissing);

        // none of these touched the tables
        assert_eq!(s.pids().len(), 3);
        assert!(s.counts().is_empty());
        assert_eq!(s.events().lost(0), 0);
        assert!(drain(&s, 0).is_empty());
    }

    struct PyUnwinder;

    impl Sampler<Task> for PyUnwinder {
        fn name(&self) -> &str {
            "pyperf"
        }

        fn run(&self, _task: &Task) {}
    }

    #[test]
    fn test_python_tail_call() {
        let s = session();
        set(&s, 3, PidConfig::new(ProfilingType::Python, true, true));
        s.register_sampler(0, Arc::new(PyUnwinder)).unwrap();

        assert_eq!(s.perf_event(&Task::new(0, 3)), Metrics::Sample_TailCall);
        assert!(s.counts().is_empty());
    }

    #[test]
    fn test_lifecycle() {
        let s = session();
        assert_eq!(s.disassociate_ctty(&Task::new(1, 10), false), Metrics::Lifecycle_NotExiting);
        assert_eq!(s.disassociate_ctty(&Task::new(1, 10), true), Metrics::Lifecycle_PidDead);
        assert_eq!(s.exec(&Task::new(1, 11)), Metrics::Lifecycle_Exec);
        assert_eq!(s.exec(&Task::new(1, 0)), Metrics::ErrLifecycle_NoPid);

        assert_eq!(
            drain(&s, 1),
            vec![
                PidEvent::new(PidOp::Dead, 10),
                PidEvent::new(PidOp::RequestExecProcessInfo, 11),
            ]
        );
    }

    #[test]
    fn test_stacks_reset_interval() {
        let s = Session::new(SessionOptions {
            num_cpus: 1,
            stacks_reset_interval: 2,
            ..Default::default()
        });
        set(&s, 7, PidConfig::new(ProfilingType::FramePointers, true, true));

        s.perf_event(&Task::new(0, 7).with_stacks(vec![1], vec![2]));
        // a stack no key refers to survives a normal round
        s.stacks().store(&[3, 4], 0).unwrap();
        assert_eq!(s.collect_profiles().len(), 1);
        assert_eq!(s.stacks().len(), 1);

        assert!(s.collect_profiles().is_empty());
        assert!(s.stacks().is_empty());
    }

    #[test]
    fn test_lost_events() {
        let s = Session::new(SessionOptions {
            num_cpus: 1,
            perf_buffer_capacity: 1,
            ..Default::default()
        });
        s.perf_event(&Task::new(0, 1));
        s.perf_event(&Task::new(0, 2));

        let mut out = vec![];
        let read = s.events().open(0).unwrap().read_events(&mut out);
        assert_eq!(read, Events { read: 1, lost: 1 });
        // the pid is in the table even though its notification was lost
        assert_eq!(s.pids().get(&2), Some(PidConfig::unknown()));
    }

    #[test]
    fn test_concurrent_samples() {
        let s = Session::new(SessionOptions {
            num_cpus: 4,
            ..Default::default()
        });
        set(&s, 7, PidConfig::new(ProfilingType::FramePointers, true, true));

        thread::scope(|scope| {
            for cpu in 0..4 {
                let s = &s;
                scope.spawn(move || {
                    let task = Task::new(cpu, 7).with_stacks(vec![1, 2], vec![3, 4]);
                    for _ in 0..500 {
                        s.perf_event(&task);
                    }
                });
            }
        });

        let m = s.metrics();
        let counted = m.get(Metrics::Sample_Counted) + m.get(Metrics::Sample_NewKey);
        let raced = m.get(Metrics::Sample_KeyRace);
        assert_eq!(counted + raced, 2000);
        assert_eq!(m.get(Metrics::Sample_NewKey), 1);

        let profiles = s.collect_profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].count as u64, counted);
    }

    #[test]
    fn test_configured_kthread() {
        let s = session();
        set(&s, 7, PidConfig::new(ProfilingType::FramePointers, true, true));
        let task = Task::kthread(0, 7).with_stacks(vec![1], vec![2]);

        assert_eq!(s.perf_event(&task), Metrics::ErrSample_KernelThread);
        assert!(s.counts().is_empty());
        assert!(s.stacks().is_empty());
        assert!(drain(&s, 0).is_empty());
        assert_eq!(s.pids().get(&7), Some(PidConfig::new(ProfilingType::FramePointers, true, true)));
    }

    #[test]
    fn test_pids_full() {
        let s = Session::new(SessionOptions {
            num_cpus: 1,
            max_pids: 1,
            ..Default::default()
        });
        assert_eq!(s.perf_event(&Task::new(0, 1)), Metrics::TraceMgmt_NewPid);
        assert_eq!(s.perf_event(&Task::new(0, 2)), Metrics::ErrSample_PidsFull);
        assert_eq!(s.pids().get(&2), None);
        assert_eq!(drain(&s, 0), vec![PidEvent::new(PidOp::RequestUnknownProcessInfo, 1)]);
        assert_eq!(s.metrics().get(Metrics::ErrSample_PidsFull), 1);
    }

    #[test]
    fn test_zero_reset_interval() {
        let s = Session::new(SessionOptions {
            num_cpus: 1,
            stacks_reset_interval: 0,
            ..Default::default()
        });
        assert_eq!(s.options().stacks_reset_interval, 1);
        set(&s, 7, PidConfig::new(ProfilingType::FramePointers, true, true));

        for _ in 0..2 {
            s.perf_event(&Task::new(0, 7).with_stacks(vec![1], vec![2]));
            s.stacks().store(&[3, 4], 0).unwrap();
            assert_eq!(s.collect_profiles().len(), 1);
            // every round is a reset round
            assert!(s.stacks().is_empty());
        }
    }
}

//! Loads the kernel programs and wires their maps to the controller.

use std::{
    mem::size_of,
    os::unix::prelude::MetadataExt,
    path::Path,
};

use anyhow::{Context, Result};
use aya::{
    maps::{AsyncPerfEventArray, HashMap, MapData, MapError as AyaMapError, ProgramArray, StackTraceMap},
    programs::{perf_event, KProbe, PerfEvent},
    util::online_cpus,
    Ebpf,
};
use aya_log::EbpfLogger;
use bytes::BytesMut;
use fnv::FnvHashSet;
use pyroprof_common::{ConfigMapKey, Metrics, PidConfig, PidEvent, SampleKey, PROG_IDX_PYTHON};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{controller::PidTable, session::ProfileSample};

/// What the perf buffer readers forward to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Event(PidEvent),
    Lost { cpu: u32, lost: usize },
}

pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        anyhow::bail!("Failed to increase rlimit");
    }

    Ok(())
}

pub fn load(path: &Path) -> Result<Ebpf> {
    bump_memlock_rlimit()?;
    let mut bpf = Ebpf::load_file(path).with_context(|| format!("unable to load {path:?}"))?;

    if let Err(e) = EbpfLogger::init(&mut bpf) {
        // no log statements survived compilation
        warn!("failed to initialize eBPF logger: {e}");
    }

    write_pid_namespace(&mut bpf)?;
    Ok(bpf)
}

/// Pids are reported in our pid namespace
pub fn write_pid_namespace(bpf: &mut Ebpf) -> Result<()> {
    let mut config: HashMap<_, u32, u64> =
        HashMap::try_from(bpf.map_mut("CONFIG").context("CONFIG map not found")?)?;
    let stats = std::fs::metadata("/proc/self/ns/pid").context("unable to stat pid namespace")?;
    config.insert(ConfigMapKey::DEV as u32, stats.dev(), 0)?;
    config.insert(ConfigMapKey::INO as u32, stats.ino(), 0)?;
    Ok(())
}

/// Attaches the sampler to a cpu clock on every online cpu
pub fn attach_sampler(bpf: &mut Ebpf, sample_rate: u64) -> Result<usize> {
    let program: &mut PerfEvent = bpf
        .program_mut("do_perf_event")
        .context("do_perf_event program not found")?
        .try_into()?;
    program.load()?;

    let cpus = online_cpus().map_err(|(_, e)| e).context("unable to list cpus")?;
    for cpu in &cpus {
        program.attach(
            perf_event::PerfTypeId::Software,
            perf_event::perf_sw_ids::PERF_COUNT_SW_CPU_CLOCK as u64,
            perf_event::PerfEventScope::AllProcessesOneCpu { cpu: *cpu },
            perf_event::SamplePolicy::Frequency(sample_rate),
            false,
        )?;
    }
    info!("sampling {} cpus at {sample_rate} Hz", cpus.len());
    Ok(cpus.len())
}

#[cfg(target_arch = "aarch64")]
const SYSCALL_PREFIX: &str = "__arm64_";
#[cfg(not(target_arch = "aarch64"))]
const SYSCALL_PREFIX: &str = "__x64_";

pub fn attach_lifecycle(bpf: &mut Ebpf) -> Result<()> {
    attach_kprobe(bpf, "disassociate_ctty", "disassociate_ctty")?;

    // without these, exec'd processes keep their old config until they die
    for (prog, syscall) in [("exec", "sys_execve"), ("execveat", "sys_execveat")] {
        let fn_name = format!("{SYSCALL_PREFIX}{syscall}");
        if let Err(e) = attach_kprobe(bpf, prog, &fn_name) {
            warn!("unable to attach {fn_name}: {e:#}");
        }
    }
    Ok(())
}

fn attach_kprobe(bpf: &mut Ebpf, prog: &str, fn_name: &str) -> Result<()> {
    let program: &mut KProbe = bpf
        .program_mut(prog)
        .with_context(|| format!("{prog} program not found"))?
        .try_into()?;
    program.load()?;
    program.attach(fn_name, 0)?;
    info!("attached kprobe {fn_name}");
    Ok(())
}

/// Registers the `pyperf` unwinder if the object carries one. The slot is
/// emptied by the kernel once the returned map is dropped.
pub fn register_python(bpf: &mut Ebpf) -> Result<Option<ProgramArray<MapData>>> {
    let mut progs = ProgramArray::try_from(bpf.take_map("PROGS").context("PROGS map not found")?)?;
    let Some(program) = bpf.program_mut("pyperf") else {
        warn!("no python unwinder in the object, python processes won't be sampled");
        return Ok(None);
    };
    let program: &mut PerfEvent = program.try_into()?;
    program.load()?;
    progs.set(PROG_IDX_PYTHON, program.fd()?, 0)?;
    Ok(Some(progs))
}

pub fn pid_table(bpf: &mut Ebpf) -> Result<HashMap<MapData, u32, PidConfig>> {
    Ok(HashMap::try_from(bpf.take_map("PIDS").context("PIDS map not found")?)?)
}

impl PidTable for HashMap<MapData, u32, PidConfig> {
    type Error = AyaMapError;

    fn set(&mut self, pid: u32, config: PidConfig) -> Result<(), AyaMapError> {
        self.insert(pid, config, 0)
    }

    fn remove(&mut self, pid: u32) -> Result<(), AyaMapError> {
        HashMap::remove(self, &pid)
    }

    fn pids(&self) -> Result<Vec<u32>, AyaMapError> {
        self.keys().collect()
    }
}

/// One reader task per cpu on the `EVENTS` perf buffer
pub fn spawn_event_readers(
    bpf: &mut Ebpf,
    tx: mpsc::Sender<Record>,
    stop_rx: watch::Receiver<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut events = AsyncPerfEventArray::try_from(bpf.take_map("EVENTS").context("EVENTS map not found")?)?;
    let mut ts = vec![];

    for cpu in online_cpus().map_err(|(_, e)| e).context("unable to list cpus")? {
        let mut buf = events.open(cpu, None)?;
        let tx = tx.clone();
        let mut stop_rx = stop_rx.clone();

        ts.push(tokio::spawn(async move {
            let mut buffers = (0..16)
                .map(|_| BytesMut::with_capacity(size_of::<PidEvent>()))
                .collect::<Vec<_>>();

            loop {
                tokio::select! {
                    evts = buf.read_events(&mut buffers) => {
                        let events = match evts {
                            Ok(events) => events,
                            Err(e) => {
                                warn!(cpu, "perf buffer read failed: {e}");
                                break;
                            }
                        };
                        if events.lost > 0 && tx.send(Record::Lost { cpu, lost: events.lost }).await.is_err() {
                            break;
                        }
                        for raw in buffers.iter().take(events.read) {
                            let Some(ev) = PidEvent::parse(raw) else {
                                warn!(cpu, len = raw.len(), "short pid event");
                                continue;
                            };
                            if tx.send(Record::Event(ev)).await.is_err() {
                                return;
                            }
                        }
                    },
                    _ = stop_rx.changed() => break,
                }
            }
        }));
    }
    Ok(ts)
}

/// Reader side of `COUNTS` and `STACKS`
pub struct BpfProfiles {
    counts: HashMap<MapData, SampleKey, u32>,
    stacks: StackTraceMap<MapData>,
    rounds: u32,
    stacks_reset_interval: u32,
}

impl BpfProfiles {
    pub fn new(bpf: &mut Ebpf, stacks_reset_interval: u32) -> Result<Self> {
        Ok(Self {
            counts: HashMap::try_from(bpf.take_map("COUNTS").context("COUNTS map not found")?)?,
            stacks: StackTraceMap::try_from(bpf.take_map("STACKS").context("STACKS map not found")?)?,
            rounds: 0,
            stacks_reset_interval: stacks_reset_interval.max(1),
        })
    }

    pub fn collect_profiles(&mut self) -> Result<Vec<ProfileSample>> {
        self.rounds += 1;
        let keys = self.counts.keys().collect::<Result<Vec<_>, _>>()?;
        let mut used = FnvHashSet::default();
        let mut samples = Vec::with_capacity(keys.len());
        let mut counts_errors = 0usize;
        let mut stacks_errors = 0usize;

        for key in keys {
            // a sample racing with the delete below is lost
            let count = match self.counts.get(&key, 0) {
                Ok(c) => c,
                Err(AyaMapError::KeyNotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            // exported next round with whatever accumulates meanwhile
            if !deleted(self.counts.remove(&key)) {
                counts_errors += 1;
                continue;
            }

            samples.push(ProfileSample {
                key,
                count,
                kernel_frames: self.resolve_stack(key.kern_stack, &mut used),
                user_frames: self.resolve_stack(key.user_stack, &mut used),
            });
        }

        let stale: Vec<u32> = if self.rounds % self.stacks_reset_interval == 0 {
            self.stacks.stack_ids().collect::<Result<_, _>>()?
        } else {
            used.into_iter().collect()
        };
        for id in stale {
            if !deleted(self.stacks.remove(&id)) {
                stacks_errors += 1;
            }
        }
        if counts_errors + stacks_errors > 0 {
            warn!(counts_errors, stacks_errors, "failed to clear profile maps");
        }
        Ok(samples)
    }

    fn resolve_stack(&self, id: i64, used: &mut FnvHashSet<u32>) -> Vec<u64> {
        let Ok(id) = u32::try_from(id) else {
            return vec![];
        };
        used.insert(id);
        match self.stacks.get(&id, 0) {
            Ok(trace) => trace.frames().iter().map(|f| f.ip).collect(),
            Err(_) => vec![],
        }
    }
}

/// A missing key is as good as a deleted one
fn deleted(res: Result<(), AyaMapError>) -> bool {
    matches!(res, Ok(()) | Err(AyaMapError::KeyNotFound))
}

/// Non-zero outcome counters of the kernel programs
pub fn read_metrics(bpf: &Ebpf) -> Result<Vec<(Metrics, u64)>> {
    let metrics: HashMap<_, u32, u64> =
        HashMap::try_from(bpf.map("METRICS").context("METRICS map not found")?)?;
    let mut out = vec![];
    for m in Metrics::iter() {
        match metrics.get(&(m as u32), 0) {
            Ok(v) if v > 0 => out.push((m, v)),
            Ok(_) | Err(AyaMapError::KeyNotFound) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted() {
        assert!(deleted(Ok(())));
        assert!(deleted(Err(AyaMapError::KeyNotFound)));
        assert!(!deleted(Err(AyaMapError::OutOfBounds {
            index: 1,
            max_entries: 1
        })));
    }
}

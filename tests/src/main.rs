use std::env::args;

use anyhow::{bail, Context, Result};
use pyroprof::{
    controller::{Controller, PolicyResolver},
    maps::{PerfBuffer, PidMap},
    Session, SessionOptions, Task,
};
use pyroprof_common::{PidConfig, PidEvent, ProfilingType, BPF_ANY};
use serde_json::json;

fn session() -> Session {
    Session::new(SessionOptions {
        num_cpus: 2,
        ..Default::default()
    })
}

fn drain_events(session: &Session) -> Result<Vec<PidEvent>> {
    let mut out = vec![];
    for cpu in 0..session.events().num_cpus() {
        session.events().open(cpu)?.read_events(&mut out);
    }
    Ok(out)
}

fn first_sample() -> Result<()> {
    let s = session();
    let outcome = s.perf_event(&Task::new(0, 4242).with_stacks(vec![0xffff_1000], vec![0x1000]));
    let line = json!({
        "outcome": outcome,
        "config": s.pids().get(&4242),
        "counts": s.counts().len(),
        "events": drain_events(&s)?,
    });
    println!("{line}");
    Ok(())
}

fn frame_pointers() -> Result<()> {
    let s = session();
    s.pids()
        .insert(77, PidConfig::new(ProfilingType::FramePointers, true, false), BPF_ANY)?;
    let task = Task::new(1, 77).with_stacks(vec![0xffff_1000], vec![0x1000, 0x2000]);
    for _ in 0..3 {
        s.perf_event(&task);
    }
    for sample in s.collect_profiles() {
        println!("{}", serde_json::to_string(&sample)?);
    }
    println!("{}", json!({ "metrics": s.metrics().snapshot() }));
    Ok(())
}

fn pump<R: PolicyResolver>(bufs: &mut [PerfBuffer], controller: &mut Controller<&PidMap, R>) {
    let mut events = vec![];
    for b in bufs.iter_mut() {
        b.read_events(&mut events);
    }
    for ev in &events {
        controller.handle(ev);
    }
}

fn lifecycle() -> Result<()> {
    let s = session();
    let mut bufs = (0..s.events().num_cpus())
        .map(|cpu| s.events().open(cpu))
        .collect::<Result<Vec<_>, _>>()?;
    let mut controller = Controller::new(s.pids(), |_: u32| {
        Some(PidConfig::new(ProfilingType::FramePointers, true, true))
    });

    let task = Task::new(0, 10).with_stacks(vec![0xffff_1000], vec![0x1000]);
    let mut outcomes = vec![s.perf_event(&task)];
    pump(&mut bufs, &mut controller);

    outcomes.push(s.perf_event(&task));
    outcomes.push(s.exec(&task));
    outcomes.push(s.disassociate_ctty(&task, true));
    pump(&mut bufs, &mut controller);

    let before = s.pids().len();
    let profiles = s.collect_profiles();
    let removed = controller.cleanup();
    let line = json!({
        "outcomes": outcomes,
        "profiles": profiles.len(),
        "pids_before": before,
        "removed": removed,
        "pids_after": s.pids().len(),
    });
    println!("{line}");
    Ok(())
}

fn main() -> Result<()> {
    let test = args().nth(1).context("no input")?;
    match test.as_str() {
        "first-sample" => first_sample(),
        "frame-pointers" => frame_pointers(),
        "lifecycle" => lifecycle(),
        other => bail!("unknown scenario {other}"),
    }
}

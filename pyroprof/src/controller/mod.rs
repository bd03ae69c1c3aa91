//! Consumes lifecycle events and keeps the pid config table up to date.

mod resolver;

use std::mem;

use fnv::FnvHashSet;
use pyroprof_common::{PidConfig, PidEvent, PidOp, BPF_ANY};
use tracing::{debug, warn};

use crate::maps::{MapError, PidMap};

pub use resolver::{is_python, PolicyResolver, ProcfsResolver};

/// The writable side of the pid config table
pub trait PidTable {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Overwrites any existing entry
    fn set(&mut self, pid: u32, config: PidConfig) -> Result<(), Self::Error>;
    fn remove(&mut self, pid: u32) -> Result<(), Self::Error>;
    fn pids(&self) -> Result<Vec<u32>, Self::Error>;
}

impl PidTable for &PidMap {
    type Error = MapError;

    fn set(&mut self, pid: u32, config: PidConfig) -> Result<(), MapError> {
        self.insert(pid, config, BPF_ANY)
    }

    fn remove(&mut self, pid: u32) -> Result<(), MapError> {
        PidMap::remove(self, &pid).map(|_| ()).ok_or(MapError::KeyNotFound)
    }

    fn pids(&self) -> Result<Vec<u32>, MapError> {
        Ok(self.keys())
    }
}

pub struct Controller<T, R> {
    table: T,
    resolver: R,
    dead: FnvHashSet<u32>,
    unknown: FnvHashSet<u32>,
}

impl<T: PidTable, R: PolicyResolver> Controller<T, R> {
    pub fn new(table: T, resolver: R) -> Self {
        Self {
            table,
            resolver,
            dead: FnvHashSet::default(),
            unknown: FnvHashSet::default(),
        }
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn handle(&mut self, event: &PidEvent) {
        match event.pid_op() {
            Some(PidOp::RequestUnknownProcessInfo) | Some(PidOp::RequestExecProcessInfo) => {
                self.resolve(event.pid)
            }
            Some(PidOp::Dead) => self.mark_dead(event.pid),
            None => warn!(op = event.op, pid = event.pid, "unknown pid event"),
        }
    }

    pub fn handle_lost(&mut self, cpu: u32, lost: usize) {
        if lost > 0 {
            warn!(cpu, lost, "pid events lost");
        }
    }

    fn resolve(&mut self, pid: u32) {
        if self.dead.contains(&pid) {
            debug!(pid, "ignoring event for dead pid");
            return;
        }
        if !self.resolver.is_alive(pid) {
            debug!(pid, "process already exited");
            self.mark_dead(pid);
            return;
        }
        match self.resolver.resolve(pid) {
            Some(config) => {
                self.unknown.remove(&pid);
                debug!(pid, ?config, "resolved");
                if let Err(e) = self.table.set(pid, config) {
                    warn!(pid, "unable to update pid config: {e}");
                }
            }
            None => {
                self.unknown.insert(pid);
            }
        }
    }

    fn mark_dead(&mut self, pid: u32) {
        self.unknown.remove(&pid);
        self.dead.insert(pid);
    }

    /// Marks dead every pid in the table whose process is gone, covering
    /// `Dead` notifications that were never delivered. Returns how many
    /// were found.
    pub fn reconcile(&mut self) -> usize {
        let pids = match self.table.pids() {
            Ok(pids) => pids,
            Err(e) => {
                warn!("unable to list pid configs: {e}");
                return 0;
            }
        };
        let mut found = 0;
        for pid in pids {
            if !self.dead.contains(&pid) && !self.resolver.is_alive(pid) {
                self.mark_dead(pid);
                found += 1;
            }
        }
        if found > 0 {
            debug!(found, "reconciled exited pids");
        }
        found
    }

    /// Re-resolves pids the resolver couldn't decide on
    pub fn retry_unknown(&mut self) {
        for pid in mem::take(&mut self.unknown) {
            self.resolve(pid);
        }
    }

    /// Forgets pids reported dead, returns how many were removed
    pub fn cleanup(&mut self) -> usize {
        let mut removed = 0;
        for pid in mem::take(&mut self.dead) {
            match self.table.remove(pid) {
                Ok(()) => removed += 1,
                Err(e) => debug!(pid, "unable to remove pid config: {e}"),
            }
        }
        removed
    }

    pub fn is_dead(&self, pid: u32) -> bool {
        self.dead.contains(&pid)
    }

    pub fn is_unknown(&self, pid: u32) -> bool {
        self.unknown.contains(&pid)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use pyroprof_common::{ProfilingType, BPF_NOEXIST};

    use pyroprof_common::Metrics;

    use super::*;
    use crate::{config::SessionOptions, maps::SharedMap, session::Session, task::Task};

    const FP: PidConfig = PidConfig::new(ProfilingType::FramePointers, true, true);

    fn ev(op: PidOp, pid: u32) -> PidEvent {
        PidEvent::new(op, pid)
    }

    #[test]
    fn test_resolve_overwrites_unknown() {
        let pids: PidMap = SharedMap::with_max_entries(16);
        pids.insert(5, PidConfig::unknown(), BPF_NOEXIST).unwrap();

        let mut c = Controller::new(&pids, |_: u32| Some(FP));
        c.handle(&ev(PidOp::RequestUnknownProcessInfo, 5));
        assert_eq!(pids.get(&5), Some(FP));

        // exec re-resolves
        let mut c = Controller::new(&pids, |_: u32| Some(PidConfig::error()));
        c.handle(&ev(PidOp::RequestExecProcessInfo, 5));
        assert_eq!(pids.get(&5), Some(PidConfig::error()));
    }

    #[test]
    fn test_dead_and_cleanup() {
        let pids: PidMap = SharedMap::with_max_entries(16);
        pids.insert(5, PidConfig::unknown(), BPF_NOEXIST).unwrap();

        let calls = Cell::new(0);
        let mut c = Controller::new(&pids, |_: u32| {
            calls.set(calls.get() + 1);
            Some(FP)
        });
        c.handle(&ev(PidOp::Dead, 5));
        c.handle(&ev(PidOp::RequestUnknownProcessInfo, 5));
        assert_eq!(calls.get(), 0);
        assert!(c.is_dead(5));
        assert_eq!(pids.get(&5), Some(PidConfig::unknown()));

        assert_eq!(c.cleanup(), 1);
        assert!(!c.is_dead(5));
        assert!(pids.is_empty());

        // reused pid
        c.handle(&ev(PidOp::RequestUnknownProcessInfo, 5));
        assert_eq!(pids.get(&5), Some(FP));
    }

    #[test]
    fn test_retry_unknown() {
        let pids: PidMap = SharedMap::with_max_entries(16);
        let ready = Cell::new(false);
        let mut c = Controller::new(&pids, |_: u32| ready.get().then_some(FP));

        c.handle(&ev(PidOp::RequestUnknownProcessInfo, 9));
        assert!(c.is_unknown(9));
        assert_eq!(pids.get(&9), None);

        ready.set(true);
        c.retry_unknown();
        assert!(!c.is_unknown(9));
        assert_eq!(pids.get(&9), Some(FP));
    }

    /// Resolves everything to frame pointers, alive unless listed
    struct Exited<'a>(&'a RefCell<FnvHashSet<u32>>);

    impl PolicyResolver for Exited<'_> {
        fn resolve(&self, _pid: u32) -> Option<PidConfig> {
            Some(FP)
        }

        fn is_alive(&self, pid: u32) -> bool {
            !self.0.borrow().contains(&pid)
        }
    }

    #[test]
    fn test_reconcile_missed_dead() {
        let pids: PidMap = SharedMap::with_max_entries(4);
        let exited = RefCell::default();
        let mut c = Controller::new(&pids, Exited(&exited));

        for pid in 1..=4 {
            pids.insert(pid, PidConfig::unknown(), BPF_NOEXIST).unwrap();
            c.handle(&ev(PidOp::RequestUnknownProcessInfo, pid));
        }
        assert_eq!(pids.len(), 4);

        // 1..=3 exit, their Dead events are lost
        exited.borrow_mut().extend([1, 2, 3]);
        c.handle_lost(0, 3);
        assert_eq!(c.reconcile(), 3);
        assert_eq!(c.reconcile(), 0);
        assert_eq!(c.cleanup(), 3);
        assert_eq!(pids.keys(), vec![4]);
        assert_eq!(pids.get(&4), Some(FP));
    }

    #[test]
    fn test_request_for_exited_pid() {
        let pids: PidMap = SharedMap::with_max_entries(4);
        let exited = RefCell::new([6].into_iter().collect());
        let mut c = Controller::new(&pids, Exited(&exited));

        pids.insert(6, PidConfig::unknown(), BPF_NOEXIST).unwrap();
        c.handle(&ev(PidOp::RequestExecProcessInfo, 6));
        assert!(c.is_dead(6));
        assert!(!c.is_unknown(6));
        assert_eq!(c.cleanup(), 1);
        assert!(pids.is_empty());
    }

    #[test]
    fn test_exited_pids_free_the_table() {
        let session = Session::new(SessionOptions {
            num_cpus: 1,
            max_pids: 4,
            ..Default::default()
        });
        let mut c = Controller::new(session.pids(), ProcfsResolver::new(session.options()));

        // above any pid_max, so never alive
        for pid in 5_000_001..=5_000_002 {
            assert_eq!(session.perf_event(&Task::new(0, pid)), Metrics::TraceMgmt_NewPid);
        }
        let mut events = vec![];
        session.events().open(0).unwrap().read_events(&mut events);
        for ev in &events {
            c.handle(ev);
        }
        // resolved before exiting, Dead never delivered
        for pid in 5_000_003..=5_000_004 {
            session.pids().insert(pid, FP, BPF_NOEXIST).unwrap();
        }
        assert_eq!(
            session.perf_event(&Task::new(0, std::process::id())),
            Metrics::ErrSample_PidsFull
        );

        assert_eq!(c.reconcile(), 2);
        assert_eq!(c.cleanup(), 4);
        assert!(session.pids().is_empty());
        assert_eq!(
            session.perf_event(&Task::new(0, std::process::id())),
            Metrics::TraceMgmt_NewPid
        );
    }

    #[test]
    fn test_unrecognised_op() {
        let pids: PidMap = SharedMap::with_max_entries(16);
        let mut c = Controller::new(&pids, |_: u32| Some(FP));
        c.handle(&PidEvent { op: 42, pid: 1 });
        c.handle_lost(0, 3);
        assert!(pids.is_empty());
    }
}

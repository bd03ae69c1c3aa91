use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use pyroprof_common::{profiler::EventSink, PidEvent};
use tokio::sync::mpsc::{self, error::TrySendError};

use super::MapError;
use crate::task::Task;

struct CpuBuffer {
    tx: mpsc::Sender<PidEvent>,
    rx: Mutex<Option<mpsc::Receiver<PidEvent>>>,
    lost: Arc<AtomicU64>,
}

/// Per-cpu event buffers. Producers never block: a record that doesn't fit
/// is dropped and counted as lost on that cpu.
pub struct PerfEventArray {
    cpus: Box<[CpuBuffer]>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Events {
    pub read: usize,
    pub lost: usize,
}

impl PerfEventArray {
    pub fn new(num_cpus: u32, capacity: usize) -> Self {
        let cpus = (0..num_cpus.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                CpuBuffer {
                    tx,
                    rx: Mutex::new(Some(rx)),
                    lost: Arc::new(AtomicU64::new(0)),
                }
            })
            .collect();
        Self { cpus }
    }

    pub fn num_cpus(&self) -> u32 {
        self.cpus.len() as u32
    }

    pub fn output(&self, cpu: u32, event: &PidEvent) {
        let buf = &self.cpus[cpu as usize % self.cpus.len()];
        match buf.tx.try_send(*event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                buf.lost.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Lost records not yet reported to a reader
    pub fn lost(&self, cpu: u32) -> u64 {
        self.cpus
            .get(cpu as usize)
            .map(|b| b.lost.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Hands out the single reader of `cpu`'s buffer
    pub fn open(&self, cpu: u32) -> Result<PerfBuffer, MapError> {
        let buf = self.cpus.get(cpu as usize).ok_or(MapError::OutOfBounds {
            index: cpu,
            max_entries: self.num_cpus(),
        })?;
        let rx = buf.rx.lock().take().ok_or(MapError::AlreadyOpened(cpu))?;
        Ok(PerfBuffer {
            cpu,
            rx,
            lost: buf.lost.clone(),
        })
    }
}

pub struct PerfBuffer {
    cpu: u32,
    rx: mpsc::Receiver<PidEvent>,
    lost: Arc<AtomicU64>,
}

impl PerfBuffer {
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    /// Drains everything currently buffered into `out`
    pub fn read_events(&mut self, out: &mut Vec<PidEvent>) -> Events {
        let mut read = 0;
        while let Ok(ev) = self.rx.try_recv() {
            out.push(ev);
            read += 1;
        }
        Events {
            read,
            lost: self.take_lost() as usize,
        }
    }

    pub async fn next(&mut self) -> Option<PidEvent> {
        self.rx.recv().await
    }

    pub fn take_lost(&mut self) -> u64 {
        self.lost.swap(0, Ordering::AcqRel)
    }
}

impl EventSink<Task> for PerfEventArray {
    fn output(&self, task: &Task, event: &PidEvent) {
        PerfEventArray::output(self, task.cpu, event)
    }
}

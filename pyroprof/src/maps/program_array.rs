use std::sync::Arc;

use parking_lot::RwLock;
use pyroprof_common::profiler::TailCall;

use super::MapError;

/// A specialized unwinder reachable through the program array
pub trait Sampler<C>: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, ctx: &C);
}

pub struct ProgramArray<C> {
    slots: Box<[RwLock<Option<Arc<dyn Sampler<C>>>>]>,
}

impl<C> ProgramArray<C> {
    pub fn with_max_entries(max_entries: u32) -> Self {
        Self {
            slots: (0..max_entries).map(|_| RwLock::new(None)).collect(),
        }
    }

    pub fn max_entries(&self) -> u32 {
        self.slots.len() as u32
    }

    fn slot(&self, index: u32) -> Result<&RwLock<Option<Arc<dyn Sampler<C>>>>, MapError> {
        self.slots.get(index as usize).ok_or(MapError::OutOfBounds {
            index,
            max_entries: self.max_entries(),
        })
    }

    pub fn set(&self, index: u32, sampler: Arc<dyn Sampler<C>>) -> Result<(), MapError> {
        *self.slot(index)?.write() = Some(sampler);
        Ok(())
    }

    pub fn clear_index(&self, index: u32) -> Result<(), MapError> {
        self.slot(index)?.write().take();
        Ok(())
    }

    pub fn name(&self, index: u32) -> Option<String> {
        let slot = self.slot(index).ok()?.read();
        slot.as_ref().map(|s| s.name().to_string())
    }
}

impl<C> TailCall<C> for ProgramArray<C> {
    fn tail_call(&self, ctx: &C, index: u32) -> Result<(), i64> {
        let prog = self
            .slot(index)
            .map_err(|e| e.errno())?
            .read()
            .clone()
            .ok_or(MapError::KeyNotFound.errno())?;
        prog.run(ctx);
        Ok(())
    }
}

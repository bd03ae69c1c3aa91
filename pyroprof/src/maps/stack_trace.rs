use std::hash::Hasher;

use fnv::FnvHasher;
use parking_lot::RwLock;
use pyroprof_common::{
    profiler::StackStore, BPF_F_FAST_STACK_CMP, BPF_F_REUSE_STACKID, BPF_F_SKIP_FIELD_MASK,
    BPF_F_USER_STACK, MAX_STACK_DEPTH,
};

use super::MapError;
use crate::task::Task;

const VALID_FLAGS: u64 =
    BPF_F_SKIP_FIELD_MASK | BPF_F_USER_STACK | BPF_F_FAST_STACK_CMP | BPF_F_REUSE_STACKID;

struct StackBucket {
    hash: u32,
    nr: usize,
    ips: [u64; MAX_STACK_DEPTH],
}

impl StackBucket {
    fn frames(&self) -> &[u64] {
        &self.ips[..self.nr]
    }
}

/// Hash-addressed store of captured stacks.
///
/// A stack's id is its hash masked to the bucket count, so ids are stable
/// for as long as the bucket isn't overwritten or removed. Two different
/// stacks can collide on a bucket; the second one is rejected with
/// `KeyExists` unless `BPF_F_REUSE_STACKID` is passed.
pub struct StackTraceMap {
    buckets: Box<[RwLock<Option<Box<StackBucket>>>]>,
    mask: u32,
}

impl StackTraceMap {
    /// `max_entries` is rounded up to a power of two
    pub fn with_max_entries(max_entries: u32) -> Self {
        let n = max_entries.max(1).next_power_of_two();
        Self {
            buckets: (0..n).map(|_| RwLock::new(None)).collect(),
            mask: n - 1,
        }
    }

    pub fn max_entries(&self) -> u32 {
        self.mask + 1
    }

    /// Stores `frames` (innermost first) and returns its id
    pub fn store(&self, frames: &[u64], flags: u64) -> Result<u32, MapError> {
        if flags & !VALID_FLAGS != 0 {
            return Err(MapError::InvalidFlags(flags));
        }
        let skip = (flags & BPF_F_SKIP_FIELD_MASK) as usize;
        if frames.len() <= skip {
            return Err(MapError::NoFrames { skip: skip as u32 });
        }
        let frames = &frames[skip..];
        let frames = &frames[..frames.len().min(MAX_STACK_DEPTH)];

        let hash = hash_frames(frames);
        let id = hash & self.mask;
        let mut bucket = self.buckets[id as usize].write();

        if let Some(old) = bucket.as_ref() {
            let same = if flags & BPF_F_FAST_STACK_CMP != 0 {
                old.hash == hash
            } else {
                old.hash == hash && old.frames() == frames
            };
            if same {
                return Ok(id);
            }
            if flags & BPF_F_REUSE_STACKID == 0 {
                return Err(MapError::KeyExists);
            }
        }

        let mut new = Box::new(StackBucket {
            hash,
            nr: frames.len(),
            ips: [0; MAX_STACK_DEPTH],
        });
        new.ips[..frames.len()].copy_from_slice(frames);
        *bucket = Some(new);
        Ok(id)
    }

    pub fn lookup(&self, id: u32) -> Option<Vec<u64>> {
        let bucket = self.buckets.get(id as usize)?.read();
        bucket.as_ref().map(|b| b.frames().to_vec())
    }

    pub fn remove(&self, id: u32) -> Option<Vec<u64>> {
        let old = self.buckets.get(id as usize)?.write().take()?;
        Some(old.frames().to_vec())
    }

    pub fn clear(&self) {
        for b in self.buckets.iter() {
            b.write().take();
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().filter(|b| b.read().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn hash_frames(frames: &[u64]) -> u32 {
    let mut hasher = FnvHasher::default();
    for ip in frames {
        hasher.write_u64(*ip);
    }
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

impl StackStore<Task> for StackTraceMap {
    fn get_stackid(&self, task: &Task, flags: u64) -> i64 {
        let frames = if flags & BPF_F_USER_STACK != 0 {
            &task.user_stack
        } else {
            &task.kernel_stack
        };
        match self.store(frames, flags) {
            Ok(id) => id as i64,
            Err(e) => e.errno(),
        }
    }
}

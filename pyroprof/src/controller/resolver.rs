use std::path::Path;

use procfs::{
    process::{MMapPath, Process},
    ProcError, ProcResult,
};
use pyroprof_common::{PidConfig, ProfilingType};
use tracing::debug;

use crate::config::SessionOptions;

/// Decides how a process is profiled
pub trait PolicyResolver {
    /// `None` when no decision can be made yet
    fn resolve(&self, pid: u32) -> Option<PidConfig>;

    /// `false` once the process is known to be gone
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

impl<F: Fn(u32) -> Option<PidConfig>> PolicyResolver for F {
    fn resolve(&self, pid: u32) -> Option<PidConfig> {
        self(pid)
    }
}

/// Picks the unwinder from what the process has mapped
#[derive(Debug, Clone)]
pub struct ProcfsResolver {
    collect_user: bool,
    collect_kernel: bool,
    python: bool,
}

impl ProcfsResolver {
    pub fn new(options: &SessionOptions) -> Self {
        Self {
            collect_user: options.collect_user,
            collect_kernel: options.collect_kernel,
            python: options.python,
        }
    }

    pub fn detect(&self, process: &Process) -> ProcResult<ProfilingType> {
        if !self.python {
            return Ok(ProfilingType::FramePointers);
        }
        if process.exe().map(|p| is_python(&p)).unwrap_or(false) {
            return Ok(ProfilingType::Python);
        }
        for entry in process.maps()? {
            if let MMapPath::Path(p) = &entry.pathname {
                if is_python(p) {
                    return Ok(ProfilingType::Python);
                }
            }
        }
        Ok(ProfilingType::FramePointers)
    }
}

impl PolicyResolver for ProcfsResolver {
    fn resolve(&self, pid: u32) -> Option<PidConfig> {
        let detected = Process::new(pid as i32).and_then(|p| self.detect(&p));
        match detected {
            Ok(ty) => Some(PidConfig::new(ty, self.collect_user, self.collect_kernel)),
            Err(ProcError::NotFound(_)) => Some(PidConfig::error()),
            Err(e) => {
                debug!(pid, "unable to inspect process: {e}");
                None
            }
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        !matches!(Process::new(pid as i32), Err(ProcError::NotFound(_)))
    }
}

/// `python3.11`, `libpython3.11.so.1.0` and the like
pub fn is_python(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with("python") || n.starts_with("libpython"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_python() {
        assert!(is_python(Path::new("/usr/bin/python3.11")));
        assert!(is_python(Path::new("/usr/lib/x86_64-linux-gnu/libpython3.11.so.1.0")));
        assert!(!is_python(Path::new("/usr/bin/bash")));
        assert!(!is_python(Path::new("/opt/python3/bin/node")));
    }

    #[test]
    fn test_resolve_self() {
        let options = SessionOptions {
            python: true,
            collect_kernel: false,
            ..Default::default()
        };
        let resolver = ProcfsResolver::new(&options);
        let config = resolver.resolve(std::process::id()).unwrap();
        assert_eq!(config.profiling_type(), Some(ProfilingType::FramePointers));
        assert!(config.collect_user());
        assert!(!config.collect_kernel());
    }

    #[test]
    fn test_resolve_gone() {
        let resolver = ProcfsResolver::new(&SessionOptions::default());
        assert_eq!(resolver.resolve(i32::MAX as u32), Some(PidConfig::error()));
    }

    #[test]
    fn test_is_alive() {
        let resolver = ProcfsResolver::new(&SessionOptions::default());
        assert!(resolver.is_alive(std::process::id()));
        assert!(!resolver.is_alive(i32::MAX as u32));
    }
}

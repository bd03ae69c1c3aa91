use pyroprof_common::{profiler::CurrentTask, PF_KTHREAD};

/// The interrupted context handed to the user-space entry points.
///
/// Frames are innermost first. `flags: None` means the task's flags
/// couldn't be read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Task {
    pub cpu: u32,
    /// tgid in the profiler's pid namespace, 0 when unresolved
    pub pid: u32,
    pub has_task: bool,
    pub flags: Option<u32>,
    pub kernel_stack: Vec<u64>,
    pub user_stack: Vec<u64>,
}

impl Task {
    pub fn new(cpu: u32, pid: u32) -> Self {
        Self {
            cpu,
            pid,
            has_task: true,
            flags: Some(0),
            ..Default::default()
        }
    }

    pub fn kthread(cpu: u32, pid: u32) -> Self {
        Self {
            flags: Some(PF_KTHREAD),
            ..Self::new(cpu, pid)
        }
    }

    pub fn with_stacks(mut self, kernel: Vec<u64>, user: Vec<u64>) -> Self {
        self.kernel_stack = kernel;
        self.user_stack = user;
        self
    }
}

impl CurrentTask for Task {
    fn current_pid(&self) -> u32 {
        self.pid
    }

    fn has_task(&self) -> bool {
        self.has_task
    }

    fn task_flags(&self) -> Result<u32, i64> {
        self.flags.ok_or(-(libc::EFAULT as i64))
    }
}

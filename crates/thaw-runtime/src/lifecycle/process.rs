//! Owner liveness checks.

use sysinfo::{Pid, ProcessStatus, System};

/// Start times are recorded in whole seconds; allow one tick of jitter.
const START_TIME_SLACK: u64 = 1;

/// Identity of a process that survives PID reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Seconds since the epoch; 0 if the platform does not report it
    pub start_time: u64,
}

impl ProcessIdentity {
    /// Identity of the calling process.
    pub fn current() -> Self {
        let pid = std::process::id();
        let mut system = System::new();
        let spid = Pid::from_u32(pid);
        let start_time = if system.refresh_process(spid) {
            system.process(spid).map(|p| p.start_time()).unwrap_or(0)
        } else {
            0
        };
        Self { pid, start_time }
    }

    /// Whether the process is still running and is the same one that was
    /// recorded: not exited, not a zombie, and not a recycled PID.
    pub fn is_alive(&self) -> bool {
        let mut system = System::new();
        let spid = Pid::from_u32(self.pid);
        if !system.refresh_process(spid) {
            return false;
        }
        let Some(process) = system.process(spid) else {
            return false;
        };
        if process.status() == ProcessStatus::Zombie {
            return false;
        }
        self.start_time == 0 || process.start_time().abs_diff(self.start_time) <= START_TIME_SLACK
    }
}

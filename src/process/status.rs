use nix::sys::resource::{getrusage, Usage, UsageWho};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Running,
    Stopped,
    Exited,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ProcessStatus::Running => "Running",
            ProcessStatus::Stopped => "Stopped",
            ProcessStatus::Exited => "Exited",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == ProcessStatus::Exited
    }
}

/// Whether the process is in the middle of a dispatch pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Availability {
    #[default]
    Ready,
    Working,
}

/// Resource usage reported by `wait4`/`getrusage`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub user_time: Duration,
    pub system_time: Duration,
    /// Kilobytes on Linux
    pub max_rss: i64,
    pub minor_faults: i64,
    pub major_faults: i64,
    pub voluntary_switches: i64,
    pub involuntary_switches: i64,
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
}

impl From<&libc::rusage> for ResourceUsage {
    fn from(r: &libc::rusage) -> Self {
        Self {
            user_time: timeval(r.ru_utime),
            system_time: timeval(r.ru_stime),
            max_rss: r.ru_maxrss as i64,
            minor_faults: r.ru_minflt as i64,
            major_faults: r.ru_majflt as i64,
            voluntary_switches: r.ru_nvcsw as i64,
            involuntary_switches: r.ru_nivcsw as i64,
        }
    }
}

impl ResourceUsage {
    /// Usage of the calling process
    pub fn current() -> Self {
        getrusage(UsageWho::RUSAGE_SELF)
            .map(|usage: Usage| {
                let raw: &libc::rusage = usage.as_ref();
                Self::from(raw)
            })
            .unwrap_or_default()
    }
}

/// What a `wait4` report means for the tracked child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ProcessStatus,
    pub reason: String,
    pub exit_code: Option<i32>,
}

impl StatusChange {
    /// Classify a wait status. `None` for reports that carry no transition.
    pub fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self {
                status: ProcessStatus::Exited,
                reason: format!("exited with code {}", code),
                exit_code: Some(code),
            }),
            WaitStatus::Signaled(_, signal, core_dumped) => Some(Self {
                status: ProcessStatus::Exited,
                reason: format!(
                    "killed by {}{}",
                    signal.as_str(),
                    if core_dumped { " (core dumped)" } else { "" }
                ),
                exit_code: Some(128 + signal as i32),
            }),
            WaitStatus::Stopped(_, signal) => Some(Self {
                status: ProcessStatus::Stopped,
                reason: format!("stopped by {}", signal.as_str()),
                exit_code: None,
            }),
            WaitStatus::Continued(_) => Some(Self {
                status: ProcessStatus::Running,
                reason: format!("continued by {}", Signal::SIGCONT.as_str()),
                exit_code: None,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_classify_exit() {
        let change = StatusChange::from_wait(WaitStatus::Exited(Pid::from_raw(10), 3)).unwrap();
        assert_eq!(change.status, ProcessStatus::Exited);
        assert_eq!(change.exit_code, Some(3));
        assert_eq!(change.reason, "exited with code 3");
    }

    #[test]
    fn test_classify_signaled() {
        let status = WaitStatus::Signaled(Pid::from_raw(10), Signal::SIGKILL, false);
        let change = StatusChange::from_wait(status).unwrap();
        assert_eq!(change.status, ProcessStatus::Exited);
        assert_eq!(change.exit_code, Some(137));
        assert_eq!(change.reason, "killed by SIGKILL");
    }

    #[test]
    fn test_classify_stop_and_continue() {
        let stopped = StatusChange::from_wait(WaitStatus::Stopped(Pid::from_raw(1), Signal::SIGSTOP)).unwrap();
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        let resumed = StatusChange::from_wait(WaitStatus::Continued(Pid::from_raw(1))).unwrap();
        assert_eq!(resumed.status, ProcessStatus::Running);
        assert!(StatusChange::from_wait(WaitStatus::StillAlive).is_none());
    }

    #[test]
    fn test_current_usage() {
        let usage = ResourceUsage::current();
        assert!(usage.max_rss > 0);
    }
}

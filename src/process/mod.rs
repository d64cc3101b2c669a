//! Local view of the process tree
//!
//! One [`ProcessInfo`] stands for "this process". It owns the records of
//! its direct children and the pipes to its parent and children. A forked
//! child starts from a fresh record whose parent is a [`ProcessSnapshot`]:
//! scalar fields only, no pipes and no children.

pub mod pipe;
pub mod status;

pub use pipe::Pipe;
pub use status::{Availability, ProcessStatus, ResourceUsage, StatusChange};

use crate::error::LoopError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Pid sentinel for [`ProcessInfo::free_pipe`]: free every pipe
pub const ALL_PIPES: i32 = -1;

/// A value copy of a process record, without relationships
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: i32,
    pub status: ProcessStatus,
    pub reason: String,
    pub exit_code: Option<i32>,
    pub usage: ResourceUsage,
    pub availability: Availability,
    pub labels: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub idle: Duration,
    pub last_status_change: DateTime<Utc>,
    pub is_root: bool,
    pub parent_pid: Option<i32>,
}

impl ProcessSnapshot {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// A snapshot with its children, for status output
#[derive(Debug, Clone, Serialize)]
pub struct ProcessTree {
    #[serde(flatten)]
    pub process: ProcessSnapshot,
    pub children: Vec<ProcessTree>,
}

#[derive(Debug)]
pub struct ProcessInfo {
    pid: i32,
    status: ProcessStatus,
    reason: String,
    exit_code: Option<i32>,
    usage: ResourceUsage,
    availability: Availability,
    labels: Vec<String>,
    started_at: DateTime<Utc>,
    idle: Duration,
    last_status_change: DateTime<Utc>,
    is_root: bool,
    parent: Option<ProcessSnapshot>,
    children: BTreeMap<i32, ProcessInfo>,
    pipes: Vec<Pipe>,
}

impl ProcessInfo {
    fn build(pid: i32, labels: &[&str], is_root: bool) -> Self {
        let now = Utc::now();
        Self {
            pid,
            status: ProcessStatus::Running,
            reason: String::new(),
            exit_code: None,
            usage: ResourceUsage::default(),
            availability: Availability::Ready,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            started_at: now,
            idle: Duration::ZERO,
            last_status_change: now,
            is_root,
            parent: None,
            children: BTreeMap::new(),
            pipes: Vec::new(),
        }
    }

    /// The originally launched process of a tree
    pub fn root(pid: i32, labels: &[&str]) -> Self {
        Self::build(pid, labels, true)
    }

    pub fn new(pid: i32, labels: &[&str]) -> Self {
        Self::build(pid, labels, false)
    }

    /// Record for a child reported by `wait4` that this loop never forked
    pub fn placeholder(pid: i32) -> Self {
        let mut info = Self::build(pid, &[], false);
        info.reason = "discovered by wait".to_string();
        info
    }

    pub fn with_parent(mut self, parent: ProcessSnapshot) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub(crate) fn set_pid(&mut self, pid: i32) {
        self.pid = pid;
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn usage(&self) -> &ResourceUsage {
        &self.usage
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    pub fn set_availability(&mut self, availability: Availability) {
        self.availability = availability;
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_status_change(&self) -> DateTime<Utc> {
        self.last_status_change
    }

    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }

    /// Time spent stopped, summed over completed stop intervals
    pub fn idle_time(&self) -> Duration {
        self.idle
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn parent(&self) -> Option<&ProcessSnapshot> {
        self.parent.as_ref()
    }

    pub fn parent_pid(&self) -> Option<i32> {
        self.parent.as_ref().map(|p| p.pid)
    }

    pub fn set_status(&mut self, status: ProcessStatus, reason: &str, usage: ResourceUsage) {
        self.set_status_at(status, reason, usage, Utc::now());
    }

    /// Status transition with an explicit clock reading
    ///
    /// Leaving `Stopped` for `Running` adds the stopped interval to the idle
    /// total. `Exited` is terminal: later transitions are ignored.
    pub fn set_status_at(
        &mut self,
        status: ProcessStatus,
        reason: &str,
        usage: ResourceUsage,
        now: DateTime<Utc>,
    ) {
        if self.status.is_terminal() {
            return;
        }
        if self.status == ProcessStatus::Stopped && status == ProcessStatus::Running {
            self.idle += (now - self.last_status_change).to_std().unwrap_or_default();
        }
        self.status = status;
        self.reason = reason.to_string();
        self.usage = usage;
        self.last_status_change = now;
    }

    pub fn apply(&mut self, change: &StatusChange, usage: ResourceUsage) {
        self.set_status(change.status, &change.reason, usage);
        if change.exit_code.is_some() {
            self.exit_code = change.exit_code;
        }
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            pid: self.pid,
            status: self.status,
            reason: self.reason.clone(),
            exit_code: self.exit_code,
            usage: self.usage,
            availability: self.availability,
            labels: self.labels.clone(),
            started_at: self.started_at,
            idle: self.idle,
            last_status_change: self.last_status_change,
            is_root: self.is_root,
            parent_pid: self.parent_pid(),
        }
    }

    pub fn tree(&self) -> ProcessTree {
        ProcessTree {
            process: self.snapshot(),
            children: self.children.values().map(|c| c.tree()).collect(),
        }
    }

    // Children

    pub fn add_child(&mut self, child: ProcessInfo) {
        self.children.insert(child.pid, child);
    }

    /// Forget a child and free the pipe leading to it
    pub fn remove_child(&mut self, pid: i32) -> Option<ProcessInfo> {
        let child = self.children.remove(&pid)?;
        self.free_pipe(pid);
        Some(child)
    }

    pub fn child(&self, pid: i32) -> Option<&ProcessInfo> {
        self.children.get(&pid)
    }

    pub fn child_mut(&mut self, pid: i32) -> Option<&mut ProcessInfo> {
        self.children.get_mut(&pid)
    }

    pub fn children(&self) -> impl Iterator<Item = &ProcessInfo> {
        self.children.values()
    }

    pub fn child_pids(&self) -> Vec<i32> {
        self.children.keys().copied().collect()
    }

    pub fn count_children(&self) -> usize {
        self.children.len()
    }

    pub fn count_available_children(&self) -> usize {
        self.children
            .values()
            .filter(|c| c.availability == Availability::Ready && c.status == ProcessStatus::Running)
            .count()
    }

    pub fn children_by_label(&self, label: &str) -> Vec<&ProcessInfo> {
        self.children.values().filter(|c| c.has_label(label)).collect()
    }

    /// This process or the first descendant record carrying `label`
    pub fn find_by_label(&self, label: &str) -> Option<&ProcessInfo> {
        if self.has_label(label) {
            return Some(self);
        }
        self.children.values().find_map(|c| c.find_by_label(label))
    }

    /// This process or a descendant record with `pid`
    pub fn find(&self, pid: i32) -> Option<&ProcessInfo> {
        if self.pid == pid {
            return Some(self);
        }
        self.children.values().find_map(|c| c.find(pid))
    }

    // Pipes

    /// Attach a pipe; its peer must be the parent or a known child
    pub fn add_pipe(&mut self, pipe: Pipe) -> Result<(), LoopError> {
        let target = pipe.pid();
        let os_parent = nix::unistd::getppid().as_raw();
        let allowed = Some(target) == self.parent_pid()
            || target == os_parent
            || self.children.contains_key(&target);
        if !allowed {
            return Err(LoopError::PipeTarget(target));
        }
        self.pipes.push(pipe);
        Ok(())
    }

    /// Free the pipes to `pid`, or every pipe for [`ALL_PIPES`]. Returns
    /// how many were freed.
    pub fn free_pipe(&mut self, pid: i32) -> usize {
        let before = self.pipes.len();
        if pid == ALL_PIPES {
            self.pipes.clear();
        } else {
            self.pipes.retain(|p| p.pid() != pid);
        }
        before - self.pipes.len()
    }

    pub fn pipes(&self) -> &[Pipe] {
        &self.pipes
    }

    pub fn pipe(&self, pid: i32) -> Option<&Pipe> {
        self.pipes.iter().find(|p| p.pid() == pid)
    }

    pub fn pipe_by_fd(&self, fd: RawFd) -> Option<&Pipe> {
        self.pipes.iter().find(|p| p.fd() == fd)
    }

    pub(crate) fn pipe_by_fd_mut(&mut self, fd: RawFd) -> Option<&mut Pipe> {
        self.pipes.iter_mut().find(|p| p.fd() == fd)
    }

    pub fn pid_for_descriptor(&self, fd: RawFd) -> Option<i32> {
        self.pipe_by_fd(fd).map(|p| p.pid())
    }

    pub fn has_pipe(&self, pid: i32) -> bool {
        self.pipe(pid).is_some()
    }

    pub fn count_pipes(&self) -> usize {
        self.pipes.len()
    }

    pub fn count_open_pipes(&self) -> usize {
        self.pipes.iter().filter(|p| !p.is_closed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::os::unix::net::UnixStream;

    fn pipe_to(pid: i32) -> Pipe {
        let (a, _b) = UnixStream::pair().unwrap();
        Pipe::new(pid, a, Vec::new()).unwrap()
    }

    #[test]
    fn test_pipe_requires_parent_or_child() {
        let mut info = ProcessInfo::root(100, &[]);
        let err = info.add_pipe(pipe_to(424242)).unwrap_err();
        assert!(matches!(err, LoopError::PipeTarget(424242)));

        info.add_child(ProcessInfo::new(424242, &["w"]));
        info.add_pipe(pipe_to(424242)).unwrap();

        let os_parent = nix::unistd::getppid().as_raw();
        info.add_pipe(pipe_to(os_parent)).unwrap();
        assert_eq!(info.count_pipes(), 2);
    }

    #[test]
    fn test_tracked_parent_accepted() {
        let parent = ProcessInfo::root(5000, &[]).snapshot();
        let mut info = ProcessInfo::new(5001, &[]).with_parent(parent);
        info.add_pipe(pipe_to(5000)).unwrap();
        assert!(info.has_pipe(5000));
    }

    #[test]
    fn test_free_all_pipes() {
        let mut info = ProcessInfo::root(1, &[]);
        for pid in [10, 11, 12] {
            info.add_child(ProcessInfo::new(pid, &[]));
            info.add_pipe(pipe_to(pid)).unwrap();
        }
        assert_eq!(info.free_pipe(11), 1);
        assert_eq!(info.free_pipe(ALL_PIPES), 2);
        assert_eq!(info.count_pipes(), 0);
    }

    #[test]
    fn test_pid_for_descriptor() {
        let mut info = ProcessInfo::root(1, &[]);
        info.add_child(ProcessInfo::new(10, &[]));
        info.add_pipe(pipe_to(10)).unwrap();
        let fd = info.pipes()[0].fd();
        assert_eq!(info.pid_for_descriptor(fd), Some(10));
        assert_eq!(info.pid_for_descriptor(-5), None);
    }

    #[test]
    fn test_remove_child_frees_its_pipe() {
        let mut info = ProcessInfo::root(1, &[]);
        info.add_child(ProcessInfo::new(10, &[]));
        info.add_pipe(pipe_to(10)).unwrap();
        assert!(info.remove_child(10).is_some());
        assert!(!info.has_pipe(10));
        assert!(info.remove_child(10).is_none());
    }

    #[test]
    fn test_idle_time_accumulates_on_resume() {
        let mut info = ProcessInfo::new(9, &[]);
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        info.set_status_at(ProcessStatus::Stopped, "stopped by SIGSTOP", ResourceUsage::default(), t0);
        let t1 = t0 + chrono::Duration::seconds(5);
        info.set_status_at(ProcessStatus::Running, "continued", ResourceUsage::default(), t1);
        assert_eq!(info.idle_time(), Duration::from_secs(5));
        assert_eq!(info.last_status_change(), t1);

        // Running -> Running adds nothing
        let t2 = t1 + chrono::Duration::seconds(5);
        info.set_status_at(ProcessStatus::Running, "continued", ResourceUsage::default(), t2);
        assert_eq!(info.idle_time(), Duration::from_secs(5));
    }

    #[test]
    fn test_exited_is_terminal() {
        let mut info = ProcessInfo::new(9, &[]);
        let change = StatusChange {
            status: ProcessStatus::Exited,
            reason: "exited with code 2".to_string(),
            exit_code: Some(2),
        };
        info.apply(&change, ResourceUsage::default());
        info.set_status(ProcessStatus::Running, "continued", ResourceUsage::default());
        assert_eq!(info.status(), ProcessStatus::Exited);
        assert_eq!(info.exit_code(), Some(2));
    }

    #[test]
    fn test_lookup_by_label() {
        let mut root = ProcessInfo::root(1, &["root"]);
        root.add_child(ProcessInfo::new(2, &["group1"]));
        root.add_child(ProcessInfo::new(3, &["group1", "group2"]));
        assert_eq!(root.find_by_label("root").unwrap().pid(), 1);
        assert_eq!(root.find_by_label("group2").unwrap().pid(), 3);
        assert_eq!(root.children_by_label("group1").len(), 2);
        assert!(root.find_by_label("nope").is_none());
        assert_eq!(root.find(3).unwrap().labels(), &["group1", "group2"]);
    }

    #[test]
    fn test_snapshot_drops_relationships() {
        let mut root = ProcessInfo::root(1, &["root"]);
        root.add_child(ProcessInfo::new(2, &[]));
        let snap = root.snapshot();
        assert!(snap.is_root);
        assert!(snap.has_label("root"));
        let child = ProcessInfo::new(2, &[]).with_parent(snap);
        assert_eq!(child.parent_pid(), Some(1));
        assert!(!child.is_root());
        assert_eq!(child.count_children(), 0);
    }

    #[test]
    fn test_tree_serializes() {
        let mut root = ProcessInfo::root(1, &["root"]);
        root.add_child(ProcessInfo::new(2, &["w"]));
        let json = serde_json::to_value(root.tree()).unwrap();
        assert_eq!(json["pid"], 1);
        assert_eq!(json["children"][0]["pid"], 2);
        assert_eq!(json["children"][0]["labels"][0], "w");
    }
}

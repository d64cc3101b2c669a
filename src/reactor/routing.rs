//! Picking the pipes an outgoing message goes to

use super::Loop;
use crate::error::LoopError;
use crate::process::ProcessInfo;
use crate::protocol::{encode, ResolutionMessage};
use chrono::Utc;
use log::debug;
use std::os::unix::io::RawFd;

/// Strategy for choosing the descriptors of a message's first hop
pub trait Route {
    /// Reject a message before anything is sent
    fn guard(&self, _message: &ResolutionMessage) -> Result<(), LoopError> {
        Ok(())
    }

    fn candidates(&self, process: &ProcessInfo, message: &ResolutionMessage) -> Vec<RawFd>;
}

/// Address by destination pid or label.
///
/// A direct pipe to the pid, or pipes whose peer carries the label, are
/// used when they exist. Broadcasts, and destinations with no direct
/// pipe, go out on every open pipe and are relayed from there.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolutionRoute;

impl Route for ResolutionRoute {
    fn guard(&self, message: &ResolutionMessage) -> Result<(), LoopError> {
        if message.destination_pid().is_none()
            && message.destination_label().is_none()
            && !message.is_broadcast()
        {
            return Err(LoopError::MissingDestination);
        }
        Ok(())
    }

    fn candidates(&self, process: &ProcessInfo, message: &ResolutionMessage) -> Vec<RawFd> {
        let open = process.pipes().iter().filter(|p| !p.is_closed());
        if !message.is_broadcast() {
            let direct: Vec<RawFd> = open
                .clone()
                .filter(|p| match (message.destination_pid(), message.destination_label()) {
                    (Some(pid), _) if p.pid() == pid => true,
                    (_, Some(label)) => p.has_label(label),
                    _ => false,
                })
                .map(|p| p.fd())
                .collect();
            if !direct.is_empty() {
                return direct;
            }
        }
        open.map(|p| p.fd()).collect()
    }
}

/// Send on one known descriptor only
#[derive(Debug, Clone, Copy)]
pub struct DescriptorRoute(pub RawFd);

impl Route for DescriptorRoute {
    fn candidates(&self, process: &ProcessInfo, _message: &ResolutionMessage) -> Vec<RawFd> {
        match process.pipe_by_fd(self.0) {
            Some(pipe) if !pipe.is_closed() => vec![pipe.fd()],
            _ => Vec::new(),
        }
    }
}

impl Loop {
    /// Route `message` by its destination pid or label. Returns the number
    /// of pipes it was queued on.
    pub fn submit(&mut self, message: ResolutionMessage) -> Result<usize, LoopError> {
        self.submit_via(&ResolutionRoute, message)
    }

    pub fn submit_via<R>(&mut self, route: &R, mut message: ResolutionMessage) -> Result<usize, LoopError>
    where
        R: Route + ?Sized,
    {
        route.guard(&message)?;
        let targets = route.candidates(&self.this_process, &message);

        let me = self.pid();
        message.set_sent_at(Utc::now().timestamp() as i32);
        message.stamp_source(me);
        message.stamp_previous(me);

        if targets.is_empty() {
            debug!("no open pipe for {}", message);
            return Ok(0);
        }
        let bytes = encode(message.as_message());
        for fd in &targets {
            self.queue(*fd, bytes.clone());
        }
        Ok(targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Pipe;
    use std::os::unix::net::UnixStream;

    fn process_with_children() -> (ProcessInfo, Vec<UnixStream>) {
        let mut process = ProcessInfo::root(1, &["root"]);
        let mut peers = Vec::new();
        for (pid, label) in [(10, "group1"), (11, "group2"), (12, "group1")] {
            process.add_child(ProcessInfo::new(pid, &[label]));
            let (ours, theirs) = UnixStream::pair().unwrap();
            process
                .add_pipe(Pipe::new(pid, ours, vec![label.to_string()]).unwrap())
                .unwrap();
            peers.push(theirs);
        }
        (process, peers)
    }

    fn pids_of(process: &ProcessInfo, fds: Vec<RawFd>) -> Vec<i32> {
        let mut pids: Vec<i32> = fds
            .into_iter()
            .filter_map(|fd| process.pid_for_descriptor(fd))
            .collect();
        pids.sort();
        pids
    }

    #[test]
    fn test_guard_requires_destination() {
        let route = ResolutionRoute;
        assert!(matches!(
            route.guard(&ResolutionMessage::new()),
            Err(LoopError::MissingDestination)
        ));

        let mut broadcast = ResolutionMessage::new();
        broadcast.set_broadcast(true);
        assert!(route.guard(&broadcast).is_ok());
        assert!(route.guard(&ResolutionMessage::to_pid(3, "x")).is_ok());
    }

    #[test]
    fn test_label_picks_matching_pipes() {
        let (process, _peers) = process_with_children();
        let fds = ResolutionRoute.candidates(&process, &ResolutionMessage::to_label("group1", "x"));
        assert_eq!(pids_of(&process, fds), vec![10, 12]);
    }

    #[test]
    fn test_pid_picks_direct_pipe() {
        let (process, _peers) = process_with_children();
        let fds = ResolutionRoute.candidates(&process, &ResolutionMessage::to_pid(11, "x"));
        assert_eq!(pids_of(&process, fds), vec![11]);
    }

    #[test]
    fn test_unknown_destination_floods() {
        let (process, _peers) = process_with_children();
        let fds = ResolutionRoute.candidates(&process, &ResolutionMessage::to_pid(99, "x"));
        assert_eq!(pids_of(&process, fds), vec![10, 11, 12]);
    }

    #[test]
    fn test_broadcast_ignores_label() {
        let (process, _peers) = process_with_children();
        let mut message = ResolutionMessage::to_label("group2", "x");
        message.set_broadcast(true);
        let fds = ResolutionRoute.candidates(&process, &message);
        assert_eq!(pids_of(&process, fds), vec![10, 11, 12]);
    }

    #[test]
    fn test_descriptor_route() {
        let (process, _peers) = process_with_children();
        let fd = process.pipe(12).unwrap().fd();
        let message = ResolutionMessage::to_label("group2", "x");
        assert_eq!(DescriptorRoute(fd).candidates(&process, &message), vec![fd]);
        assert!(DescriptorRoute(-5).candidates(&process, &message).is_empty());
    }
}

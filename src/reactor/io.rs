//! Pipe reads, writes and inbound message handling

use super::Loop;
use crate::action::{RuntimeArg, Trigger};
use crate::protocol::{encode, ProtocolMessage, ResolutionMessage, StreamDecoder, RESOLUTION_PROTOCOL_ID};
use log::{debug, warn};
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;
use std::time::Duration;

const READ_CHUNK: usize = 8192;
const FLUSH_ATTEMPTS: usize = 50;
const FLUSH_WAIT: Duration = Duration::from_millis(100);

impl Loop {
    /// Read everything available on `fd`, decode the complete frames and
    /// close the connection on EOF
    pub(crate) fn handle_readable(&mut self, fd: RawFd) {
        let mut eof = false;
        {
            let Some(pipe) = self.this_process.pipe_by_fd(fd) else {
                return;
            };
            if pipe.is_closed() {
                return;
            }
            let mut stream = pipe.stream();
            let buffer = self.read_buffers.entry(fd).or_default();
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        eof = true;
                        break;
                    }
                    Err(e) => {
                        warn!("read on fd {} failed: {}", fd, e);
                        eof = true;
                        break;
                    }
                }
            }
        }

        if !self.decode_pending(fd) {
            return;
        }
        if eof {
            self.close_connection(fd);
        }
    }

    /// Decode every complete frame buffered for `fd`. Returns false when a
    /// malformed frame forced the connection closed.
    fn decode_pending(&mut self, fd: RawFd) -> bool {
        let max_frame = self.config.max_frame;
        loop {
            let decoder = self
                .decoders
                .entry(fd)
                .or_insert_with(|| StreamDecoder::with_max_frame(max_frame));
            let buffer = self.read_buffers.entry(fd).or_default();
            match decoder.read(buffer, &mut self.registry) {
                Ok(message) => self.handle_inbound(fd, message),
                Err(e) if e.is_insufficient() => return true,
                Err(e) => {
                    warn!("dropping connection on fd {}: {}", fd, e);
                    self.close_connection(fd);
                    return false;
                }
            }
        }
    }

    /// Deliver a decoded message locally when it is addressed here and
    /// relay it onwards unless it was meant for this pid alone
    pub(crate) fn handle_inbound(&mut self, fd: RawFd, message: ProtocolMessage) {
        if message.id() != RESOLUTION_PROTOCOL_ID {
            debug!("protocol {} message on fd {} handed to callbacks only", message.id(), fd);
            return;
        }
        let message = match ResolutionMessage::from_message(message) {
            Ok(message) => message,
            Err(e) => {
                warn!("unusable resolution message on fd {}: {}", fd, e);
                return;
            }
        };

        let broadcast = message.is_broadcast();
        let label_match = message
            .destination_label()
            .map_or(false, |label| self.this_process.has_label(label));
        let pid_match = message.destination_pid() == Some(self.pid());

        if broadcast || label_match || pid_match {
            self.stage(Trigger::MessageReceived, Some(RuntimeArg::Message(message.clone())));
            if pid_match && !broadcast && !label_match {
                return;
            }
        }
        self.relay(fd, message);
    }

    fn relay(&mut self, arrived_on: RawFd, mut message: ResolutionMessage) {
        let targets: Vec<RawFd> = self
            .this_process
            .pipes()
            .iter()
            .filter(|p| !p.is_closed() && p.fd() != arrived_on)
            .map(|p| p.fd())
            .collect();
        if targets.is_empty() {
            return;
        }
        message.stamp_previous(self.pid());
        debug!("relaying {} to {} pipes", message, targets.len());
        let bytes = encode(message.as_message());
        for fd in targets {
            self.queue(fd, bytes.clone());
        }
    }

    /// Append an encoded frame to `fd`'s write queue and try to send it
    /// right away
    pub(crate) fn queue(&mut self, fd: RawFd, bytes: Vec<u8>) {
        self.write_buffers.entry(fd).or_default().push_back(bytes);
        self.flush_descriptor(fd);
    }

    /// Write as much of `fd`'s queue as the socket takes. Write interest
    /// stays raised while anything is left.
    pub(crate) fn flush_descriptor(&mut self, fd: RawFd) {
        let mut failure = None;
        {
            let Some(pipe) = self.this_process.pipe_by_fd_mut(fd) else {
                self.write_buffers.remove(&fd);
                return;
            };
            if pipe.is_closed() {
                self.write_buffers.remove(&fd);
                return;
            }
            let queue = self.write_buffers.entry(fd).or_default();
            let mut stream = pipe.stream();
            loop {
                let Some(front) = queue.front_mut() else {
                    break;
                };
                match stream.write(front) {
                    Ok(0) => {
                        failure = Some(io::Error::from(io::ErrorKind::WriteZero));
                        break;
                    }
                    Ok(n) if n < front.len() => {
                        front.drain(..n);
                    }
                    Ok(_) => {
                        queue.pop_front();
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            let pending = !queue.is_empty();
            pipe.set_write_interest(pending);
        }

        if let Some(e) = failure {
            debug!("write on fd {} failed: {}", fd, e);
            self.close_connection(fd);
        }
    }

    /// Push out everything still queued before the loop goes away
    pub(crate) fn flush_all(&mut self) {
        for _ in 0..FLUSH_ATTEMPTS {
            let pending: Vec<RawFd> = self
                .write_buffers
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(fd, _)| *fd)
                .collect();
            if pending.is_empty() {
                return;
            }
            for fd in &pending {
                self.flush_descriptor(*fd);
            }
            let interests: Vec<super::poller::Interest> = pending
                .into_iter()
                .filter(|fd| self.write_buffers.get(fd).map_or(false, |q| !q.is_empty()))
                .map(|fd| super::poller::Interest { fd, read: false, write: true })
                .collect();
            if interests.is_empty() {
                return;
            }
            if let Err(e) = super::poller::poll(&interests, FLUSH_WAIT) {
                warn!("poll while flushing failed: {}", e);
                return;
            }
        }
        warn!("giving up on unflushed writes to {} pipes", self.write_buffers.len());
    }

    /// Handle a peer going away on `fd`.
    ///
    /// Stages `process_channel_closed` for the peer. Losing the last open
    /// pipe (or a descriptor nobody owns) stages this process's termination;
    /// a non-root process whose OS parent changed is orphaned and stops.
    pub(crate) fn close_connection(&mut self, fd: RawFd) {
        let is_root = self.this_process.is_root();
        match self.this_process.pid_for_descriptor(fd) {
            None => {
                warn!("closed descriptor {} belongs to no known process", fd);
                self.stage_self(Trigger::Terminated);
            }
            Some(pid) => {
                let Some(pipe) = self.this_process.pipe_by_fd_mut(fd) else {
                    return;
                };
                if pipe.is_closed() {
                    return;
                }
                pipe.mark_closed();
                lifecycle!(self, "channel to {} closed", pid);
                if self.this_process.count_open_pipes() == 0 {
                    self.stage_self(Trigger::Terminated);
                }
                self.stage(Trigger::ChannelClosed, Some(RuntimeArg::Pid(pid)));
            }
        }
        self.forget_descriptor(fd);

        if !is_root {
            let os_parent = nix::unistd::getppid().as_raw();
            if Some(os_parent) != self.this_process.parent_pid() {
                lifecycle!(self, "loop {} orphaned, parent is now {}", self.pid(), os_parent);
                self.stage_self(Trigger::Orphaned);
                self.stop();
            }
        }
    }

    fn stage_self(&mut self, trigger: Trigger) {
        let snapshot = self.this_process.snapshot();
        self.stage(trigger, Some(RuntimeArg::Process(snapshot)));
    }
}

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// A bidirectional channel to one other process of the tree
///
/// Wraps one end of a non-blocking socket pair. Read interest is implied
/// while the pipe is open; write interest is raised only while bytes are
/// queued for it. Dropping the pipe closes the descriptor.
#[derive(Debug)]
pub struct Pipe {
    pid: i32,
    stream: UnixStream,
    labels: Vec<String>,
    write_interest: bool,
    closed: bool,
}

impl Pipe {
    /// `labels` are the peer's labels at the time the pipe is created
    pub fn new(pid: i32, stream: UnixStream, labels: Vec<String>) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            pid,
            stream,
            labels,
            write_interest: false,
            closed: false,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    pub fn wants_write(&self) -> bool {
        self.write_interest && !self.closed
    }

    pub(crate) fn set_write_interest(&mut self, interest: bool) {
        self.write_interest = interest;
    }

    /// A closed pipe stays registered until it is freed but is no longer polled
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
        self.write_interest = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_pipe_is_nonblocking() {
        let (a, _b) = UnixStream::pair().unwrap();
        let pipe = Pipe::new(7, a, vec!["group1".to_string()]).unwrap();
        let mut buf = [0u8; 8];
        let mut stream = pipe.stream();
        let err = stream.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(pipe.has_label("group1"));
        assert!(!pipe.has_label("group2"));
    }

    #[test]
    fn test_drop_closes_descriptor() {
        let (a, mut b) = UnixStream::pair().unwrap();
        b.set_read_timeout(Some(std::time::Duration::from_secs(1))).unwrap();
        let pipe = Pipe::new(7, a, Vec::new()).unwrap();
        drop(pipe);
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_closed_pipe_wants_no_write() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut pipe = Pipe::new(7, a, Vec::new()).unwrap();
        pipe.set_write_interest(true);
        assert!(pipe.wants_write());
        pipe.mark_closed();
        assert!(!pipe.wants_write());
        assert!(pipe.is_closed());
    }
}

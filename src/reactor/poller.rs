//! Readiness polling and periodic timers
//!
//! The loop rebuilds its interest list every turn from the open pipes and
//! signal descriptors, so there is no registration state to tear down after
//! fork: a child simply starts with an empty timer list.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub fd: RawFd,
    pub read: bool,
    pub write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Hang-up or error; a read will observe it
    pub hangup: bool,
}

/// Wait up to `timeout` for any of `interests`.
///
/// An interrupted wait (a signal arrived) returns an empty batch; the
/// signal's self-pipe will be readable on the next call.
pub fn poll(interests: &[Interest], timeout: Duration) -> io::Result<Vec<Readiness>> {
    let mut fds: Vec<PollFd> = interests
        .iter()
        .map(|i| {
            let mut events = PollFlags::empty();
            events.set(PollFlags::POLLIN, i.read);
            events.set(PollFlags::POLLOUT, i.write);
            // SAFETY: every descriptor in the interest list is owned by the
            // loop and outlives this call
            PollFd::new(unsafe { BorrowedFd::borrow_raw(i.fd) }, events)
        })
        .collect();

    // Longer waits just come back around as an extra empty turn
    let millis = timeout.as_millis().min(u16::MAX as u128) as u16;
    match nix::poll::poll(&mut fds, PollTimeout::from(millis)) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    Ok(interests
        .iter()
        .zip(&fds)
        .filter_map(|(interest, p)| {
            let revents = p.revents().filter(|r| !r.is_empty())?;
            Some(Readiness {
                fd: interest.fd,
                readable: revents.contains(PollFlags::POLLIN),
                writable: revents.contains(PollFlags::POLLOUT),
                hangup: revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL),
            })
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Timer<H> {
    id: TimerId,
    interval: Duration,
    due: Instant,
    remaining: Option<u64>,
    handler: Option<H>,
}

/// Periodic timers keyed by [`TimerId`]
///
/// Firing is split in two so the handler can run with the timers' owner
/// borrowed mutably: [`Timers::begin`] lends the handler out and
/// [`Timers::finish`] takes it back and reschedules (or retires) the timer.
pub struct Timers<H> {
    timers: Vec<Timer<H>>,
    next_id: u64,
}

impl<H> Default for Timers<H> {
    fn default() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 1,
        }
    }
}

impl<H> Timers<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max_executions` of `None` repeats forever. With `start_now` the
    /// first run is due immediately instead of after one interval.
    pub fn add(
        &mut self,
        interval: Duration,
        handler: H,
        max_executions: Option<u64>,
        start_now: bool,
        now: Instant,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        if max_executions == Some(0) {
            return id;
        }
        self.timers.push(Timer {
            id,
            interval,
            due: if start_now { now } else { now + interval },
            remaining: max_executions,
            handler: Some(handler),
        });
        id
    }

    pub fn remove(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        before != self.timers.len()
    }

    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.iter().any(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    /// Time until the earliest timer is due, zero if one is overdue
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.timers
            .iter()
            .filter(|t| t.handler.is_some())
            .map(|t| t.due.saturating_duration_since(now))
            .min()
    }

    /// Ids of the timers due at `now`, earliest first
    pub fn due(&self, now: Instant) -> Vec<TimerId> {
        let mut due: Vec<(Instant, TimerId)> = self
            .timers
            .iter()
            .filter(|t| t.handler.is_some() && t.due <= now)
            .map(|t| (t.due, t.id))
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn begin(&mut self, id: TimerId) -> Option<H> {
        self.timers.iter_mut().find(|t| t.id == id)?.handler.take()
    }

    /// Hand the handler back after a run. A timer removed while its handler
    /// ran stays removed.
    pub fn finish(&mut self, id: TimerId, handler: H, now: Instant) {
        let Some(index) = self.timers.iter().position(|t| t.id == id) else {
            return;
        };
        let timer = &mut self.timers[index];
        if let Some(remaining) = timer.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.timers.remove(index);
                return;
            }
        }
        timer.due = now + timer.interval;
        timer.handler = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_poll_reports_readable() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let interest = [Interest { fd: a.as_raw_fd(), read: true, write: false }];

        let ready = poll(&interest, Duration::from_millis(10)).unwrap();
        assert!(ready.is_empty());

        b.write_all(b"x").unwrap();
        let ready = poll(&interest, Duration::from_millis(1000)).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].readable);
        assert_eq!(ready[0].fd, a.as_raw_fd());
    }

    #[test]
    fn test_poll_reports_hangup() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let interest = [Interest { fd: a.as_raw_fd(), read: true, write: false }];
        let ready = poll(&interest, Duration::from_millis(1000)).unwrap();
        assert!(ready[0].readable || ready[0].hangup);
    }

    #[test]
    fn test_timer_runs_max_executions() {
        let mut timers: Timers<u32> = Timers::new();
        let t0 = Instant::now();
        let id = timers.add(Duration::from_secs(1), 7, Some(2), true, t0);

        assert_eq!(timers.due(t0), vec![id]);
        let h = timers.begin(id).unwrap();
        timers.finish(id, h, t0);
        assert!(timers.due(t0).is_empty());
        assert_eq!(timers.next_timeout(t0), Some(Duration::from_secs(1)));

        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(timers.due(t1), vec![id]);
        let h = timers.begin(id).unwrap();
        timers.finish(id, h, t1);
        assert!(!timers.contains(id));
    }

    #[test]
    fn test_timer_delayed_start() {
        let mut timers: Timers<()> = Timers::new();
        let t0 = Instant::now();
        let id = timers.add(Duration::from_millis(500), (), None, false, t0);
        assert!(timers.due(t0).is_empty());
        assert_eq!(timers.due(t0 + Duration::from_millis(500)), vec![id]);
    }

    #[test]
    fn test_timer_removed_while_running() {
        let mut timers: Timers<()> = Timers::new();
        let t0 = Instant::now();
        let id = timers.add(Duration::from_secs(1), (), None, true, t0);
        let h = timers.begin(id).unwrap();
        assert!(timers.remove(id));
        timers.finish(id, h, t0);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_zero_executions_never_scheduled() {
        let mut timers: Timers<()> = Timers::new();
        timers.add(Duration::from_secs(1), (), Some(0), true, Instant::now());
        assert!(timers.is_empty());
    }
}

//! Waiting on the stream's poll descriptor.
//!
//! The server hands every stream exactly one descriptor for readiness
//! signalling (fetched with the POLL_DESCRIPTOR command at open). This
//! module maps a stream direction to the events worth waiting for on it and
//! wraps the poll syscall for that single descriptor; the blocking tail of
//! `drain` is the main consumer. Event loops multiplexing several streams
//! poll `Stream::poll_descriptor` with `Stream::poll_events` themselves.

use crate::error::*;
use crate::Direction;
use libc::pollfd;
use std::io;
use std::os::unix::io::RawFd;

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct PollFlags: ::libc::c_short {
        const POLLIN  = ::libc::POLLIN;
        const POLLPRI = ::libc::POLLPRI;
        const POLLOUT = ::libc::POLLOUT;
        const POLLERR = ::libc::POLLERR;
        const POLLHUP = ::libc::POLLHUP;
        const POLLNVAL = ::libc::POLLNVAL;
    }
}

impl PollFlags {
    /// The events a stream of the given direction waits for: room to refill
    /// for playback, data to fetch for capture.
    pub fn for_direction(dir: Direction) -> PollFlags {
        match dir {
            Direction::Playback => PollFlags::POLLOUT,
            Direction::Capture => PollFlags::POLLIN,
        }
    }
}

/// Waits for `events` on a stream's poll descriptor. `None` waits forever;
/// an expired timeout returns the empty set. Interrupted waits are retried.
pub fn wait(fd: RawFd, events: PollFlags, timeout_ms: Option<u32>) -> Result<PollFlags> {
    let mut fds = [pollfd { fd, events: events.bits(), revents: 0 }];
    loop {
        let r = unsafe {
            libc::poll(fds.as_mut_ptr(), 1,
                       timeout_ms.map(|t| t as libc::c_int).unwrap_or(-1))
        };
        if r < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) { continue; }
            return Err(Error::sys_io("poll", e));
        }
        if r == 0 { return Ok(PollFlags::empty()); }
        return Ok(PollFlags::from_bits_truncate(fds[0].revents));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_events() {
        assert_eq!(PollFlags::for_direction(Direction::Playback), PollFlags::POLLOUT);
        assert_eq!(PollFlags::for_direction(Direction::Capture), PollFlags::POLLIN);
    }

    #[test]
    fn pipe_readiness() {
        let mut p = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(p.as_mut_ptr()) }, 0);
        // nothing queued yet: the timeout expires with the empty set
        assert_eq!(wait(p[0], PollFlags::POLLIN, Some(10)).unwrap(), PollFlags::empty());
        assert_eq!(unsafe { libc::write(p[1], b"x".as_ptr() as *const libc::c_void, 1) }, 1);
        let r = wait(p[0], PollFlags::POLLIN, Some(1000)).unwrap();
        assert!(r.contains(PollFlags::POLLIN));
        unsafe {
            libc::close(p[0]);
            libc::close(p[1]);
        }
    }
}

//! A readiness monitor bounded to the protocol's fixed 30 ms poll
//! deadline.
//!
//! Sockets in this crate stay in blocking mode end to end (per §5 of the
//! spec, server and accepted-connection sockets are blocking and rely on
//! this monitor purely for liveness). We still want `mio`'s epoll-backed
//! readiness notification, so each registration wraps the stream's raw fd
//! in a [`SourceFd`] rather than handing `mio` ownership of a
//! non-blocking socket.
//!
//! `mio`'s epoll backing is edge-triggered: a notification only promises
//! the socket *became* readable since the last poll, not that every
//! byte since has been consumed. A caller that reads exactly one framed
//! message per notification can stall a pipelined second message
//! forever if no further bytes arrive to produce a fresh edge. Callers
//! must drain the stream (see [`crate::framer::pending_bytes`]) after
//! each readable notification rather than assuming level-triggered
//! re-arming.

use std::{io, os::fd::AsRawFd, time::Duration};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};

/// Token used by [`Connection`](crate::connection::Connection) for its
/// single registered stream. Mirrors the fixed single-stream token used
/// throughout this crate's listener/accept-loop registrations.
pub(crate) const STREAM: Token = Token(0);

/// The bounded wait every poll in this crate uses, matching the spec's
/// fixed 30 ms deadline for loop cancellation latency.
pub(crate) const POLL_DEADLINE: Duration = Duration::from_millis(30);

/// Wraps an `mio::Poll` for registering raw, blocking file descriptors and
/// waiting on them with a bounded timeout.
pub(crate) struct ReadinessMonitor {
    poll: Poll,
    events: Events,
}

impl ReadinessMonitor {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(64) })
    }

    pub(crate) fn register_readable(&self, fd: &impl AsRawFd, token: Token) -> io::Result<()> {
        self.poll.registry().register(&mut SourceFd(&fd.as_raw_fd()), token, Interest::READABLE)
    }

    pub(crate) fn deregister(&self, fd: &impl AsRawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd.as_raw_fd()))
    }

    /// Polls once, bounded by `timeout`, and returns the tokens that
    /// became readable.
    pub(crate) fn poll(&mut self, timeout: Duration) -> io::Result<impl Iterator<Item = Token> + '_> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(self.events.iter().map(|e| e.token()))
    }

    /// Convenience for the single-stream case: did `STREAM` become
    /// readable within the fixed deadline?
    pub(crate) fn poll_stream_readable(&mut self) -> io::Result<bool> {
        Ok(self.poll(POLL_DEADLINE)?.any(|t| t == STREAM))
    }
}

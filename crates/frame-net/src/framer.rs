//! Size↔bytes conversions and raw fixed-size send/recv over a stream.
//!
//! This is the lowest layer: it knows nothing about handshakes, ACKs or
//! plugins, only about moving exactly N bytes across a [`TcpStream`] and
//! detecting when the peer has gone away.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    os::fd::AsRawFd,
    sync::atomic::{AtomicBool, Ordering},
};

/// Big-endian 4-byte encoding of a size header. Bit-layout is part of the
/// wire contract and must not change.
#[inline]
pub fn size_to_bytes(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

/// Inverse of [`size_to_bytes`].
#[inline]
pub fn bytes_to_size(b: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*b)
}

/// Writes all of `buf` to `stream`, looping over short writes.
///
/// Fails with the underlying [`io::Error`] if the stream errors; the
/// caller is responsible for setting `shutdown` on such failure (this
/// function has no connection-level state to flip).
pub fn raw_send(mut stream: &TcpStream, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        let n = stream.write(&buf[sent..])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "peer closed during send"));
        }
        sent += n;
    }
    Ok(())
}

/// Reads exactly `size` bytes from `stream`, looping over short reads.
///
/// If any read yields zero bytes, `shutdown` is set and a 4-byte all-zero
/// buffer is returned immediately, regardless of `size`. This is the
/// peer-close sentinel: a zero-length read is a POSIX-reliable close
/// signal, and the 4-zero buffer is chosen so that a caller expecting a
/// size header decodes it to `0`, which the framed-receive path then
/// recognises (together with `shutdown`) as end-of-stream rather than a
/// legal message.
pub fn raw_recv(mut stream: &TcpStream, size: usize, shutdown: &AtomicBool) -> io::Result<Vec<u8>> {
    let mut buf = vec![0_u8; size];
    let mut have = 0;
    while have < size {
        let n = stream.read(&mut buf[have..])?;
        if n == 0 {
            shutdown.store(true, Ordering::Relaxed);
            return Ok(vec![0, 0, 0, 0]);
        }
        have += n;
    }
    Ok(buf)
}

/// Bytes currently queued in the socket's receive buffer, unconsumed.
///
/// The readiness monitor is edge-triggered: one readable notification
/// only promises that *some* data arrived, not that the whole burst has
/// been drained by a single framed receive. After handling one message,
/// callers loop on this to decide whether another complete message may
/// already be sitting in the kernel buffer, rather than waiting for a
/// fresh edge that a pipelined sender may never produce.
pub fn pending_bytes(stream: &TcpStream) -> io::Result<usize> {
    let mut available: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(stream.as_raw_fd(), libc::FIONREAD, &mut available) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(available.max(0) as usize)
}

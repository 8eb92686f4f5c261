//! Handshake, framed message exchange, per-connection loop and lifecycle.
//!
//! A [`Connection`] is a cheap, `Clone`-able handle (an `Arc` around the
//! shared state) around one TCP stream. Construction never blocks;
//! [`Connection::start`] spawns the dedicated worker thread that performs
//! the handshake and then runs the receive loop until `shutdown`. The
//! handle stays usable from other threads the whole time — that's the
//! "independent reader and writer contexts" contract: `transmit` can be
//! called from the worker's own `loop_pass` hook or from any other thread
//! holding a clone of the handle, and both paths serialise through the
//! same connection lock.

use std::{
    net::{SocketAddr, TcpStream},
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use thiserror::Error;

use crate::{
    error::{ConfigError, HandshakeError, TransmitRejected},
    framer,
    host::resolve_ipv4,
    id::ConnId,
    plugin::{PluginChain, PluginProvider},
    readiness::{ReadinessMonitor, STREAM},
    status::{MSG_MAX_SIZE, SC_GENERIC_ERROR, SC_OK},
};

/// Where a [`Connection`]'s stream comes from.
///
/// `AlreadyUp` is how the server wraps a freshly accepted socket.
/// `Dial` is how the client establishes an outbound connection: the
/// actual `connect()` happens inside [`Connection::start`]'s worker
/// thread, not at construction time.
pub enum StreamSource {
    AlreadyUp(TcpStream),
    Dial { host: String, port: u16, timeout: Option<Duration> },
}

/// Errors that can abort a connection before it becomes usable.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("I/O error during connection setup: {0}")]
    Io(#[from] std::io::Error),
}

/// The sole extension points the core calls on the connection's I/O path.
/// All default to no-ops; a delegate overrides only what it needs.
///
/// `loop_pass` is the idiomatic place to drain an application outbox and
/// call [`Connection::transmit`] — see the module docs for why that's
/// safe to do without racing the reader.
pub trait ConnectionDelegate: Send {
    fn pre_loop(&mut self, _conn: &Connection) {}
    fn post_loop(&mut self, _conn: &Connection) {}
    fn loop_pass(&mut self, _conn: &Connection) {}
    fn transmission_received(&mut self, _conn: &Connection, _payload: Vec<u8>) {}
}

/// A delegate that does nothing. The default for callers with no hooks
/// to run.
pub struct NullDelegate;
impl ConnectionDelegate for NullDelegate {}

struct Shared {
    id: ConnId,
    stream: OnceLock<TcpStream>,
    dial_target: Option<(String, u16, Option<Duration>)>,
    shutdown: AtomicBool,
    peer_addr: Mutex<Option<SocketAddr>>,
    plugins: PluginChain,
    tx_lock: Mutex<()>,
    monitor: Mutex<Option<ReadinessMonitor>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A handle to one framed-message connection and its worker thread.
///
/// Cheap to clone; every clone refers to the same underlying stream and
/// lifecycle state.
#[derive(Clone)]
pub struct Connection(Arc<Shared>);

impl Connection {
    /// Builds a connection handle. Does not block, does not touch the
    /// network, does not start the worker thread.
    pub fn new(source: StreamSource, plugins: Vec<PluginProvider>) -> Connection {
        Self::with_id(ConnId::new_random(), source, plugins)
    }

    pub(crate) fn with_id(
        id: ConnId,
        source: StreamSource,
        plugins: Vec<PluginProvider>,
    ) -> Connection {
        let stream_cell = OnceLock::new();
        let dial_target = match source {
            StreamSource::AlreadyUp(stream) => {
                let _ = stream_cell.set(stream);
                None
            }
            StreamSource::Dial { host, port, timeout } => Some((host, port, timeout)),
        };

        Connection(Arc::new(Shared {
            id,
            stream: stream_cell,
            dial_target,
            shutdown: AtomicBool::new(false),
            peer_addr: Mutex::new(None),
            plugins: PluginChain::new(plugins),
            tx_lock: Mutex::new(()),
            monitor: Mutex::new(None),
            worker: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> ConnId {
        self.0.id
    }

    /// Launches the worker context: `initialise` (handshake) → `pre_loop`
    /// → the receive loop → `post_loop` → cleanup.
    ///
    /// If the handshake fails (bad dial target, rejected handshake byte,
    /// I/O error), the worker logs and exits without ever running
    /// `pre_loop`/the receive loop/`post_loop`. `is_alive()` reflects that
    /// exit identically to any other.
    pub fn start(&self, delegate: Box<dyn ConnectionDelegate>) {
        let conn = self.clone();
        let handle = thread::spawn(move || conn.run_worker(delegate));
        *self.0.worker.lock().unwrap() = Some(handle);
    }

    fn run_worker(&self, mut delegate: Box<dyn ConnectionDelegate>) {
        if let Err(err) = self.initialise() {
            tracing::warn!(conn = %self.0.id, error = %err, "connection: setup failed, worker exiting");
            return;
        }
        delegate.pre_loop(self);
        self.connection_loop(delegate.as_mut());
        delegate.post_loop(self);
        self.cleanup();
    }

    fn initialise(&self) -> Result<(), ConnectError> {
        if let Some((host, port, timeout)) = &self.0.dial_target {
            let addr = resolve_ipv4(host, *port)?;
            let stream = match timeout {
                Some(t) => TcpStream::connect_timeout(&addr, *t)?,
                None => TcpStream::connect(addr)?,
            };
            if let Some(t) = timeout {
                stream.set_read_timeout(Some(*t))?;
                stream.set_write_timeout(Some(*t))?;
            }
            self.0
                .stream
                .set(stream)
                .unwrap_or_else(|_| unreachable!("initialise runs exactly once"));
        }

        let stream = self.stream();
        framer::raw_send(stream, &[SC_OK])?;
        let resp = framer::raw_recv(stream, 1, &self.0.shutdown)?;
        let byte = resp.first().copied().unwrap_or(0);
        if byte != SC_OK {
            return Err(HandshakeError(byte).into());
        }

        *self.0.peer_addr.lock().unwrap() = stream.peer_addr().ok();

        let monitor = ReadinessMonitor::new()?;
        monitor.register_readable(stream, STREAM)?;
        *self.0.monitor.lock().unwrap() = Some(monitor);

        tracing::debug!(conn = %self.0.id, peer = ?self.peer_addr(), "connection: handshake complete");
        Ok(())
    }

    fn connection_loop(&self, delegate: &mut dyn ConnectionDelegate) {
        while !self.is_shutdown() {
            let readable = {
                let mut monitor = self.0.monitor.lock().unwrap();
                match monitor.as_mut().expect("monitor set during initialise").poll_stream_readable()
                {
                    Ok(r) => r,
                    Err(err) => {
                        tracing::error!(conn = %self.0.id, error = %err, "connection: readiness poll failed");
                        false
                    }
                }
            };

            if readable {
                self.drain_readable(delegate);
            }

            delegate.loop_pass(self);
        }
    }

    /// Handles every message already queued on the stream for one
    /// readable notification.
    ///
    /// The readiness monitor's edge-triggered epoll backing only
    /// guarantees a notification when the socket transitions from
    /// not-readable to readable; it does not refire for a second,
    /// pipelined message that arrived in the same burst as the first.
    /// Looping here until the kernel receive buffer reports empty (via
    /// [`framer::pending_bytes`]) is what makes that second message get
    /// read on this same pass instead of stalling its sender's ACK wait
    /// until unrelated traffic produces a fresh edge.
    fn drain_readable(&self, delegate: &mut dyn ConnectionDelegate) {
        loop {
            if let Some(payload) = self.receive() {
                delegate.transmission_received(self, payload);
            }
            if self.is_shutdown() {
                return;
            }
            match framer::pending_bytes(self.stream()) {
                Ok(n) if n > 0 => continue,
                _ => return,
            }
        }
    }

    fn cleanup(&self) {
        if let Some(stream) = self.0.stream.get() {
            if let Some(monitor) = self.0.monitor.lock().unwrap().take() {
                let _ = monitor.deregister(stream);
            }
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        tracing::debug!(conn = %self.0.id, "connection: cleaned up");
    }

    /// Sends one framed message: plugin pipeline → size header → wait for
    /// ACK → payload.
    ///
    /// An I/O failure anywhere in this sequence sets `shutdown` and is
    /// logged, never re-thrown — this is what lets one flaky peer not
    /// kill the host process. A non-OK ACK is a protocol-level rejection
    /// and *is* surfaced, since the caller may want to retry.
    pub fn transmit(&self, payload: &[u8]) -> Result<(), TransmitRejected> {
        if self.is_shutdown() {
            return Ok(());
        }

        let _guard = self.0.tx_lock.lock().unwrap();
        let stream = self.stream();
        let transformed = self.0.plugins.on_transmit(payload.to_vec());
        let len = u32::try_from(transformed.len()).unwrap_or(u32::MAX);

        if let Err(err) = framer::raw_send(stream, &framer::size_to_bytes(len)) {
            self.fail(err, "sending size header");
            return Ok(());
        }

        let ack = match framer::raw_recv(stream, 1, &self.0.shutdown) {
            Ok(ack) => ack,
            Err(err) => {
                self.fail(err, "receiving ack");
                return Ok(());
            }
        };
        let ack_byte = ack.first().copied().unwrap_or(0);
        if ack_byte != SC_OK {
            return Err(TransmitRejected(ack_byte));
        }

        if let Err(err) = framer::raw_send(stream, &transformed) {
            self.fail(err, "sending payload");
        }
        Ok(())
    }

    /// Reads one framed message, if the protocol state allows it.
    ///
    /// Returns `None` for "no message": the size header exceeded the cap
    /// (the sender is told `SC_GENERIC_ERROR`), or the header decoded to
    /// zero while already shut down (peer-closed). Returns `Some(vec![])`
    /// if an I/O error aborted the exchange midway — the empty buffer is
    /// distinct from "no message" and, matching the reference
    /// implementation, is still handed to `transmission_received`.
    fn receive(&self) -> Option<Vec<u8>> {
        let _guard = self.0.tx_lock.lock().unwrap();
        let stream = self.stream();

        let header = match framer::raw_recv(stream, 4, &self.0.shutdown) {
            Ok(h) => h,
            Err(err) => {
                self.fail(err, "reading size header");
                return Some(Vec::new());
            }
        };
        let header: [u8; 4] = header.try_into().expect("raw_recv(4) always returns 4 bytes");
        let size = framer::bytes_to_size(&header);

        if size > MSG_MAX_SIZE {
            if let Err(err) = framer::raw_send(stream, &[SC_GENERIC_ERROR]) {
                self.fail(err, "sending oversize rejection");
            }
            return None;
        }
        if size == 0 && self.is_shutdown() {
            return None;
        }

        if let Err(err) = framer::raw_send(stream, &[SC_OK]) {
            self.fail(err, "sending ack");
            return Some(Vec::new());
        }

        let payload = match framer::raw_recv(stream, size as usize, &self.0.shutdown) {
            Ok(p) => p,
            Err(err) => {
                self.fail(err, "reading payload");
                return Some(Vec::new());
            }
        };
        Some(self.0.plugins.on_receive(payload))
    }

    fn fail(&self, err: std::io::Error, doing: &str) {
        self.0.shutdown.store(true, Ordering::Relaxed);
        tracing::warn!(conn = %self.0.id, error = %err, "connection: shutting down, I/O error {doing}");
    }

    fn stream(&self) -> &TcpStream {
        self.0.stream.get().expect("stream established during initialise")
    }

    /// Signals the worker to stop at its next loop boundary. Does not
    /// force-close an in-progress framed transaction.
    pub fn shutdown(&self) {
        self.0.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.shutdown.load(Ordering::Relaxed)
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        match self.0.worker.lock().unwrap().as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.0.peer_addr.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, TcpListener};

    use super::*;

    fn handshake_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (server, client.join().unwrap())
    }

    #[test]
    fn handshake_completes_when_both_sides_send_ok() {
        let (server_sock, client_sock) = handshake_pair();

        let server = Connection::new(StreamSource::AlreadyUp(server_sock), Vec::new());
        let client = Connection::new(StreamSource::AlreadyUp(client_sock), Vec::new());

        server.start(Box::new(NullDelegate));
        client.start(Box::new(NullDelegate));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.peer_addr().is_none() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(server.peer_addr().is_some());
        assert!(client.peer_addr().is_some());
        assert!(server.is_alive());
        assert!(client.is_alive());

        server.shutdown();
        client.shutdown();
    }

    #[test]
    fn handshake_fails_on_bad_validation_byte() {
        let (server_sock, client_sock) = handshake_pair();

        // A peer that never completes the handshake protocol: it writes a
        // single bad status byte instead of SC_OK.
        let bad_peer = thread::spawn(move || {
            use std::io::{Read, Write};
            let mut sock = client_sock;
            let mut buf = [0_u8; 1];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&[0x01]).unwrap();
        });

        let server = Connection::new(StreamSource::AlreadyUp(server_sock), Vec::new());
        server.start(Box::new(NullDelegate));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.is_alive() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(!server.is_alive(), "worker should have exited after a failed handshake");
        bad_peer.join().unwrap();
    }
}

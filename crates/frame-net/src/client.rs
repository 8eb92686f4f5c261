//! Outbound connection factory, client-side connection registry, and the
//! cooperative client loop.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    connection::{Connection, ConnectionDelegate, NullDelegate, StreamSource},
    id::ConnId,
    plugin::PluginProvider,
    readiness::POLL_DEADLINE,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Hooks into the client's own cooperative loop, distinct from
/// [`ConnectionDelegate`] which governs one connection's I/O.
pub trait ClientDelegate: Send {
    fn loop_pass(&mut self, _client: &Client) {}
}

impl ClientDelegate for NullDelegate {}

struct Shared {
    connections: Mutex<HashMap<ConnId, Connection>>,
    shutdown: AtomicBool,
    loop_worker: Mutex<Option<JoinHandle<()>>>,
}

/// Factory and registry for outbound connections, plus a cooperative
/// background loop that paces user work at a fixed 30 ms cadence.
///
/// Unlike [`Server`](crate::server::Server), the client has no
/// server-level readiness monitor: each [`Connection`] it creates runs
/// its own worker thread with its own monitor, so the client loop's only
/// job is to give the delegate a steady heartbeat for draining outboxes.
pub struct Client {
    shared: Arc<Shared>,
    plugin_factories: Arc<dyn Fn() -> Vec<PluginProvider> + Send + Sync>,
    timeout: Option<Duration>,
}

impl Client {
    pub fn new() -> Self {
        Client {
            shared: Arc::new(Shared {
                connections: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
                loop_worker: Mutex::new(None),
            }),
            plugin_factories: Arc::new(Vec::new),
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    pub fn with_plugins<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Vec<PluginProvider> + Send + Sync + 'static,
    {
        self.plugin_factories = Arc::new(factory);
        self
    }

    /// Sets the socket timeout applied to every connection this client
    /// dials. `None` means block indefinitely (matching plain
    /// `TcpStream::connect`).
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dials `host:port` and registers the resulting connection under a
    /// fresh id. Returns as soon as registration is done — the dial and
    /// handshake happen on the connection's own worker thread, so the
    /// connection may still be mid-handshake when this returns.
    pub fn connect_to(
        &self,
        host: impl Into<String>,
        port: u16,
        delegate: Box<dyn ConnectionDelegate>,
    ) -> ConnId {
        let id = ConnId::new_random();
        let source = StreamSource::Dial { host: host.into(), port, timeout: self.timeout };
        let conn = Connection::with_id(id, source, (self.plugin_factories)());
        conn.start(delegate);

        self.shared.connections.lock().unwrap().insert(id, conn);
        tracing::debug!(conn = %id, "client: connection registered");
        id
    }

    pub fn connection(&self, id: ConnId) -> Option<Connection> {
        self.shared.connections.lock().unwrap().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Starts the cooperative client loop on its own thread: repeatedly
    /// calls `delegate.loop_pass`, then sleeps 30 ms, until
    /// [`Client::shutdown`].
    pub fn start(&self, mut delegate: Box<dyn ClientDelegate>) {
        let shared = Arc::clone(&self.shared);
        let plugin_factories = Arc::clone(&self.plugin_factories);
        let timeout = self.timeout;

        let handle = thread::spawn(move || {
            let client = Client { shared: Arc::clone(&shared), plugin_factories, timeout };
            while !shared.shutdown.load(Ordering::Relaxed) {
                delegate.loop_pass(&client);
                thread::sleep(POLL_DEADLINE);
            }
        });
        *self.shared.loop_worker.lock().unwrap() = Some(handle);
    }

    /// Stops the client loop and signals every registered connection to
    /// shut down. Does not join any worker thread.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        for conn in self.shared.connections.lock().unwrap().values() {
            conn.shutdown();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Relaxed)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

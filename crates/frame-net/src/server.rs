//! Listener setup, accept loop, connection-limit policy and the server
//! connection registry.

use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::FromRawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use crate::{
    connection::{Connection, ConnectionDelegate, NullDelegate, StreamSource},
    error::{ConfigError, ServerStartError, StateError},
    framer,
    host::validate_port,
    id::ConnId,
    plugin::PluginProvider,
    readiness::{POLL_DEADLINE, ReadinessMonitor},
    status::SC_CONLIMIT,
};

/// Hooks into the server's own lifecycle, distinct from
/// [`ConnectionDelegate`] which governs one connection's I/O.
pub trait ServerDelegate: Send {
    fn pre_loop(&mut self, _server: &Server) {}
    fn post_loop(&mut self, _server: &Server) {}
    fn loop_pass(&mut self, _server: &Server) {}
    fn conn_init(&mut self, _id: ConnId, _conn: &Connection) {}
    fn conn_shutdown(&mut self, _id: ConnId, _conn: &Connection) {}

    /// Builds the per-connection delegate for a freshly accepted
    /// connection. The default spawns connections with no hooks of their
    /// own; override to wire up `transmission_received` and friends.
    fn connection_delegate(&mut self, _id: ConnId, _conn: &Connection) -> Box<dyn ConnectionDelegate> {
        Box::new(NullDelegate)
    }
}

impl ServerDelegate for NullDelegate {}

struct Listener {
    std_listener: TcpListener,
    addr: SocketAddr,
}

struct Shared {
    listeners: Mutex<Vec<Listener>>,
    connections: Mutex<HashMap<ConnId, Connection>>,
    shutdown: AtomicBool,
    accept_worker: Mutex<Option<JoinHandle<()>>>,
}

/// A length-prefixed-message server: listens on one or more IPv4
/// addresses, accepts connections up to an optional limit, and hands
/// each one off to its own worker thread.
///
/// Built with chained `with_*` calls, then handed to [`Server::start`]
/// together with the [`ServerDelegate`] that supplies connection hooks.
pub struct Server {
    shared: Arc<Shared>,
    addrs: Vec<(String, u16)>,
    max_connections: Option<usize>,
    plugin_factories: Arc<dyn Fn() -> Vec<PluginProvider> + Send + Sync>,
}

impl Server {
    pub fn new() -> Self {
        Server {
            shared: Arc::new(Shared {
                listeners: Mutex::new(Vec::new()),
                connections: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
                accept_worker: Mutex::new(None),
            }),
            addrs: Vec::new(),
            max_connections: None,
            plugin_factories: Arc::new(Vec::new),
        }
    }

    /// Adds a listen address. Validated eagerly so misconfiguration
    /// surfaces before `start()`, not mid-accept-loop.
    pub fn add_addr(mut self, host: &str, port: u32) -> Result<Self, ConfigError> {
        let port = validate_port(port)?;
        crate::host::parse_ipv4(host)?;
        self.addrs.push((host.to_string(), port));
        Ok(self)
    }

    pub fn with_connection_limit(mut self, limit: usize) -> Self {
        self.max_connections = Some(limit);
        self
    }

    /// Supplies a fresh plugin chain for every accepted connection. The
    /// closure is invoked once per accept, mirroring
    /// [`PluginProvider::Factory`]'s per-connection resolution contract.
    pub fn with_plugins<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Vec<PluginProvider> + Send + Sync + 'static,
    {
        self.plugin_factories = Arc::new(factory);
        self
    }

    /// Activates listeners and runs the accept loop on a dedicated
    /// thread. Returns once listeners are bound; the accept loop itself
    /// runs in the background until [`Server::shutdown`] is called.
    pub fn start(&self, mut delegate: Box<dyn ServerDelegate>) -> Result<(), ServerStartError> {
        if !self.shared.listeners.lock().unwrap().is_empty() {
            return Err(StateError::ListenersAlreadyActive.into());
        }
        if self.addrs.is_empty() {
            return Err(ConfigError::NoAddresses.into());
        }

        let mut listeners = Vec::new();
        for (host, port) in &self.addrs {
            let std_listener = bind_reuseaddr(host, *port)?;
            let addr = std_listener.local_addr().map_err(|_| ConfigError::NoAddresses)?;
            tracing::info!(%addr, "server: listener bound");
            listeners.push(Listener { std_listener, addr });
        }
        *self.shared.listeners.lock().unwrap() = listeners;

        let shared = Arc::clone(&self.shared);
        let max_connections = self.max_connections;
        let plugin_factories = Arc::clone(&self.plugin_factories);

        let handle = thread::spawn(move || {
            delegate.pre_loop(&Server::handle_only(Arc::clone(&shared)));
            accept_loop(&shared, max_connections, plugin_factories.as_ref(), delegate.as_mut());
            delegate.post_loop(&Server::handle_only(Arc::clone(&shared)));
            shutdown_active_connections(&shared);
            close_listeners(&shared);
        });
        *self.shared.accept_worker.lock().unwrap() = Some(handle);

        Ok(())
    }

    fn handle_only(shared: Arc<Shared>) -> Server {
        Server {
            shared,
            addrs: Vec::new(),
            max_connections: None,
            plugin_factories: Arc::new(Vec::new),
        }
    }

    /// Signals the accept loop to stop. Does not block until it has —
    /// query [`Server::is_running`] if you need to know when it's done.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        match self.shared.accept_worker.lock().unwrap().as_ref() {
            Some(h) => !h.is_finished(),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.shared.listeners.lock().unwrap().iter().map(|l| l.addr).collect()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

fn accept_loop(
    shared: &Arc<Shared>,
    max_connections: Option<usize>,
    plugin_factories: &(dyn Fn() -> Vec<PluginProvider> + Send + Sync),
    delegate: &mut dyn ServerDelegate,
) {
    let mut monitor = match ReadinessMonitor::new() {
        Ok(m) => m,
        Err(err) => {
            tracing::error!(error = %err, "server: failed to create readiness monitor, accept loop exiting");
            return;
        }
    };

    {
        let listeners = shared.listeners.lock().unwrap();
        for (i, listener) in listeners.iter().enumerate() {
            if let Err(err) = monitor.register_readable(&listener.std_listener, mio::Token(i)) {
                tracing::error!(error = %err, addr = %listener.addr, "server: failed to register listener");
            }
        }
    }

    while !shared.shutdown.load(Ordering::Relaxed) {
        let ready: Vec<usize> = match monitor.poll(POLL_DEADLINE) {
            Ok(tokens) => tokens.map(|t| t.0).collect(),
            Err(err) => {
                tracing::error!(error = %err, "server: readiness poll failed");
                Vec::new()
            }
        };

        for token in ready {
            let accepted = {
                let listeners = shared.listeners.lock().unwrap();
                listeners.get(token).and_then(|l| l.std_listener.accept().ok())
            };
            if let Some((socket, peer_addr)) = accepted {
                initialise_connection(
                    shared,
                    socket,
                    peer_addr,
                    max_connections,
                    plugin_factories,
                    delegate,
                );
            }
        }

        sweep_registry(shared, delegate);
        delegate.loop_pass(&Server::handle_only(Arc::clone(shared)));
    }
}

fn initialise_connection(
    shared: &Arc<Shared>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    max_connections: Option<usize>,
    plugin_factories: &(dyn Fn() -> Vec<PluginProvider> + Send + Sync),
    delegate: &mut dyn ServerDelegate,
) {
    let at_limit = max_connections
        .is_some_and(|limit| shared.connections.lock().unwrap().len() >= limit);

    if at_limit {
        tracing::warn!(%peer_addr, "server: connection limit reached, rejecting");
        if let Err(err) = framer::raw_send(&socket, &[SC_CONLIMIT]) {
            tracing::warn!(error = %err, "server: failed to send connection-limit rejection");
        }
        let _ = socket.shutdown(std::net::Shutdown::Both);
        return;
    }

    let id = ConnId::new_random();
    let plugins = plugin_factories();
    let conn = Connection::with_id(id, StreamSource::AlreadyUp(socket), plugins);

    delegate.conn_init(id, &conn);
    let conn_delegate = delegate.connection_delegate(id, &conn);
    conn.start(conn_delegate);

    shared.connections.lock().unwrap().insert(id, conn);
    tracing::debug!(conn = %id, %peer_addr, "server: connection accepted");
}

fn sweep_registry(shared: &Arc<Shared>, delegate: &mut dyn ServerDelegate) {
    let dead: Vec<(ConnId, Connection)> = {
        let mut connections = shared.connections.lock().unwrap();
        let dead_ids: Vec<ConnId> =
            connections.iter().filter(|(_, c)| !c.is_alive()).map(|(id, _)| *id).collect();
        dead_ids.into_iter().filter_map(|id| connections.remove(&id).map(|c| (id, c))).collect()
    };

    for (id, conn) in dead {
        tracing::debug!(conn = %id, "server: connection reaped");
        delegate.conn_shutdown(id, &conn);
    }
}

fn shutdown_active_connections(shared: &Arc<Shared>) {
    let connections = shared.connections.lock().unwrap();
    for conn in connections.values() {
        conn.shutdown();
    }
}

fn close_listeners(shared: &Arc<Shared>) {
    shared.listeners.lock().unwrap().clear();
}

/// Creates a bound, listening IPv4 socket with `SO_REUSEADDR` set before
/// `bind()`, then hands it to `std::net::TcpListener`.
///
/// `std::net::TcpListener::bind` offers no way to set `SO_REUSEADDR`
/// before binding, so this drops to raw `libc` socket calls the same
/// way the rest of this crate reaches for `libc` over a socket-options
/// crate.
fn bind_reuseaddr(host: &str, port: u16) -> Result<TcpListener, ConfigError> {
    let addr = crate::host::resolve_ipv4(host, port)?;
    let SocketAddr::V4(addr_v4) = addr else {
        return Err(ConfigError::InvalidIpv4(host.to_string()));
    };

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io_to_config(host, io::Error::last_os_error()));
        }

        let on: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of_val(&on) as libc::socklen_t,
        );

        let sockaddr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: addr_v4.port().to_be(),
            sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr_v4.ip().octets()) },
            sin_zero: [0; 8],
        };

        let bind_rc = libc::bind(
            fd,
            &sockaddr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        if bind_rc != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(io_to_config(host, err));
        }

        if libc::listen(fd, 5) != 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(io_to_config(host, err));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

fn io_to_config(host: &str, err: io::Error) -> ConfigError {
    ConfigError::UnresolvableHost(format!("{host}: {err}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn rejects_empty_address_list() {
        let server = Server::new();
        let err = server.start(Box::new(NullDelegate)).unwrap_err();
        assert_eq!(err, ServerStartError::Config(ConfigError::NoAddresses));
    }

    #[test]
    fn add_addr_validates_port_and_ip() {
        assert!(Server::new().add_addr("127.0.0.1", 0).is_err());
        assert!(Server::new().add_addr("not-an-ip", 8899).is_err());
        assert!(Server::new().add_addr("127.0.0.1", 8899).is_ok());
    }

    #[test]
    fn starts_and_binds_an_ephemeral_listener() {
        let server = Server::new().add_addr("127.0.0.1", 0).unwrap();
        server.start(Box::new(NullDelegate)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.listen_addrs().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.listen_addrs().len(), 1);
        assert!(server.is_running());

        server.shutdown();
    }
}

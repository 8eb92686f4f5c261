//! Plugin pipeline applied end-to-end through real connections, and
//! ordering of multiple framed messages sent back-to-back on one
//! connection.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use frame_net::{
    client::Client,
    connection::{Connection, ConnectionDelegate, NullDelegate},
    plugin::{Plugin, PluginProvider},
    server::{Server, ServerDelegate},
};

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

/// Appends a tag byte on transmit, strips it on receive. Symmetric, so a
/// chain of these round-trips to the original payload.
struct Tag(u8);
impl Plugin for Tag {
    fn on_transmit(&self, mut payload: Vec<u8>) -> Vec<u8> {
        payload.push(self.0);
        payload
    }

    fn on_receive(&self, mut payload: Vec<u8>) -> Vec<u8> {
        payload.pop();
        payload
    }
}

struct Collector(Arc<Mutex<Vec<Vec<u8>>>>);
impl ConnectionDelegate for Collector {
    fn transmission_received(&mut self, _conn: &Connection, payload: Vec<u8>) {
        self.0.lock().unwrap().push(payload);
    }
}

struct FixedDelegate(Arc<Mutex<Vec<Vec<u8>>>>);
impl ServerDelegate for FixedDelegate {
    fn connection_delegate(
        &mut self,
        _id: frame_net::ConnId,
        _conn: &Connection,
    ) -> Box<dyn ConnectionDelegate> {
        Box::new(Collector(Arc::clone(&self.0)))
    }
}

#[test]
fn plugin_chain_round_trips_and_preserves_order() {
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

    let server = Server::new()
        .add_addr("127.0.0.1", 0)
        .unwrap()
        .with_plugins(|| vec![tag_plugin(1), tag_plugin(2)]);
    server.start(Box::new(FixedDelegate(Arc::clone(&received)))).unwrap();
    assert!(wait_until(|| !server.listen_addrs().is_empty(), Duration::from_secs(2)));
    let addr = server.listen_addrs()[0];

    let client = Client::new()
        .with_timeout(Some(Duration::from_secs(2)))
        .with_plugins(|| vec![tag_plugin(1), tag_plugin(2)]);
    let id = client.connect_to(addr.ip().to_string(), addr.port(), Box::new(NullDelegate));
    let conn = client.connection(id).unwrap();
    assert!(wait_until(|| conn.peer_addr().is_some(), Duration::from_secs(2)));

    let messages: [&[u8]; 3] = [b"first", b"second", b"third"];
    for msg in messages {
        conn.transmit(msg).unwrap();
    }

    assert!(wait_until(|| received.lock().unwrap().len() == messages.len(), Duration::from_secs(2)));

    let got = received.lock().unwrap();
    for (expected, actual) in messages.iter().zip(got.iter()) {
        assert_eq!(actual.as_slice(), *expected, "plugin chain must round-trip to the original bytes");
    }

    client.shutdown();
    server.shutdown();
}

fn tag_plugin(byte: u8) -> PluginProvider {
    Tag(byte).into()
}

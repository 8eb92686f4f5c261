//! S5: full handshake followed by a single framed message, driven
//! through real `Server`/`Client` instances on loopback.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use frame_net::{
    client::Client,
    connection::{Connection, ConnectionDelegate, NullDelegate},
    server::{Server, ServerDelegate},
};

struct Inbox(Arc<Mutex<Vec<Vec<u8>>>>);

impl ConnectionDelegate for Inbox {
    fn transmission_received(&mut self, _conn: &Connection, payload: Vec<u8>) {
        self.0.lock().unwrap().push(payload);
    }
}

struct AcceptOnce(Arc<Mutex<Vec<Vec<u8>>>>);

impl ServerDelegate for AcceptOnce {
    fn connection_delegate(
        &mut self,
        _id: frame_net::ConnId,
        _conn: &Connection,
    ) -> Box<dyn ConnectionDelegate> {
        Box::new(Inbox(Arc::clone(&self.0)))
    }
}

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

#[test]
fn client_message_reaches_server_inbox() {
    let received = Arc::new(Mutex::new(Vec::new()));

    let server = Server::new().add_addr("127.0.0.1", 0).unwrap();
    server.start(Box::new(AcceptOnce(Arc::clone(&received)))).unwrap();
    assert!(wait_until(|| !server.listen_addrs().is_empty(), Duration::from_secs(2)));
    let addr = server.listen_addrs()[0];

    let client = Client::new().with_timeout(Some(Duration::from_secs(2)));
    let id = client.connect_to(addr.ip().to_string(), addr.port(), Box::new(NullDelegate));
    let conn = client.connection(id).expect("connection registered");

    assert!(wait_until(|| conn.peer_addr().is_some(), Duration::from_secs(2)));
    conn.transmit(b"hello world").unwrap();

    assert!(wait_until(|| !received.lock().unwrap().is_empty(), Duration::from_secs(2)));
    assert_eq!(received.lock().unwrap()[0], b"hello world");

    client.shutdown();
    server.shutdown();
}

//! High-water-mark and half-close behavior, driven through a connection
//! whose socket has a shrunken send buffer so the first write comes up
//! short and the output buffer actually fills.

use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use riptide::{EventLoop, TcpConnection};
use socket2::Socket;

fn spawn_loop() -> (Arc<EventLoop>, Receiver<()>) {
    let (loop_tx, loop_rx) = crossbeam_channel::bounded(1);
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        loop_tx.send(event_loop.clone()).unwrap();
        event_loop.run();
        done_tx.send(()).unwrap();
    });
    (loop_rx.recv().unwrap(), done_rx)
}

/// A connected TCP pair; the server side is nonblocking with a small send
/// buffer, ready to wrap in a `TcpConnection`.
fn pair_with_small_sndbuf() -> (Socket, TcpStream, SocketAddr, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, peer) = listener.accept().unwrap();
    let local = server.local_addr().unwrap();
    let socket = Socket::from(server);
    socket.set_send_buffer_size(4096).unwrap();
    socket.set_nonblocking(true).unwrap();
    (socket, client, local, peer)
}

struct Wired {
    conn: Arc<TcpConnection>,
    states: Receiver<bool>,
    write_completes: Receiver<()>,
    high_water: Receiver<usize>,
}

fn establish(event_loop: &Arc<EventLoop>, socket: Socket, local: SocketAddr, peer: SocketAddr) -> Wired {
    let conn = TcpConnection::new(event_loop.clone(), "manual#1".to_string(), socket, local, peer);

    let (state_tx, states) = crossbeam_channel::unbounded();
    conn.set_connection_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
        state_tx.send(conn.connected()).unwrap();
    }));
    let (wc_tx, write_completes) = crossbeam_channel::unbounded();
    conn.set_write_complete_callback(Arc::new(move |_conn| {
        wc_tx.send(()).unwrap();
    }));
    let (hwm_tx, high_water) = crossbeam_channel::unbounded();
    conn.set_high_water_mark_callback(Arc::new(move |_conn, pending| {
        hwm_tx.send(pending).unwrap();
    }));

    let on_loop = conn.clone();
    event_loop.run_on_loop(move || on_loop.connect_established());

    let wired = Wired {
        conn,
        states,
        write_completes,
        high_water,
    };
    assert!(wired.states.recv_timeout(Duration::from_secs(5)).unwrap());
    wired
}

fn destroy(event_loop: &Arc<EventLoop>, conn: Arc<TcpConnection>, done: Receiver<()>) {
    event_loop.run_on_loop(move || conn.connect_destroyed());
    event_loop.quit();
    done.recv_timeout(Duration::from_secs(5)).unwrap();
}

#[test]
fn high_water_mark_fires_exactly_once_per_upward_crossing() {
    let (event_loop, done) = spawn_loop();
    let (socket, mut client, local, peer) = pair_with_small_sndbuf();
    let wired = establish(&event_loop, socket, local, peer);
    wired.conn.set_high_water_mark(1024);

    // The peer is not reading: the direct write comes up short and the
    // remainder lands in the output buffer, crossing the mark.
    let payload = vec![b'x'; 256 * 1024];
    wired.conn.send(&payload);
    let pending = wired
        .high_water
        .recv_timeout(Duration::from_secs(5))
        .unwrap();
    assert!(pending >= 1024, "crossing reported {pending} pending bytes");
    assert!(pending <= payload.len());

    // Still above the mark: more data must not re-fire the callback.
    wired.conn.send(&[b'y'; 128]);
    assert!(
        wired
            .high_water
            .recv_timeout(Duration::from_millis(300))
            .is_err(),
        "high-water callback fired without an upward crossing"
    );

    // Drain everything; the loop empties the output buffer and says so.
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut drained = vec![0u8; 256 * 1024 + 128];
    client.read_exact(&mut drained).unwrap();
    wired
        .write_completes
        .recv_timeout(Duration::from_secs(5))
        .unwrap();

    // Below the mark again: a small send that fully writes stays silent.
    wired.conn.send(b"tail");
    let mut tail = [0u8; 4];
    client.read_exact(&mut tail).unwrap();
    assert_eq!(&tail, b"tail");
    assert!(
        wired
            .high_water
            .recv_timeout(Duration::from_millis(300))
            .is_err()
    );

    destroy(&event_loop, wired.conn, done);
}

#[test]
fn shutdown_with_pending_output_closes_only_after_the_drain() {
    let (event_loop, done) = spawn_loop();
    let (socket, mut client, local, peer) = pair_with_small_sndbuf();
    let wired = establish(&event_loop, socket, local, peer);

    // Most of this sits in the output buffer when shutdown is requested, so
    // the half-close must wait for the drain path.
    let payload = vec![b'z'; 256 * 1024];
    wired.conn.send(&payload);
    wired.conn.shutdown();

    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut got = Vec::new();
    client.read_to_end(&mut got).unwrap();
    // EOF only after every pending byte: a premature close would truncate.
    assert_eq!(got.len(), payload.len());
    assert!(got.iter().all(|b| *b == b'z'));

    // Peer closes its side; the connection finishes the close path.
    drop(client);
    assert!(!wired.states.recv_timeout(Duration::from_secs(5)).unwrap());
    assert!(!wired.conn.connected());

    destroy(&event_loop, wired.conn, done);
}

//! A producer thread that is not the connection's loop thread hammers
//! `send`; the peer must observe every payload, in submission order.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use riptide::{EventLoop, TcpServer};

const MESSAGES: usize = 10_000;

fn expected_stream() -> Vec<u8> {
    let mut out = Vec::new();
    for i in 0..MESSAGES {
        out.extend_from_slice(format!("{i:06}").as_bytes());
    }
    out
}

#[test]
fn ten_thousand_cross_thread_sends_arrive_in_order() {
    let (handles_tx, handles_rx) = crossbeam_channel::bounded(1);
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);

    thread::spawn(move || {
        let base_loop = EventLoop::new().unwrap();
        let server = Arc::new(
            TcpServer::new(&base_loop, "127.0.0.1:0".parse().unwrap(), "producer", false)
                .unwrap(),
        );
        server.set_thread_num(1);
        server.set_connection_callback(|conn| {
            if conn.connected() {
                // Produce from a thread that has nothing to do with the
                // worker loop, so every send takes the marshaling path.
                let conn = conn.clone();
                thread::spawn(move || {
                    for i in 0..MESSAGES {
                        conn.send(format!("{i:06}").as_bytes());
                    }
                    conn.shutdown();
                });
            }
        });
        server.start().unwrap();

        handles_tx
            .send((base_loop.clone(), server.listen_addr().unwrap()))
            .unwrap();
        base_loop.run();
        drop(server);
        done_tx.send(()).unwrap();
    });

    let (base_loop, addr) = handles_rx.recv().unwrap();
    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();

    // The producer half-closes when it is done, so EOF bounds the read.
    let mut got = Vec::new();
    client.read_to_end(&mut got).unwrap();
    assert_eq!(got.len(), MESSAGES * 6);
    assert_eq!(got, expected_stream());

    drop(client);
    base_loop.quit();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
}

//! Partial writes must not livelock, later writes stay ordered behind
//! earlier ones, and futures complete in FIFO order once the peer drains.

mod common;

use std::io::Read;
use std::net::TcpListener;
use std::time::Duration;

use common::{wait_until, TraceHandler};
use sluice_io::{IoBuffer, ServiceConfig, TcpClient};

const BIG: usize = 32 * 1024 * 1024;

#[test]
fn write_futures_complete_in_fifo_order_after_the_peer_drains() {
    // raw peer that accepts but does not read until told to
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = TcpClient::new(ServiceConfig::default(), TraceHandler::new()).unwrap();
    let session = client.connect(addr).wait().expect("connect completes");
    let (mut peer, _) = listener.accept().unwrap();

    let big = session.write(IoBuffer::wrap(vec![0xAB; BIG]));
    // the socket cannot absorb this much: the future must still be pending
    std::thread::sleep(Duration::from_millis(300));
    assert!(!big.is_done(), "a {BIG}-byte write completed with no reader");

    // later writes are accepted and ordered after the big one
    let tail = session.write(IoBuffer::wrap(vec![0xCD; 3]));
    assert!(!tail.is_done());

    // drain everything on the peer side, tracking the stream's final bytes
    let mut remaining = BIG + 3;
    let mut sink = vec![0u8; 1 << 20];
    let mut tail_bytes = [0u8; 3];
    while remaining > 0 {
        let n = peer.read(&mut sink).unwrap();
        assert!(n > 0, "peer hit eof with {remaining} bytes still expected");
        if n >= 3 {
            tail_bytes.copy_from_slice(&sink[n - 3..n]);
        } else {
            tail_bytes.rotate_left(n);
            tail_bytes[3 - n..].copy_from_slice(&sink[..n]);
        }
        remaining -= n;
    }
    assert_eq!(tail_bytes, [0xCD, 0xCD, 0xCD]);

    assert!(tail.wait_for(Duration::from_secs(10)));
    // FIFO: the big write completed no later than the one behind it
    assert!(big.is_done());
    assert!(big.is_success());
    assert!(tail.is_success());

    assert!(wait_until(Duration::from_secs(5), || session
        .write_queue()
        .is_empty()));

    client.dispose();
}

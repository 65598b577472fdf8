//! End-to-end echo: bytes written by a raw client come back unchanged, and
//! the acceptor-side handler sees the canonical event order.

mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use common::{wait_until, TraceHandler};
use sluice_io::{ServiceConfig, TcpServer};

#[test]
fn echo_roundtrip_with_event_trace() {
    let handler = TraceHandler::echoing();
    let server = TcpServer::new(ServiceConfig::default(), handler.clone()).unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"hello").unwrap();

    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello");

    drop(client);
    assert!(
        wait_until(Duration::from_secs(5), || handler.trace() == "CROPRESECL"),
        "unexpected event trace: {}",
        handler.trace()
    );

    server.dispose();
}

#[test]
fn echo_survives_fragmented_input() {
    let handler = TraceHandler::echoing();
    let server = TcpServer::new(
        ServiceConfig::builder().read_buffer_size(1024).build(),
        handler.clone(),
    )
    .unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let payload = b"fragmentation-independence";
    for byte in payload {
        client.write_all(&[*byte]).unwrap();
        client.flush().unwrap();
    }

    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, payload);

    server.dispose();
}

#[test]
fn managed_sessions_tracks_lifecycles() {
    use sluice_io::IoService;

    let handler = TraceHandler::new();
    let server = TcpServer::new(ServiceConfig::default(), handler.clone()).unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = TcpStream::connect(addr).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        server.managed_sessions().len() == 1
    }));

    drop(client);
    assert!(wait_until(Duration::from_secs(5), || {
        server.managed_sessions().is_empty()
    }));
    assert!(wait_until(Duration::from_secs(5), || handler.trace()
        == "CROPCL"));

    server.dispose();
}

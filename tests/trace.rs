//! Connector/acceptor event traces for a one-byte exchange, and close
//! semantics on both sides.

mod common;

use std::time::Duration;

use common::{wait_until, TraceHandler};
use sluice_io::{IoBuffer, ServiceConfig, TcpClient, TcpServer};

/// A client opens a connection, writes one byte, closes. The acceptor side
/// sees created, opened, received, closed; the connector side sees created,
/// opened, sent, closed.
#[test]
fn one_byte_exchange_traces() {
    let acceptor_handler = TraceHandler::new();
    let connector_handler = TraceHandler::new();

    let server = TcpServer::new(ServiceConfig::default(), acceptor_handler.clone()).unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = TcpClient::new(ServiceConfig::default(), connector_handler.clone()).unwrap();
    let connect = client.connect(addr);
    let session = connect.wait().expect("connect completes");

    session.write(IoBuffer::wrap(vec![0x2A])).wait().unwrap();

    session.close(true);
    assert!(session.close_future().wait_for(Duration::from_secs(5)));
    assert!(session.close_future().is_success());

    assert!(
        wait_until(Duration::from_secs(5), || connector_handler.trace()
            == "CROPSECL"),
        "connector trace: {}",
        connector_handler.trace()
    );
    assert!(
        wait_until(Duration::from_secs(5), || acceptor_handler.trace()
            == "CROPRECL"),
        "acceptor trace: {}",
        acceptor_handler.trace()
    );

    client.dispose();
    server.dispose();
}

#[test]
fn graceful_close_drains_pending_writes_first() {
    let acceptor_handler = TraceHandler::new();
    let connector_handler = TraceHandler::new();

    let server = TcpServer::new(ServiceConfig::default(), acceptor_handler.clone()).unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = TcpClient::new(ServiceConfig::default(), connector_handler.clone()).unwrap();
    let session = client.connect(addr).wait().expect("connect completes");

    let write = session.write(IoBuffer::wrap(vec![1, 2, 3]));
    let close = session.close(false);
    assert!(close.wait_for(Duration::from_secs(5)));
    // the write drained before the session went down
    assert!(write.is_done());
    assert!(write.is_success());

    assert!(
        wait_until(Duration::from_secs(5), || acceptor_handler.count("RE") == 1),
        "acceptor trace: {}",
        acceptor_handler.trace()
    );

    client.dispose();
    server.dispose();
}

#[test]
fn repeated_close_returns_the_same_future() {
    let server = TcpServer::new(ServiceConfig::default(), TraceHandler::new()).unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = TcpClient::new(ServiceConfig::default(), TraceHandler::new()).unwrap();
    let session = client.connect(addr).wait().expect("connect completes");

    let first = session.close(false);
    let second = session.close(false);
    assert!(first.same_as(&second));
    assert!(first.wait_for(Duration::from_secs(5)));

    client.dispose();
    server.dispose();
}

#[test]
fn write_after_close_fails_the_future() {
    let server = TcpServer::new(ServiceConfig::default(), TraceHandler::new()).unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = TcpClient::new(ServiceConfig::default(), TraceHandler::new()).unwrap();
    let session = client.connect(addr).wait().expect("connect completes");

    session.close(true);
    let rejected = session.write(IoBuffer::wrap(vec![9]));
    assert!(rejected.is_done());
    assert!(!rejected.is_success());
    assert!(rejected.cause().is_some());

    client.dispose();
    server.dispose();
}

//! A handler raising an I/O classed failure gets `exception_caught` followed
//! by `session_closed`, each exactly once.

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use common::{wait_until, TraceHandler};
use sluice_io::{ServiceConfig, TcpServer};

#[test]
fn io_failure_in_handler_closes_the_session_once() {
    let handler = TraceHandler::failing();
    let server = TcpServer::new(ServiceConfig::default(), handler.clone()).unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"boom").unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || handler.trace() == "CROPREECCL"),
        "trace: {}",
        handler.trace()
    );
    assert_eq!(handler.count("EC"), 1);
    assert_eq!(handler.count("CL"), 1);

    server.dispose();
}

#[test]
fn unbind_is_idempotent_and_releases_the_address() {
    let server = TcpServer::new(ServiceConfig::default(), TraceHandler::new()).unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    server.unbind(&addr);
    // second unbind of the same address is a no-op
    server.unbind(&addr);
    assert!(server.bound_addresses().is_empty());

    // the port is actually released: wait until a fresh bind succeeds
    assert!(wait_until(Duration::from_secs(5), || {
        match TcpStream::connect(addr) {
            Ok(_) => false, // something still accepts; keep waiting
            Err(_) => true,
        }
    }));

    server.dispose();
}

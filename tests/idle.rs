//! Reader-idle fires exactly once per quiet period and never closes the
//! session by itself.

mod common;

use std::net::TcpStream;
use std::time::Duration;

use common::{wait_until, TraceHandler};
use sluice_io::{IdleStatus, IoService, ServiceConfig, TcpServer};

#[test]
fn reader_idle_fires_once_and_leaves_the_session_open() {
    let handler = TraceHandler::new();
    let config = ServiceConfig::builder()
        .idle_time(IdleStatus::ReaderIdle, Duration::from_millis(300))
        .build();
    let server = TcpServer::new(config, handler.clone()).unwrap();
    let addr = server.bind("127.0.0.1:0".parse().unwrap()).unwrap();

    let client = TcpStream::connect(addr).unwrap();
    assert!(wait_until(Duration::from_secs(5), || handler.count("OP") == 1));

    // stay quiet past the threshold; the 1s select timeout bounds detection
    assert!(
        wait_until(Duration::from_secs(5), || handler.count("ID") == 1),
        "trace: {}",
        handler.trace()
    );

    // still quiet: no second event, no close
    std::thread::sleep(Duration::from_millis(1500));
    assert_eq!(handler.count("ID"), 1, "trace: {}", handler.trace());
    assert_eq!(handler.count("CL"), 0, "trace: {}", handler.trace());
    assert_eq!(server.managed_sessions().len(), 1);

    drop(client);
    assert!(wait_until(Duration::from_secs(5), || handler.count("CL") == 1));

    server.dispose();
}

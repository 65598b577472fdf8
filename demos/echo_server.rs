use std::sync::Arc;
use std::time::Duration;

use sluice_io::{
    IoBuffer, IoHandler, IoSession, LoggingFilter, Message, Result, ServiceConfig, TcpServer,
};
use sluice_io::{IoFilter, IoService};

/// a simple handler that echoes data back to the client.
#[derive(Clone, Default)]
struct EchoHandler;

/// implement the `IoHandler` trait to define application logic.
impl IoHandler for EchoHandler {
    /// called when a new client connects.
    fn session_opened(&self, session: &Arc<IoSession>) -> Result<()> {
        println!(
            "[INFO] new client connected: session {} from {}",
            session.id(),
            session.remote_addr()
        );
        Ok(())
    }

    /// called when data is received from a client.
    fn message_received(&self, session: &Arc<IoSession>, message: Message) -> Result<()> {
        if let Ok(buffer) = message.downcast::<IoBuffer>() {
            let text = String::from_utf8_lossy(buffer.remaining_slice()).into_owned();
            println!(
                "[INFO] received {} bytes from session {}: {}",
                buffer.remaining(),
                session.id(),
                text.trim_end()
            );

            // echo the received data back to the sender.
            session.write(*buffer);
        }
        Ok(())
    }

    /// called when a client disconnects.
    fn session_closed(&self, session: &Arc<IoSession>) -> Result<()> {
        println!("[INFO] client disconnected: session {}", session.id());
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();

    // configure the service.
    let config = ServiceConfig::builder().read_buffer_size(8192).build();

    // create the tcp server with our handler.
    let server = TcpServer::new(config, EchoHandler)?;

    // a logging filter in front of the handler traces every event.
    server.set_filters(vec![Arc::new(LoggingFilter) as Arc<dyn IoFilter>]);

    // bind. this starts the selector workers and begins accepting.
    let addr = server.bind("127.0.0.1:8080".parse().unwrap())?;
    println!("[INFO] echo server listening on {addr}");

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}

//! Reactive, non-blocking TCP I/O framework.
//!
//! A small set of selector loops multiplexes many connections onto dedicated
//! worker threads; a bidirectional filter chain routes events between raw
//! socket bytes and application messages; and a decoding-state substrate
//! lets protocol authors assemble incremental parsers that tolerate any
//! fragmentation of the byte stream.

use std::any::Any;

pub mod buffer;
pub mod error;
pub mod filter;
pub mod future;
pub mod handler;
pub mod service;
pub mod session;
pub mod transport;

/// Currency of the pipeline: a type-erased application message.
pub type Message = Box<dyn Any + Send + Sync>;

pub use buffer::IoBuffer;
pub use error::{Error, Result};
pub use filter::codec::statemachine::{
    ConsumeToTerminatorDecodingState, DecodingState, DecodingStateMachine,
    FixedLengthDecodingState, NextState, SingleByteDecodingState, StateMachineDriver,
    StateMachineProtocolDecoder, U16BeDecodingState, U32BeDecodingState, U64BeDecodingState,
};
pub use filter::codec::{
    DecoderOutput, EncoderOutput, ProtocolCodecFilter, ProtocolDecoder, ProtocolEncoder,
};
pub use filter::{FilterChain, IoFilter, LoggingFilter, NextFilter};
pub use future::{CloseFuture, ConnectFuture, IoFuture, WriteFuture};
pub use handler::IoHandler;
pub use service::{IoService, IoServiceListener};
pub use session::write_queue::{WriteQueue, WriteRequest};
pub use session::{AttributeKey, IdleStatus, IoSession};
pub use transport::client::TcpClient;
pub use transport::config::{ServiceConfig, ServiceConfigBuilder};
pub use transport::processor::SelectorProcessor;
pub use transport::server::TcpServer;
pub use transport::strategy::{RoundRobinStrategy, SelectorStrategy};

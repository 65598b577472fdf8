//! TCP transport: selector processors, sharding strategy and the server /
//! client services built on them.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────┐          ┌─────────────────┐              │
//! │  │ TcpServer/   │────────▶│ Your Handler    │              │
//! │  │ TcpClient    │          │ (IoHandler)     │              │
//! │  └──────────────┘          └─────────────────┘              │
//! └────────────┬──────────────────────┬─────────────────────────┘
//!              │ bind / connect       │ Callbacks
//!              │                      │ (opened, message_received, ...)
//!              ▼                      │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SelectorProcessors (xN)                  │
//! │  ┌──────────┐      ┌──────────────┐      ┌──────────────┐   │
//! │  │ Selector │────▶│ Intake       │────▶│ Worker       │   │
//! │  │ (Poll)   │      │ Queues (x5)  │      │ Thread       │   │
//! │  └──────────┘      └──────────────┘      └──────┬───────┘   │
//! │                                                 │           │
//! │                        sessions ─── filter chain┘           │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ OS readiness events
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Operating System (epoll/kqueue)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each processor runs one worker thread blocked on its selector. Readiness
//! events (accept, read, write) are handled on that thread, which is the only
//! mutator of selection keys and per-session I/O state. Public operations
//! from other threads land in the processor's intake queues and take effect
//! at the top of its next loop pass.

pub mod client;
pub mod config;
pub mod processor;
pub mod server;
pub mod strategy;

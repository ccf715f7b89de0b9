//! framed-rpc: a minimal RPC service over length-prefixed JSON frames.
//!
//! Requests and responses travel over TCP as a native-endian `u32` length
//! followed by a UTF-8 JSON body. The same wire format and dispatch table
//! are served by interchangeable concurrency runtimes:
//! - thread per connection
//! - process per connection
//! - pre-forked worker pool
//! - single-process mio event loop (optionally pre-forked)

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod runtime;

pub use error::{Result, RpcError};

//! Sequential baseline.
//!
//! Serves one connection at a time on the accepting thread. While a client
//! stays connected every other client waits in the backlog, so this exists
//! only as a point of comparison for the concurrent runtimes.

use std::io;
use std::net::TcpListener;
use std::sync::Arc;

use super::{accept_or_pause, Strategy};
use crate::connection::{handle_connection, Service};

pub struct Sequential;

impl Strategy for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn serve(&self, listener: TcpListener, service: Arc<Service>) -> io::Result<()> {
        loop {
            if let Some((stream, peer)) = accept_or_pause(&listener) {
                handle_connection(stream, peer, &service);
            }
        }
    }
}

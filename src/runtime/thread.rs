//! Thread-per-connection runtime.
//!
//! The accepting thread spawns one OS thread per connection. Threads share
//! the `Service` through an `Arc`; nothing in it is mutated after startup,
//! so no locking is involved. Thread count is bounded only by the host.

use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error};

use super::{accept_or_pause, Strategy};
use crate::connection::{handle_connection, Service};

pub struct ThreadPerConnection;

impl Strategy for ThreadPerConnection {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn serve(&self, listener: TcpListener, service: Arc<Service>) -> io::Result<()> {
        loop {
            let Some((stream, peer)) = accept_or_pause(&listener) else {
                continue;
            };

            let service = Arc::clone(&service);
            let spawned = thread::Builder::new()
                .name(format!("conn-{peer}"))
                .spawn(move || handle_connection(stream, peer, &service));

            match spawned {
                // Detached: the thread owns the connection until it ends.
                Ok(_) => debug!(peer = %peer, "Spawned connection thread"),
                // The closure, and the stream inside it, were dropped.
                Err(e) => error!(
                    peer = %peer,
                    error = %e,
                    "Failed to spawn thread, connection dropped"
                ),
            }
        }
    }
}

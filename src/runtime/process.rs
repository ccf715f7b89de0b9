//! Process-per-connection runtime.
//!
//! Each accepted connection gets a forked child. The child closes its copy
//! of the listening socket, serves the connection and exits; the parent
//! closes its copy of the connection and goes back to accept(). Both
//! closes happen by moving the handle out of scope in its branch, so no
//! branch can keep a descriptor it does not own.

use std::io;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::fork::{self, Fork};
use super::{accept_or_pause, Strategy};
use crate::connection::{handle_connection, Service};

/// Fork attempts per connection before it is dropped.
const FORK_ATTEMPTS: usize = 3;

pub struct ProcessPerConnection {
    pub fork_backoff: Duration,
}

impl Strategy for ProcessPerConnection {
    fn name(&self) -> &'static str {
        "process"
    }

    fn serve(&self, listener: TcpListener, service: Arc<Service>) -> io::Result<()> {
        loop {
            let Some((stream, peer)) = accept_or_pause(&listener) else {
                continue;
            };

            let reaped = fork::reap_exited();
            if reaped > 0 {
                debug!(reaped, "Reaped connection processes");
            }

            match fork::fork_with_backoff(FORK_ATTEMPTS, self.fork_backoff) {
                Ok(Fork::Child) => {
                    drop(listener);
                    handle_connection(stream, peer, &service);
                    fork::exit_child(0);
                }
                Ok(Fork::Parent { child }) => {
                    debug!(peer = %peer, child, "Forked connection process");
                    drop(stream);
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Dropping connection after fork failures");
                    drop(stream);
                }
            }
        }
    }
}

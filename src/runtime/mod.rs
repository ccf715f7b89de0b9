//! Concurrency runtimes.
//!
//! Every runtime accepts connections from one bound listener and drives
//! each through the shared connection handler. They differ only in the
//! unit of concurrency:
//! - `thread`: one OS thread per connection
//! - `process`: one forked process per connection
//! - `prefork`: fixed pool of forked workers racing on accept()
//! - `event`: one mio event loop multiplexing every connection
//! - `sequential`: no concurrency, baseline only

pub mod event;
pub mod fork;
pub mod listener;
pub mod prefork;
pub mod process;
pub mod sequential;
pub mod thread;

pub use event::EventLoop;
pub use prefork::{Prefork, Worker, WorkerPool};
pub use process::ProcessPerConnection;
pub use sequential::Sequential;
pub use thread::ThreadPerConnection;

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, StrategyKind};
use crate::connection::Service;
use crate::dispatch::DispatchTable;

/// Pause after a failed accept() before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// A way of accepting connections and serving each one.
pub trait Strategy {
    fn name(&self) -> &'static str;

    /// Serve `listener` forever. Returns only on an unrecoverable error.
    fn serve(&self, listener: TcpListener, service: Arc<Service>) -> io::Result<()>;
}

/// Build the runtime selected by `config`.
pub fn strategy_for(config: &Config) -> Box<dyn Strategy> {
    let event_loop = EventLoop {
        max_connections: config.max_connections,
    };

    match config.strategy {
        StrategyKind::Thread => Box::new(ThreadPerConnection),
        StrategyKind::Process => Box::new(ProcessPerConnection {
            fork_backoff: config.fork_backoff,
        }),
        StrategyKind::Prefork => Box::new(Prefork {
            size: config.workers,
            fork_backoff: config.fork_backoff,
            worker: Worker::Blocking,
        }),
        StrategyKind::Event if config.event_workers > 1 => Box::new(Prefork {
            size: config.event_workers,
            fork_backoff: config.fork_backoff,
            worker: Worker::Event(event_loop),
        }),
        StrategyKind::Event => Box::new(event_loop),
        StrategyKind::Sequential => Box::new(Sequential),
    }
}

/// Bind the configured address and serve it with the configured runtime.
pub fn run(config: Config) -> io::Result<()> {
    let service = Arc::new(Service::new(DispatchTable::standard(), &config));
    let strategy = strategy_for(&config);
    let listener = listener::bind(config.addr, config.backlog)?;

    info!(
        addr = %listener.local_addr()?,
        strategy = strategy.name(),
        operations = ?service.table.operations(),
        "Listening"
    );

    strategy.serve(listener, service)
}

/// Accept one connection. Errors are logged and paced, never propagated:
/// running out of descriptors must not stop the server.
fn accept_or_pause(listener: &TcpListener) -> Option<(TcpStream, SocketAddr)> {
    match listener.accept() {
        Ok(pair) => Some(pair),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => None,
        Err(e) => {
            warn!(error = %e, "Accept failed");
            std::thread::sleep(ACCEPT_BACKOFF);
            None
        }
    }
}

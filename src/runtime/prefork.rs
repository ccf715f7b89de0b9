//! Pre-forked worker pool.
//!
//! A fixed number of workers is forked before the first connection
//! arrives. Each inherits the one bound listening socket and blocks in
//! accept() on it; the kernel hands every connection to exactly one of
//! them. At most `size` connections are served at once, the rest wait in
//! the listen backlog.
//!
//! The parent never accepts. It waits on its workers and forks a
//! replacement into the slot of any worker that exits, so the pool keeps
//! its configured size for the life of the server.

use std::io;
use std::net::TcpListener;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use super::event::EventLoop;
use super::fork::{self, Fork};
use super::{accept_or_pause, Strategy};
use crate::connection::{handle_connection, Service};

/// What each worker runs once forked.
#[derive(Debug, Clone, Copy)]
pub enum Worker {
    /// Accept, serve one connection to completion, repeat.
    Blocking,
    /// Run an event loop over the shared listener.
    Event(EventLoop),
}

pub struct Prefork {
    pub size: usize,
    pub fork_backoff: Duration,
    pub worker: Worker,
}

impl Strategy for Prefork {
    fn name(&self) -> &'static str {
        match self.worker {
            Worker::Blocking => "prefork",
            Worker::Event(_) => "prefork-event",
        }
    }

    fn serve(&self, listener: TcpListener, service: Arc<Service>) -> io::Result<()> {
        let mut pool = WorkerPool::new(self.size);

        for slot in 0..self.size {
            self.spawn(&mut pool, slot, &listener, &service);
        }
        info!(workers = self.size, "Worker pool started");

        loop {
            let (pid, status) = fork::wait_any()?;
            match pool.release(pid) {
                Some(slot) => {
                    warn!(worker = slot, pid, ?status, "Worker exited, replacing");
                    self.spawn(&mut pool, slot, &listener, &service);
                }
                None => warn!(pid, ?status, "Reaped unknown child"),
            }
        }
    }
}

impl Prefork {
    /// Fork a worker into `slot`. Retries with backoff until a fork succeeds;
    /// only the parent returns.
    fn spawn(&self, pool: &mut WorkerPool, slot: usize, listener: &TcpListener, service: &Service) {
        loop {
            match fork::fork() {
                Ok(Fork::Child) => {
                    let code = self.run_worker(slot, listener, service);
                    fork::exit_child(code);
                }
                Ok(Fork::Parent { child }) => {
                    pool.assign(slot, child);
                    return;
                }
                Err(e) => {
                    error!(worker = slot, error = %e, "Fork failed, resource exhaustion; retrying");
                    thread::sleep(self.fork_backoff);
                }
            }
        }
    }

    fn run_worker(&self, slot: usize, listener: &TcpListener, service: &Service) -> i32 {
        info!(worker = slot, pid = process::id(), "Worker started");

        match self.worker {
            Worker::Blocking => loop {
                if let Some((stream, peer)) = accept_or_pause(listener) {
                    handle_connection(stream, peer, service);
                }
            },
            Worker::Event(event_loop) => {
                let result = listener
                    .try_clone()
                    .and_then(|owned| event_loop.run(owned, service));
                match result {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(worker = slot, error = %e, "Event loop failed");
                        1
                    }
                }
            }
        }
    }
}

/// Fixed-size table of live worker processes, indexed by slot.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<Option<libc::pid_t>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size],
        }
    }

    pub fn assign(&mut self, slot: usize, pid: libc::pid_t) {
        self.slots[slot] = Some(pid);
    }

    /// Clear the slot held by `pid`, returning its index.
    pub fn release(&mut self, pid: libc::pid_t) -> Option<usize> {
        let slot = self.slots.iter().position(|s| *s == Some(pid))?;
        self.slots[slot] = None;
        Some(slot)
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

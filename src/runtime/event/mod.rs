//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread serves every connection. Per-connection progress lives in
//! an explicit [`Connection`] state machine instead of a stack: inbound
//! bytes wait in its reassembly buffer, outbound responses in its write
//! queue. Frames from one connection are dispatched in arrival order; a
//! connection whose peer reads slowly only grows its own queue.

mod connection;

pub use connection::{ConnState, Connection, ConnectionRegistry};

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Strategy, ACCEPT_BACKOFF};
use crate::connection::Service;
use crate::dispatch::RequestContext;
use crate::error::{Result, RpcError};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Events drained per poll call.
const EVENT_CAPACITY: usize = 1024;

/// Upper bound on how long idle connections outlive their timeout.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Single-threaded, readiness-driven server.
#[derive(Debug, Clone, Copy)]
pub struct EventLoop {
    pub max_connections: usize,
}

/// What a handled event left the connection as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Open,
    Finished,
}

impl Strategy for EventLoop {
    fn name(&self) -> &'static str {
        "event"
    }

    fn serve(&self, listener: StdTcpListener, service: Arc<Service>) -> io::Result<()> {
        self.run(listener, &service)
    }
}

impl EventLoop {
    /// Serve `listener` until a poll error.
    pub fn run(&self, listener: StdTcpListener, service: &Service) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);

        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut connections = ConnectionRegistry::new(self.max_connections);
        // Set while the backlog still holds connections a failed accept left behind.
        let mut retry_accept: Option<Instant> = None;

        info!(
            pid = process::id(),
            max_connections = self.max_connections,
            read_chunk = service.read_chunk,
            "Event loop started"
        );

        loop {
            let timeout = poll_timeout(service.idle_timeout, retry_accept);
            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let mut listener_ready = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => listener_ready = true,
                    Token(conn_id) => {
                        let progress = handle_connection_event(
                            conn_id,
                            event,
                            &poll,
                            &mut connections,
                            service,
                        );
                        match progress {
                            Ok(Progress::Open) => {}
                            Ok(Progress::Finished) => {
                                close_connection(&poll, &mut connections, conn_id);
                            }
                            Err(e) => {
                                warn!(conn_id, kind = e.kind(), error = %e, "Connection error");
                                close_connection(&poll, &mut connections, conn_id);
                            }
                        }
                    }
                }
            }

            // Closed connections above may have released the descriptors a
            // failed accept was short of.
            let retry_due = retry_accept.is_some_and(|at| Instant::now() >= at);
            if listener_ready || retry_due {
                retry_accept = accept_connections(&listener, &poll, &mut connections, service)
                    .then(|| Instant::now() + ACCEPT_BACKOFF);
            }

            if let Some(idle) = service.idle_timeout {
                sweep_idle(&poll, &mut connections, idle);
            }
        }
    }
}

/// How long the next poll may block: until the next idle sweep or the
/// next accept retry, whichever comes first.
fn poll_timeout(idle: Option<Duration>, retry_accept: Option<Instant>) -> Option<Duration> {
    let sweep = idle.map(|idle| idle.min(SWEEP_INTERVAL));
    let retry = retry_accept.map(|at| at.saturating_duration_since(Instant::now()));

    match (sweep, retry) {
        (Some(sweep), Some(retry)) => Some(sweep.min(retry)),
        (sweep, retry) => sweep.or(retry),
    }
}

/// Accept until the backlog is drained.
///
/// Returns true when an accept error (EMFILE, ENFILE, ...) cut the drain
/// short. The listener is edge-triggered, so connections still queued
/// will not raise another event and the caller has to retry.
fn accept_connections(
    listener: &TcpListener,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    service: &Service,
) -> bool {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                admit(poll, connections, stream, peer, service);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(error = %e, "Accept failed");
                return true;
            }
        }
    }
}

/// Track and register a freshly accepted stream.
///
/// A stream that cannot be tracked is dropped, which closes it; nothing
/// here ends the loop.
fn admit(
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    stream: TcpStream,
    peer: SocketAddr,
    service: &Service,
) -> Option<usize> {
    let conn = Connection::new(stream, peer, service.reassembly_buffer());
    let conn_id = match connections.insert(conn) {
        Ok(id) => id,
        Err(_rejected) => {
            warn!(peer = %peer, "Connection limit reached");
            return None;
        }
    };

    // Re-borrow after insert
    let conn = connections.get_mut(conn_id)?;
    if let Err(e) = conn.stream.set_nodelay(true) {
        debug!(conn_id, error = %e, "Failed to set TCP_NODELAY");
    }
    if let Err(e) = poll
        .registry()
        .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
    {
        warn!(conn_id, peer = %peer, error = %e, "Failed to register connection");
        connections.remove(conn_id);
        return None;
    }

    debug!(conn_id, peer = %peer, "Accepted connection");
    Some(conn_id)
}

fn handle_connection_event(
    conn_id: usize,
    event: &Event,
    poll: &Poll,
    connections: &mut ConnectionRegistry,
    service: &Service,
) -> Result<Progress> {
    let Some(conn) = connections.get_mut(conn_id) else {
        return Ok(Progress::Open);
    };

    if (event.is_readable() || event.is_read_closed()) && !conn.is_closing() {
        if let Err(e) = handle_readable(conn, event.is_read_closed(), service) {
            // Answers to frames ahead of the bad one still go out if they fit.
            let _ = Connection::flush(&mut conn.outbound, &mut conn.stream);
            return Err(e);
        }
    }

    if !Connection::flush(&mut conn.outbound, &mut conn.stream)? {
        if !conn.write_interest {
            poll.registry().reregister(
                &mut conn.stream,
                Token(conn_id),
                Interest::READABLE | Interest::WRITABLE,
            )?;
            conn.write_interest = true;
        }
        return Ok(Progress::Open);
    }

    if conn.is_closing() {
        return Ok(Progress::Finished);
    }

    if conn.write_interest {
        poll.registry()
            .reregister(&mut conn.stream, Token(conn_id), Interest::READABLE)?;
        conn.write_interest = false;
    }

    Ok(Progress::Open)
}

/// Drain the socket into the reassembly buffer and dispatch every frame
/// it yields, queueing responses for write.
///
/// Reading stops when a read comes back short, meaning the kernel buffer
/// is empty for now, unless the peer has already shut down its side, in
/// which case reading continues until end of stream.
fn handle_readable(conn: &mut Connection, read_closed: bool, service: &Service) -> Result<()> {
    let chunk = service.read_chunk;
    let mut eof = false;

    loop {
        match conn.inbound.read_from(&mut conn.stream, chunk) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) if n < chunk && !read_closed => break,
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(RpcError::Io(e)),
        }
    }
    conn.last_read = Instant::now();

    conn.start_dispatching();
    let ctx = RequestContext { peer: conn.peer };
    while let Some(frame) = conn.inbound.next_frame()? {
        service.handle_frame(&ctx, &frame, &mut conn.outbound)?;
    }
    conn.resume_reading();

    if eof {
        conn.inbound.finish()?;
        debug!(peer = %conn.peer, queued = conn.outbound.len(), "Peer closed");
        conn.close();
    }

    Ok(())
}

fn sweep_idle(poll: &Poll, connections: &mut ConnectionRegistry, idle: Duration) {
    let Some(cutoff) = Instant::now().checked_sub(idle) else {
        return;
    };

    for conn_id in connections.idle_since(cutoff) {
        debug!(conn_id, "Connection idle timeout");
        close_connection(poll, connections, conn_id);
    }
}

fn close_connection(poll: &Poll, connections: &mut ConnectionRegistry, conn_id: usize) {
    if let Some(mut conn) = connections.remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        debug!(conn_id, peer = %conn.peer, "Connection closed");
    }
}

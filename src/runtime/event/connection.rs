//! Connection state machine for the event loop.
//!
//! Each connection owns its socket, a reassembly buffer for inbound bytes
//! and a queue of encoded responses not yet accepted by the kernel.

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use slab::Slab;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Instant;

use crate::protocol::{ReadState, ReassemblyBuffer};

/// Current phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the rest of a 4-byte length prefix.
    AwaitingHeader,
    /// Prefix read, waiting for `missing` body bytes.
    AwaitingBody { missing: usize },
    /// Running handlers for the frames just reassembled.
    Dispatching,
    /// Peer finished sending; flush queued responses, then close.
    Closing,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    pub inbound: ReassemblyBuffer,
    pub outbound: BytesMut,
    pub last_read: Instant,
    /// WRITABLE interest currently registered.
    pub write_interest: bool,
}

impl Connection {
    /// Create a new connection waiting for its first header.
    pub fn new(stream: TcpStream, peer: SocketAddr, inbound: ReassemblyBuffer) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::AwaitingHeader,
            inbound,
            outbound: BytesMut::new(),
            last_read: Instant::now(),
            write_interest: false,
        }
    }

    /// Transition to dispatching.
    pub fn start_dispatching(&mut self) {
        self.state = ConnState::Dispatching;
    }

    /// Return to reading; the phase follows what the buffer is waiting for.
    pub fn resume_reading(&mut self) {
        self.state = match self.inbound.state() {
            ReadState::AwaitingBody { missing, .. } => ConnState::AwaitingBody { missing },
            ReadState::AwaitingHeader | ReadState::FrameReady => ConnState::AwaitingHeader,
        };
    }

    /// Mark connection for closing once the outbound queue drains.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnState::Closing
    }

    /// Write queued bytes until the queue empties or the socket would block.
    ///
    /// Returns true once everything queued has been written.
    pub fn flush<W: Write>(outbound: &mut BytesMut, writer: &mut W) -> io::Result<bool> {
        while !outbound.is_empty() {
            match writer.write(&outbound[..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Hands the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of connections with no inbound bytes since `cutoff`.
    pub fn idle_since(&self, cutoff: Instant) -> Vec<usize> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.last_read < cutoff)
            .map(|(id, _)| id)
            .collect()
    }
}

//! Connection handler: drives one connection's request/response cycle.
//!
//! The synchronous runtimes call [`serve_stream`] on a blocking socket and
//! return when the peer hangs up. The event loop feeds frames to
//! [`Service::handle_frame`] itself as its reassembly buffer yields them.

use bytes::BytesMut;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::dispatch::{DispatchTable, RequestContext};
use crate::error::{Result, RpcError};
use crate::protocol::{encode_into, Frame, ReassemblyBuffer, Request};

/// Everything a connection needs, built once before serving begins.
#[derive(Debug)]
pub struct Service {
    pub table: DispatchTable,
    pub max_frame_size: u32,
    pub read_chunk: usize,
    pub idle_timeout: Option<Duration>,
}

impl Service {
    pub fn new(table: DispatchTable, config: &Config) -> Self {
        Self {
            table,
            max_frame_size: config.max_frame_size,
            read_chunk: config.read_chunk,
            idle_timeout: config.idle_timeout,
        }
    }

    /// Decode one request frame, dispatch it and append the encoded
    /// response to `out`.
    pub fn handle_frame(
        &self,
        ctx: &RequestContext,
        frame: &Frame,
        out: &mut BytesMut,
    ) -> Result<()> {
        let request: Request = frame.decode()?;
        trace!(peer = %ctx.peer, op = %request.operation, params = %request.params, "Request");

        let handler = self.table.lookup(&request.operation)?;
        let response = handler(ctx, request.params);
        encode_into(&response, out)
    }

    /// Fresh reassembly buffer sized for this service.
    pub fn reassembly_buffer(&self) -> ReassemblyBuffer {
        ReassemblyBuffer::new(self.max_frame_size)
    }
}

/// Serve requests on a blocking stream until the peer closes it.
///
/// Returns the number of requests answered. Any error ends the
/// connection; responses already produced have been written.
pub fn serve_stream<S: Read + Write>(
    stream: &mut S,
    peer: SocketAddr,
    service: &Service,
) -> Result<u64> {
    let ctx = RequestContext { peer };
    let mut buffer = service.reassembly_buffer();
    let mut out = BytesMut::new();
    let mut answered = 0u64;

    loop {
        while let Some(frame) = buffer.next_frame()? {
            service.handle_frame(&ctx, &frame, &mut out)?;
            stream.write_all(&out)?;
            out.clear();
            answered += 1;
        }

        match buffer.read_from(stream, service.read_chunk) {
            Ok(0) => {
                buffer.finish()?;
                return Ok(answered);
            }
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Serve an accepted TCP connection to completion and log how it ended.
///
/// The stream is dropped (closed) on return.
pub fn handle_connection(mut stream: TcpStream, peer: SocketAddr, service: &Service) {
    debug!(peer = %peer, pid = std::process::id(), "Connection opened");

    if let Err(e) = prepare_stream(&stream, service) {
        warn!(peer = %peer, error = %e, "Failed to configure connection");
        return;
    }

    match serve_stream(&mut stream, peer, service) {
        Ok(requests) => debug!(peer = %peer, requests, "Connection closed by peer"),
        Err(RpcError::Io(ref e)) if is_timeout(e) => {
            debug!(peer = %peer, "Connection idle timeout")
        }
        Err(e) => warn!(peer = %peer, kind = e.kind(), error = %e, "Connection error"),
    }
}

fn prepare_stream(stream: &TcpStream, service: &Service) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(service.idle_timeout)?;
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

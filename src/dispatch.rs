//! Operation dispatch.
//!
//! The table is assembled once at startup, then frozen. Every runtime
//! shares the same instance: threads through an `Arc`, forked processes
//! through their inherited copy of the address space.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::error::{Result, RpcError};
use crate::protocol::Response;

/// Per-request information handed to a handler.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub peer: SocketAddr,
}

/// An operation implementation.
pub type Handler = fn(&RequestContext, Value) -> Response;

/// Immutable mapping from operation name to handler.
pub struct DispatchTable {
    handlers: HashMap<String, Handler>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Table with the built-in operations.
    pub fn standard() -> Self {
        Self::builder().register("ping", ping).build()
    }

    /// Find the handler for `operation`.
    pub fn lookup(&self, operation: &str) -> Result<Handler> {
        self.handlers
            .get(operation)
            .copied()
            .ok_or_else(|| RpcError::UnknownOperation(operation.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("operations", &self.operations())
            .finish()
    }
}

/// Collects handlers before the table is frozen.
pub struct DispatchTableBuilder {
    handlers: HashMap<String, Handler>,
}

impl DispatchTableBuilder {
    /// Register `handler` under `operation`, replacing any earlier entry.
    pub fn register(mut self, operation: impl Into<String>, handler: Handler) -> Self {
        self.handlers.insert(operation.into(), handler);
        self
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            handlers: self.handlers,
        }
    }
}

/// `ping`: echo `params` back as the result of a `pong`.
pub fn ping(_ctx: &RequestContext, params: Value) -> Response {
    Response::new("pong", params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RequestContext {
        RequestContext {
            peer: "127.0.0.1:4000".parse().unwrap(),
        }
    }

    #[test]
    fn test_standard_table() {
        let table = DispatchTable::standard();
        assert_eq!(table.operations(), vec!["ping"]);

        let handler = table.lookup("ping").unwrap();
        let response = handler(&ctx(), json!({"k": [1, 2]}));
        assert_eq!(response, Response::new("pong", json!({"k": [1, 2]})));
    }

    #[test]
    fn test_unknown_operation() {
        let table = DispatchTable::standard();
        match table.lookup("PING") {
            Err(RpcError::UnknownOperation(name)) => assert_eq!(name, "PING"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_register_custom() {
        fn peer(ctx: &RequestContext, _: Value) -> Response {
            Response::new("peer", json!(ctx.peer.to_string()))
        }

        let table = DispatchTable::builder()
            .register("ping", ping)
            .register("peer", peer)
            .build();

        assert_eq!(table.len(), 2);
        let response = table.lookup("peer").unwrap()(&ctx(), Value::Null);
        assert_eq!(response.result, json!("127.0.0.1:4000"));
    }
}

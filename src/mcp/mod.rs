//! Model Context Protocol messages, the client session and the server dispatcher
//!
//! `rpc` holds the JSON-RPC envelope, `schema` the typed payloads, `session` the client state
//! machine and `server` the per-connection request loop.

pub mod rpc;
pub mod schema;
pub mod server;
pub mod session;

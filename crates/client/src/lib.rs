//! WebSocket client for switchyard JSON-RPC 2.0 servers.
//!
//! A [`Client`] owns one connection at a time. Outbound calls are correlated
//! by id; the server may also call methods registered on the client and push
//! topic notifications to subscribed handlers.

pub mod client;
pub mod error;

pub use {
    client::{CallOptions, Client, ClientBuilder, ClientState},
    error::{Error, Result},
    switchyard_protocol as protocol,
};

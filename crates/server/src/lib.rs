//! Server side of switchyard: method registration and binding, authorization,
//! the per-connection dispatcher, topic pub/sub with a last-value cache, and
//! the axum WebSocket adapter.
//!
//! A [`Dispatcher`] is built once with a [`DispatcherBuilder`], then every
//! accepted transport is driven through [`Dispatcher::serve`]. The transport
//! only has to deliver inbound text frames as a stream and drain the outbound
//! channel handed out by [`Dispatcher::connect`].

pub mod auth;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod method;
pub mod pubsub;
pub mod worker;
pub mod ws;

pub use {
    auth::{
        AllowAll, AuthBackend, Credentials, MethodTable, Requirements, RequirementsBackend,
        TokenAuthBackend, TokenUser, TopicTable, Visibility,
    },
    connection::{Connection, ConnectionState},
    context::RequestContext,
    dispatcher::{Dispatcher, DispatcherBuilder},
    error::{Error, Result},
    method::{
        Handler, HandlerError, HandlerResult, JsonKind, MethodDescriptor, Params, Request,
        Validator,
    },
    pubsub::PubSub,
    worker::WorkerPool,
};

pub use switchyard_protocol as protocol;

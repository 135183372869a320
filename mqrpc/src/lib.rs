#![forbid(unsafe_code)]
//! Request/response RPC over a broker's message queues.
//!
//! A [`Proxy`] sends requests to the server's well-known queue and awaits the
//! replies on a private queue. Results may embed [`RemoteStream`]s; their
//! events are forwarded by the server to a per-call queue and demultiplexed
//! back to local subscribers. [`ReconnectingProxy`] rides over connection
//! failures by rotating through a list of brokers.

pub use mqrpc_macro::{BindStreams, service};

mod error;
pub use error::{Error, ErrorKind, Result};

mod ids;
pub use ids::{Actor, InvocationId, SessionId, Trace};

mod payload;
pub use payload::Payload;

pub mod msg;
pub use msg::{
    ClientToServer, ObservationBody, RpcObservation, RpcReply, RpcRequest, ServerToClient,
    StreamEvent,
};

mod codec;
pub use codec::{Codec, DeserializeContext};

mod streams;
pub use streams::{
    BindStreams, ObservationSource, RemoteStream, StreamSender, StreamVisitor, Subscription,
    channel,
};

mod demux;
pub use demux::{DemuxState, Demultiplexer, StreamBinding};

mod registry;
pub use registry::StreamRegistry;

mod dedup;
pub use dedup::DeduplicationChecker;

mod waiter;
pub use waiter::{Waiter, WaiterCleaner};

mod receiver;
pub use receiver::Receiver;

mod task_supervisor;
pub use task_supervisor::TaskSupervisor;

mod sticky_pool;
mod state;

pub mod transport;

mod router;
pub use router::{EncodeReply, Method, MethodFlags, MethodInfo, Router};

mod context;
pub use context::Context;

mod proxy;
pub use proxy::Proxy;

mod client;
pub use client::{Client, ClientConfig, ConnectOptions, Connection};

mod reconnect;
pub use reconnect::{ReconnectListener, ReconnectingProxy, ReconnectingSubscription};

mod server;
pub use server::{ALL_PERMISSIONS, Server, ServerConfig};

pub mod services;

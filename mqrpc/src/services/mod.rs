//! Built-in RPC services, registered by every [`Server`](crate::Server).
//!
//! - `MetaService`: protocol version handshake and introspection.

mod meta_service;
pub use meta_service::MetaService;
pub(crate) use meta_service::MetaServiceImpl;

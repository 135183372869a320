use std::{collections::HashMap, future::Future};

use bitflags::bitflags;
use bytes::Bytes;
use foldhash::fast::RandomState;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{BindStreams, Codec, Error, Payload, Result, StreamVisitor};

/// Per-method behaviour declared with `#[rpc(...)]`.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MethodFlags(u8);

bitflags! {
    impl MethodFlags: u8 {
        /// The result may embed streams; the call gets its own reply queue.
        const ReturnsStreams = 1;
        /// The call has side effects and must not be re-invoked after a
        /// connection failure.
        const NoRetry = 2;
    }
}

/// Static description of one remote method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    /// `Interface/method`, as carried in the `method-name` property.
    pub name: &'static str,
    /// Lowest server protocol version implementing the method.
    pub since: u32,
    pub flags: MethodFlags,
}

impl MethodInfo {
    #[must_use]
    pub const fn new(name: &'static str, since: u32, flags: MethodFlags) -> Self {
        Self { name, since, flags }
    }

    #[must_use]
    pub const fn returns_streams(&self) -> bool {
        self.flags.contains(MethodFlags::ReturnsStreams)
    }

    #[must_use]
    pub const fn no_retry(&self) -> bool {
        self.flags.contains(MethodFlags::NoRetry)
    }
}

/// A handler's result, waiting to be encoded with the request's codec.
pub trait EncodeReply: Send {
    /// Serializes the `Result<T, Error>` reply body. Streams embedded in the
    /// value are exported through `visitor` first.
    ///
    /// # Errors
    ///
    /// The value could not be encoded. The caller replies with this error
    /// instead and discards whatever was exported.
    fn encode(self: Box<Self>, codec: Codec, visitor: &mut dyn StreamVisitor) -> Result<Bytes>;
}

struct PlainReply<T>(Result<T>);

impl<T: Serialize + Send> EncodeReply for PlainReply<T> {
    fn encode(self: Box<Self>, codec: Codec, _: &mut dyn StreamVisitor) -> Result<Bytes> {
        codec.serialize(&self.0)
    }
}

struct StreamsReply<T>(Result<T>);

impl<T: Serialize + BindStreams + Send> EncodeReply for StreamsReply<T> {
    fn encode(self: Box<Self>, codec: Codec, visitor: &mut dyn StreamVisitor) -> Result<Bytes> {
        let mut result = self.0;
        result.visit_streams(visitor)?;
        codec.serialize(&result)
    }
}

/// Encodes a failure reply. Always succeeds for the codecs we ship.
pub(crate) fn encode_error(codec: Codec, error: Error) -> Bytes {
    let result: Result<()> = Err(error);
    codec.serialize(&result).unwrap_or_default()
}

pub type Method =
    Box<dyn Fn(Codec, Payload) -> BoxFuture<'static, Box<dyn EncodeReply>> + Send + Sync>;

struct Entry {
    info: &'static MethodInfo,
    method: Method,
}

/// Server-side table of method handlers, keyed by method name.
#[derive(Default)]
pub struct Router {
    methods: HashMap<&'static str, Entry, RandomState>,
}

impl Router {
    /// Registers a handler taking the decoded argument tuple.
    pub fn add_method<Args, Rsp, F, Fut>(&mut self, info: &'static MethodInfo, f: F)
    where
        Args: DeserializeOwned + Send + 'static,
        Rsp: Serialize + Send + 'static,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        self.insert(
            info,
            Box::new(move |codec: Codec, args: Payload| -> BoxFuture<'static, Box<dyn EncodeReply>> {
                let fut = codec.deserialize::<Args>(args.as_slice()).map(&f);
                Box::pin(async move {
                    let result = match fut {
                        Ok(fut) => fut.await,
                        Err(e) => Err(e),
                    };
                    Box::new(PlainReply(result)) as Box<dyn EncodeReply>
                })
            }),
        );
    }

    /// Registers a handler whose result may embed streams.
    pub fn add_streams_method<Args, Rsp, F, Fut>(&mut self, info: &'static MethodInfo, f: F)
    where
        Args: DeserializeOwned + Send + 'static,
        Rsp: Serialize + BindStreams + Send + 'static,
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        self.insert(
            info,
            Box::new(move |codec: Codec, args: Payload| -> BoxFuture<'static, Box<dyn EncodeReply>> {
                let fut = codec.deserialize::<Args>(args.as_slice()).map(&f);
                Box::pin(async move {
                    let result = match fut {
                        Ok(fut) => fut.await,
                        Err(e) => Err(e),
                    };
                    Box::new(StreamsReply(result)) as Box<dyn EncodeReply>
                })
            }),
        );
    }

    fn insert(&mut self, info: &'static MethodInfo, method: Method) {
        if self.methods.insert(info.name, Entry { info, method }).is_some() {
            tracing::warn!("method {} registered twice, keeping the last one", info.name);
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Method> {
        self.methods.get(name).map(|entry| &entry.method)
    }

    /// Flags and version of a registered method.
    #[must_use]
    pub fn info(&self, name: &str) -> Option<&'static MethodInfo> {
        self.methods.get(name).map(|entry| entry.info)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.keys().copied()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("methods", &self.methods.keys())
            .finish()
    }
}

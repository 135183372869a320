use std::{backtrace::Backtrace, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    BindStreams, ClientToServer, DeserializeContext, Demultiplexer, Error, ErrorKind,
    InvocationId, MethodInfo, Result, RpcReply, RpcRequest, SessionId, StreamRegistry,
    state::{ClientState, reply_queue_address},
};

/// Client-side stub every `#[service]` interface is implemented for.
///
/// Cheap to clone; clones share the connection. Calls are concurrent: the
/// session lock is only held while a request is handed to the transport.
#[derive(Clone)]
pub struct Proxy {
    state: Arc<ClientState>,
    timeout: Option<Duration>,
}

impl Proxy {
    pub(crate) fn new(state: Arc<ClientState>) -> Self {
        Self {
            timeout: state.config.timeout,
            state,
        }
    }

    /// A proxy on the same connection whose calls give up after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            state: self.state.clone(),
            timeout,
        }
    }

    /// Per-call timeout; none waits until the reply or a connection failure.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Private queue replies of calls without streams arrive on.
    #[must_use]
    pub fn reply_address(&self) -> &str {
        &self.state.reply_address
    }

    /// Session stamped on every request of the connection.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.state.session_id
    }

    /// Version the server advertised at connect time.
    ///
    /// # Returns
    ///
    /// `None` until the connect handshake completed.
    #[must_use]
    pub fn server_protocol_version(&self) -> Option<u32> {
        self.state.server_version()
    }

    pub(crate) fn set_server_protocol_version(&self, version: u32) {
        self.state.set_server_version(version);
    }

    /// Reply queues of streaming calls that are still alive.
    #[must_use]
    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.state.registry
    }

    /// Calls still waiting for their reply.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.waiter.len()
    }

    /// True once [`close`](Self::close) ran; a lost connection alone does
    /// not close the proxy.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Graceful close: open streams are torn down and reported to the server,
    /// the reply queue is deleted, then the connection is closed. Every later
    /// call fails with `ProxyClosed`.
    pub async fn close(&self) {
        self.state.shutdown(true).await;
    }

    pub(crate) async fn force_close(&self) {
        self.state.shutdown(false).await;
    }

    /// Runs a deletion and notification round immediately, instead of waiting
    /// for the reaper.
    pub async fn reap(&self) {
        self.state.reap().await;
    }

    /// Calls a method without embedded streams.
    ///
    /// # Errors
    ///
    /// The server's failure, or a local one: `ProxyClosed`, `ConnectionLost`,
    /// `UnsupportedVersion`, `SerializeFailed`, `DeadlineExceeded`... Every
    /// error carries the caller's call site.
    pub async fn invoke<Req, Rsp>(&self, method: &'static MethodInfo, args: &Req) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        let call_site = self.call_site(method);
        let result: Result<Rsp> = async {
            self.check(method)?;
            let id = InvocationId::new_instance();
            let reply = self
                .call(method, id, args, &self.state.reply_address)
                .await?;
            reply
                .codec
                .deserialize::<Result<Rsp>>(reply.body.as_slice())?
        }
        .await;
        result.map_err(|e| e.with_call_site(call_site))
    }

    /// Calls a method whose result may embed streams. The call gets its own
    /// reply queue; the streams found in the result are bound to it.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke).
    pub async fn invoke_streams<Req, Rsp>(
        &self,
        method: &'static MethodInfo,
        args: &Req,
    ) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned + BindStreams,
    {
        let call_site = self.call_site(method);
        let result: Result<Rsp> = async {
            self.check(method)?;
            let id = InvocationId::new_instance();
            let address = reply_queue_address(self.state.transport.username());
            let demux = Demultiplexer::start(
                &self.state,
                address,
                method.name,
                id,
                Some(call_site.clone()),
            )
            .await?;

            let reply = match self.call(method, id, args, demux.address()).await {
                Ok(reply) => reply,
                Err(e) => {
                    demux.fail(&e);
                    return Err(e);
                }
            };
            let ctx = DeserializeContext {
                reply_address: demux.address().to_string(),
                method: method.name,
                call_site: Some(call_site.clone()),
                registry: self.state.registry.clone(),
                invocation_id: id,
            };
            match reply
                .codec
                .deserialize_with::<Result<Rsp>>(reply.body.as_slice(), &ctx)
            {
                Ok(result) => result,
                Err(e) => {
                    demux.fail(&e);
                    Err(e)
                }
            }
            // the bindings now own the demultiplexer; without any it goes away here.
        }
        .await;
        result.map_err(|e| e.with_call_site(call_site))
    }

    fn check(&self, method: &MethodInfo) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::new(ErrorKind::ProxyClosed, "RPC Proxy is closed"));
        }
        if self.state.transport.is_closed() {
            return Err(Error::new(
                ErrorKind::ConnectionLost,
                "Connection failure detected.",
            ));
        }
        if let Some(version) = self.state.server_version()
            && version < method.since
        {
            return Err(Error::new(
                ErrorKind::UnsupportedVersion,
                format!(
                    "Method {} requires protocol version {} but the server only supports version {version}",
                    method.name, method.since
                ),
            ));
        }
        Ok(())
    }

    fn call_site(&self, method: &MethodInfo) -> Arc<str> {
        if self.state.config.track_rpc_call_sites {
            format!("{}\n{}", method.name, Backtrace::force_capture()).into()
        } else {
            method.name.into()
        }
    }

    async fn call<Req: Serialize + ?Sized>(
        &self,
        method: &MethodInfo,
        id: InvocationId,
        args: &Req,
        reply_to: &str,
    ) -> Result<RpcReply> {
        let state = &self.state;
        let arguments = state.codec.serialize(args)?;
        if arguments.len() > state.config.max_message_size {
            return Err(Error::new(
                ErrorKind::MessageTooLarge,
                format!(
                    "arguments of {} take {} bytes, the limit is {}",
                    method.name,
                    arguments.len(),
                    state.config.max_message_size
                ),
            ));
        }

        let receiver = state.waiter.alloc(id)?;
        let msg = ClientToServer::Request(RpcRequest {
            id,
            session_id: state.session_id,
            method: method.name.to_string(),
            reply_to: reply_to.to_string(),
            arguments: arguments.into(),
            external_trace: state.external_trace,
            impersonated_actor: state.impersonated_actor.clone(),
            codec: state.codec,
        })
        .into_message()?;

        tracing::debug!("-> RPC {} {id} replying to {reply_to}", method.name);
        state.send_to_server(msg).await?;

        let reply = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, receiver.recv())
                .await
                .map_err(|_| {
                    Error::new(
                        ErrorKind::DeadlineExceeded,
                        format!("RPC {} timed out after {timeout:?}", method.name),
                    )
                })??,
            None => receiver.recv().await?,
        };
        tracing::debug!("<- RPC {} {id}: {} bytes", method.name, reply.body.len());
        Ok(reply)
    }
}

impl std::fmt::Display for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC proxy listening on queue {}", self.state.reply_address)
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("reply_address", &self.state.reply_address)
            .field("session_id", &self.state.session_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio_util::sync::CancellationToken;

use crate::{
    ClientToServer, Codec, Context, DeduplicationChecker, Error, ErrorKind, InvocationId,
    ObservationBody, ObservationSource, Result, Router, RpcObservation, RpcReply, RpcRequest,
    ServerToClient, StreamBinding, StreamVisitor, TaskSupervisor,
    ids::random63_bit_value,
    msg::{RPC_SERVER_QUEUE_NAME, sequence_of, stamp_sequence},
    router::encode_error,
    services::{MetaService, MetaServiceImpl},
    transport::{Consumer, MessageHandler, Producer, Transport, TransportMessage, VALIDATED_USER},
};

/// Permission granting every method.
pub const ALL_PERMISSIONS: &str = "ALL";

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ServerConfig {
    /// Advertised to clients at connect time.
    #[serde_inline_default(1)]
    pub protocol_version: u32,
    /// Methods each user may call, by full name or [`ALL_PERMISSIONS`]. None
    /// lets every authenticated user call everything.
    #[serde_inline_default(None)]
    pub permissions: Option<HashMap<String, Vec<String>>>,
    #[serde_inline_default(10 << 20)]
    pub max_message_size: usize,
    /// How long the watermark of a silent client is kept for dropping
    /// redelivered requests.
    #[serde_inline_default(Duration::from_secs(24 * 60 * 60))]
    #[serde(with = "humantime_serde")]
    pub deduplication_cache_expiry: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Streams exported for one invocation: they share its reply queue, its
/// handle numbering and its cancellation.
struct ExportTarget {
    id: InvocationId,
    reply_to: String,
    codec: Codec,
    next_handle: AtomicU32,
    active: AtomicUsize,
    token: CancellationToken,
}

struct Exporter<'a> {
    target: &'a ExportTarget,
    sources: Vec<(u32, Box<dyn ObservationSource>)>,
}

impl<'a> Exporter<'a> {
    fn new(target: &'a ExportTarget) -> Self {
        Self {
            target,
            sources: Vec::new(),
        }
    }
}

impl StreamVisitor for Exporter<'_> {
    fn bind(&mut self, handle: u32) -> Result<StreamBinding> {
        Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("the server cannot subscribe to stream {handle}"),
        ))
    }

    fn export(&mut self, source: Box<dyn ObservationSource>) -> Result<u32> {
        let handle = self.target.next_handle.fetch_add(1, Ordering::AcqRel);
        self.sources.push((handle, source));
        Ok(handle)
    }
}

struct ServerInner {
    config: ServerConfig,
    router: Router,
    transport: Arc<dyn Transport>,
    /// Stamped on every outgoing message along with `sequence`.
    identity: String,
    producer: tokio::sync::Mutex<Option<Box<dyn Producer>>>,
    sequence: AtomicU64,
    dedup: DeduplicationChecker,
    consumer: Mutex<Option<Box<dyn Consumer>>>,
    /// Invocations with live forwarders.
    streams: DashMap<InvocationId, Arc<ExportTarget>, RandomState>,
    supervisor: TaskSupervisor,
}

/// Minimal RPC server: consumes the server queue and dispatches requests to a
/// [`Router`].
///
/// ```rust,no_run
/// # use mqrpc::{Router, Server, ServerConfig, transport::{Credentials, memory::MemoryNetwork}};
/// # #[tokio::main]
/// # async fn main() {
/// let network = MemoryNetwork::new();
/// let broker = network.add_broker("broker-a");
/// broker.add_user("server", "secret");
/// let transport = broker.connect(&Credentials::new("server", "secret")).unwrap();
///
/// let server = Server::start(transport, Router::default(), ServerConfig::default())
///     .await
///     .unwrap();
/// server.stop();
/// server.join().await;
/// # }
/// ```
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Registers the built-in services, creates the server queue and starts
    /// consuming it.
    ///
    /// # Errors
    ///
    /// Fails if the server queue cannot be created, e.g. because another
    /// server already owns it.
    pub async fn start(
        transport: Arc<dyn Transport>,
        mut router: Router,
        config: ServerConfig,
    ) -> Result<Self> {
        let meta = Arc::new(MetaServiceImpl::new(config.protocol_version));
        meta.clone().mqrpc_export(&mut router);
        meta.set_methods(router.method_names().map(str::to_string).collect());

        transport.create_queue(RPC_SERVER_QUEUE_NAME).await?;
        let inner = Arc::new(ServerInner {
            identity: format!("server.{}", random63_bit_value()),
            dedup: DeduplicationChecker::new(config.deduplication_cache_expiry),
            config,
            router,
            transport,
            producer: tokio::sync::Mutex::default(),
            sequence: AtomicU64::new(0),
            consumer: Mutex::default(),
            streams: DashMap::default(),
            supervisor: TaskSupervisor::create(),
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        let handler: MessageHandler = Arc::new(move |msg| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(msg);
            }
        });
        let consumer = inner
            .transport
            .create_consumer(RPC_SERVER_QUEUE_NAME, handler)
            .await?;
        *inner.consumer_slot() = Some(consumer);
        inner.start_pruner();

        tracing::info!(
            "RPC server started, protocol version {}, {} methods",
            inner.config.protocol_version,
            inner.router.method_names().count()
        );
        Ok(Self { inner })
    }

    /// The configuration the server was started with.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Every method the server dispatches, the built-in services included.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Invocations whose streams are still being forwarded.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.inner.streams.len()
    }

    /// Stops consuming and cancels every forwarder. Call
    /// [`join`](Self::join) to wait for them.
    pub fn stop(&self) {
        if let Some(consumer) = self.inner.consumer_slot().take() {
            consumer.close();
        }
        for entry in self.inner.streams.iter() {
            entry.value().token.cancel();
        }
        self.inner.supervisor.stop();
    }

    /// Waits until the request handlers and stream forwarders have all ended.
    pub async fn join(&self) {
        self.inner.supervisor.all_stopped().await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.inner.config)
            .field("router", &self.inner.router)
            .field("active_streams", &self.inner.streams.len())
            .finish()
    }
}

impl ServerInner {
    fn consumer_slot(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn Consumer>>> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_pruner(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.config.deduplication_cache_expiry;
        self.supervisor.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pruned = inner.dedup.prune();
                tracing::debug!("forgot {pruned} idle clients");
            }
        });
    }

    fn on_message(self: Arc<Self>, msg: TransportMessage) {
        if let Some((identity, sequence)) = sequence_of(&msg)
            && self
                .dedup
                .is_duplicate(identity, RPC_SERVER_QUEUE_NAME, sequence)
        {
            tracing::info!("Message duplication detected, discarding message");
            return;
        }
        let user = msg.get_string(VALIDATED_USER).map(str::to_string);
        match ClientToServer::from_message(msg) {
            Ok(ClientToServer::Request(request)) => {
                let this = self.clone();
                self.supervisor
                    .spawn(async move { this.handle_request(request, user).await });
            }
            Ok(ClientToServer::StreamsClosed { ids, .. }) => {
                for id in ids {
                    if let Some((_, target)) = self.streams.remove(&id) {
                        tracing::debug!("client closed the streams of {id}");
                        target.token.cancel();
                    }
                }
            }
            Err(e) => tracing::warn!("dropping malformed message on the server queue: {e}"),
        }
    }

    fn authorize(&self, user: Option<&str>, method: &str) -> Result<()> {
        let Some(permissions) = &self.config.permissions else {
            return Ok(());
        };
        if method
            .split_once('/')
            .is_some_and(|(service, _)| service == <MetaServiceImpl as MetaService>::NAME)
        {
            return Ok(());
        }
        let allowed = user
            .and_then(|user| permissions.get(user))
            .is_some_and(|granted| {
                granted
                    .iter()
                    .any(|permission| permission == ALL_PERMISSIONS || permission == method)
            });
        if allowed {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::PermissionDenied,
                format!("User not authorized to perform RPC call {method}"),
            ))
        }
    }

    async fn handle_request(self: Arc<Self>, request: RpcRequest, user: Option<String>) {
        let RpcRequest {
            id,
            session_id,
            method,
            reply_to,
            arguments,
            external_trace,
            impersonated_actor,
            codec,
        } = request;
        tracing::debug!("<- RPC {method} {id} from {}", user.as_deref().unwrap_or("?"));

        let target = Arc::new(ExportTarget {
            id,
            reply_to: reply_to.clone(),
            codec,
            next_handle: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            token: CancellationToken::new(),
        });
        let mut exports = Vec::new();

        let body = match self.authorize(user.as_deref(), &method) {
            Err(e) => {
                tracing::warn!("{e}");
                encode_error(codec, e)
            }
            Ok(()) if arguments.len() > self.config.max_message_size => encode_error(
                codec,
                Error::new(
                    ErrorKind::MessageTooLarge,
                    format!("request of {} bytes refused", arguments.len()),
                ),
            ),
            Ok(()) => match self.router.get(&method) {
                None => encode_error(
                    codec,
                    Error::new(
                        ErrorKind::MethodNotFound,
                        format!("method not found: {method}"),
                    ),
                ),
                Some(handler) => {
                    let ctx = Context {
                        invocation_id: id,
                        session_id,
                        user: user.clone().unwrap_or_default(),
                        method: method.clone(),
                        external_trace,
                        impersonated_actor,
                        codec,
                    };
                    let reply = ctx.scope(handler(codec, arguments)).await;
                    let mut exporter = Exporter::new(&target);
                    match reply.encode(codec, &mut exporter) {
                        Ok(body) => {
                            exports = exporter.sources;
                            body
                        }
                        Err(e) => {
                            tracing::error!("could not encode the reply of {method}: {e}");
                            encode_error(codec, e)
                        }
                    }
                }
            },
        };

        let reply = ServerToClient::Reply(RpcReply {
            id,
            codec,
            body: body.into(),
        });
        if let Err(e) = self.send_message(&reply_to, reply).await {
            tracing::warn!("could not reply to {method} {id} on {reply_to}: {e}");
            return;
        }
        tracing::debug!("-> RPC {method} {id}, {} streams", exports.len());

        if !exports.is_empty() {
            self.streams.insert(id, target.clone());
            for (handle, source) in exports {
                self.clone().spawn_forwarder(target.clone(), handle, source);
            }
        }
    }

    fn spawn_forwarder(
        self: Arc<Self>,
        target: Arc<ExportTarget>,
        handle: u32,
        source: Box<dyn ObservationSource>,
    ) {
        target.active.fetch_add(1, Ordering::AcqRel);
        let this = self.clone();
        self.supervisor
            .spawn(async move { this.forward(target, handle, source).await });
    }

    async fn forward(
        self: Arc<Self>,
        target: Arc<ExportTarget>,
        handle: u32,
        mut source: Box<dyn ObservationSource>,
    ) {
        loop {
            let mut exporter = Exporter::new(&target);
            let event = tokio::select! {
                () = target.token.cancelled() => break,
                event = source.next_event(target.codec, &mut exporter) => event,
            };
            let nested = exporter.sources;
            let terminal = event.is_terminal();

            let body = ObservationBody { handle, event };
            let observation = match target.codec.serialize(&body) {
                Ok(body) => ServerToClient::Observation(RpcObservation {
                    id: target.id,
                    codec: target.codec,
                    body: body.into(),
                }),
                Err(e) => {
                    tracing::error!("could not encode an event of stream {handle}: {e}");
                    break;
                }
            };
            if let Err(e) = self.send_message(&target.reply_to, observation).await {
                tracing::debug!(
                    "stopping stream {handle} of {}: {e}",
                    target.reply_to
                );
                break;
            }
            for (handle, source) in nested {
                self.clone().spawn_forwarder(target.clone(), handle, source);
            }
            if terminal {
                break;
            }
        }

        if target.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.streams
                .remove_if(&target.id, |_, entry| Arc::ptr_eq(entry, &target));
        }
    }

    /// Sends under the producer lock, so sequence numbers reach each queue in
    /// increasing order.
    async fn send_message(&self, destination: &str, msg: ServerToClient) -> Result<()> {
        let mut msg = msg.into_message()?;
        let mut session = self.producer.lock().await;
        let producer = match session.take() {
            Some(producer) => producer,
            None => self.transport.create_producer().await?,
        };
        let producer = session.insert(producer);
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        stamp_sequence(&mut msg, &self.identity, sequence)?;
        producer.send(destination, msg).await
    }
}

use std::sync::{
    Arc, Mutex, OnceLock, PoisonError,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio::sync::mpsc;

use crate::{
    Actor, ClientConfig, ClientToServer, Codec, DeduplicationChecker, Error, ErrorKind, Result,
    ServerToClient, SessionId, StreamRegistry, TaskSupervisor, Trace, Waiter,
    ids::random63_bit_value,
    msg::{RPC_CLIENT_QUEUE_NAME_PREFIX, RPC_SERVER_QUEUE_NAME, sequence_of, stamp_sequence},
    registry::ReapRequest,
    sticky_pool::StickyPool,
    transport::{Consumer, MessageHandler, Producer, Transport, TransportMessage},
};

pub(crate) fn reply_queue_address(username: &str) -> String {
    format!(
        "{RPC_CLIENT_QUEUE_NAME_PREFIX}.{username}.{}",
        random63_bit_value()
    )
}

/// Everything one client connection shares between its proxies, its
/// demultiplexers and its background tasks.
pub(crate) struct ClientState {
    pub config: ClientConfig,
    pub codec: Codec,
    pub transport: Arc<dyn Transport>,
    pub waiter: Arc<Waiter>,
    pub registry: Arc<StreamRegistry>,
    pub pool: Arc<StickyPool>,
    /// Watermarks of the server messages received on any of our queues.
    pub dedup: Arc<DeduplicationChecker>,
    pub session_id: SessionId,
    pub external_trace: Option<Trace>,
    pub impersonated_actor: Option<Actor>,
    /// Private queue receiving replies of calls without streams.
    pub reply_address: String,
    pub reaper: mpsc::UnboundedSender<ReapRequest>,
    reap_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReapRequest>>,
    /// The session lock: held for producer creation and sending only.
    producer: tokio::sync::Mutex<Option<Box<dyn Producer>>>,
    /// Next sequence number stamped on an outgoing message, under the session
    /// lock so the server sees them in order.
    sequence: AtomicU64,
    consumer: Mutex<Option<Box<dyn Consumer>>>,
    server_version: OnceLock<u32>,
    closed: AtomicBool,
    supervisor: TaskSupervisor,
}

impl ClientState {
    pub(crate) async fn start(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        external_trace: Option<Trace>,
        impersonated_actor: Option<Actor>,
    ) -> Result<Arc<Self>> {
        let reply_address = reply_queue_address(transport.username());
        transport.create_queue(&reply_address).await?;

        let (reaper, reap_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Self {
            codec: Codec::from_flag(config.use_msgpack),
            pool: Arc::new(StickyPool::new(config.observation_executor_pool_size)),
            dedup: Arc::new(DeduplicationChecker::new(config.deduplication_cache_expiry)),
            config,
            transport,
            waiter: Arc::default(),
            registry: Arc::default(),
            session_id: SessionId::new_instance(),
            external_trace,
            impersonated_actor,
            reply_address,
            reaper,
            reap_rx: tokio::sync::Mutex::new(reap_rx),
            producer: tokio::sync::Mutex::default(),
            sequence: AtomicU64::new(0),
            consumer: Mutex::default(),
            server_version: OnceLock::new(),
            closed: AtomicBool::new(false),
            supervisor: TaskSupervisor::create(),
        });

        let weak = Arc::downgrade(&state);
        let handler: MessageHandler = Arc::new(move |msg| {
            if let Some(state) = weak.upgrade() {
                state.on_reply(msg);
            }
        });
        let consumer = match state
            .transport
            .create_consumer(&state.reply_address, handler)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                let _ = state.transport.delete_queue(&state.reply_address).await;
                return Err(e);
            }
        };
        *state.consumer_slot() = Some(consumer);

        state.start_reaper();
        state.start_watcher();
        tracing::debug!(
            "RPC client session {} listening on {}",
            state.session_id,
            state.reply_address
        );
        Ok(state)
    }

    fn consumer_slot(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn Consumer>>> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_reply(&self, msg: TransportMessage) {
        if let Some((identity, sequence)) = sequence_of(&msg)
            && self
                .dedup
                .is_duplicate(identity, &self.reply_address, sequence)
        {
            tracing::info!(
                "Message duplication detected on {}, discarding message",
                self.reply_address
            );
            return;
        }
        match ServerToClient::from_message(msg) {
            Ok(ServerToClient::Reply(reply)) => {
                self.waiter.post_reply(reply, self.config.max_message_size);
            }
            Ok(ServerToClient::Observation(observation)) => {
                tracing::warn!(
                    "unexpected observation for {} on {}, dropping",
                    observation.id,
                    self.reply_address
                );
            }
            Err(e) => {
                tracing::warn!("dropping malformed message on {}: {e}", self.reply_address);
            }
        }
    }

    fn start_reaper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.reap_interval;
        self.supervisor.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                state.reap().await;
            }
        });
    }

    fn start_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let closed = self.transport.closed();
        self.supervisor.spawn(async move {
            closed.cancelled().await;
            if let Some(state) = weak.upgrade() {
                state.on_connection_lost();
            }
        });
    }

    fn on_connection_lost(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(
            "Connection failure detected on session {}, failing {} outstanding RPCs",
            self.session_id,
            self.waiter.len()
        );
        let error = Error::new(ErrorKind::ConnectionLost, "Connection failure detected.");
        self.waiter.fail_all(&error);
        self.registry.fail_all(&error);
    }

    /// Deletes closed reply queues and tells the server, in one batch.
    pub(crate) async fn reap(&self) {
        let idle = self
            .registry
            .sweep(self.config.unsubscribed_stream_timeout);
        if idle > 0 {
            tracing::debug!("closed {idle} idle reply queues");
        }
        self.dedup.prune();

        let mut ids = Vec::new();
        {
            let mut rx = self.reap_rx.lock().await;
            while let Ok(request) = rx.try_recv() {
                if !self.transport.is_closed()
                    && let Err(e) = self.transport.delete_queue(&request.address).await
                {
                    tracing::debug!("could not delete {}: {e}", request.address);
                }
                ids.push(request.invocation_id);
            }
        }
        if ids.is_empty() || self.transport.is_closed() {
            return;
        }

        tracing::debug!("Reaping {} streams", ids.len());
        let closed = ClientToServer::StreamsClosed {
            ids,
            codec: self.codec,
        };
        let result = match closed.into_message() {
            Ok(msg) => self.send_to_server(msg).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::debug!("could not notify the server of closed streams: {e}");
        }
    }

    /// Sends under the session lock, creating the producer on first use.
    /// Every message is stamped with the session and a sequence number.
    pub(crate) async fn send(&self, destination: &str, mut msg: TransportMessage) -> Result<()> {
        let mut session = self.producer.lock().await;
        let producer = match session.take() {
            Some(producer) => producer,
            None => self.transport.create_producer().await?,
        };
        let producer = session.insert(producer);
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel);
        stamp_sequence(&mut msg, &self.session_id.to_string(), sequence)?;
        producer.send(destination, msg).await
    }

    pub(crate) async fn send_to_server(&self, msg: TransportMessage) -> Result<()> {
        self.send(RPC_SERVER_QUEUE_NAME, msg).await.map_err(|e| {
            if e.kind == ErrorKind::QueueNotFound {
                Error::new(
                    ErrorKind::SendFailed,
                    format!("RPC server is not available: {}", e.msg),
                )
            } else {
                e
            }
        })
    }

    pub(crate) fn server_version(&self) -> Option<u32> {
        self.server_version.get().copied()
    }

    pub(crate) fn set_server_version(&self, version: u32) {
        let _ = self.server_version.set(version);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the session. A graceful shutdown deletes the reply queues and
    /// tells the server about open streams first; a forced one just drops the
    /// connection.
    pub(crate) async fn shutdown(&self, graceful: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let error = Error::new(ErrorKind::ProxyClosed, "RPC Proxy is closed");
        self.registry.fail_all(&error);

        let connected = !self.transport.is_closed();
        if graceful && connected {
            self.reap().await;
        }
        if let Some(consumer) = self.consumer_slot().take() {
            consumer.close();
        }
        if graceful
            && connected
            && let Err(e) = self.transport.delete_queue(&self.reply_address).await
        {
            tracing::debug!("could not delete {}: {e}", self.reply_address);
        }

        self.waiter.fail_all(&error);
        self.supervisor.stop();
        self.pool.stop();
        self.transport.close(graceful).await;
        tracing::debug!("RPC client session {} closed", self.session_id);
    }
}

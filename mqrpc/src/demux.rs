use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use foldhash::fast::RandomState;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    Codec, DeduplicationChecker, Error, ErrorKind, InvocationId, ObservationBody,
    ObservationSource, Result, RpcObservation, ServerToClient, StreamEvent, StreamRegistry,
    StreamVisitor,
    msg::sequence_of,
    registry::ReapRequest,
    state::ClientState,
    sticky_pool::StickyPool,
    transport::{Consumer, MessageHandler, TransportMessage},
    waiter::Waiter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxState {
    Created,
    Consuming,
    Closed,
}

/// One event routed to a sub-stream, with the codec of its carrying message.
#[derive(Debug)]
pub(crate) struct Delivery {
    pub codec: Codec,
    pub event: StreamEvent,
}

/// Buffer of one handle. `rx` is taken by the subscriber; `tx` goes away
/// once the stream terminated or was discarded.
struct Slot {
    tx: Option<mpsc::UnboundedSender<Delivery>>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

struct DemuxInner {
    state: DemuxState,
    consumer: Option<Box<dyn Consumer>>,
    slots: HashMap<u32, Slot, RandomState>,
    /// Live subscriptions. The keep-alive set holds us while this is positive.
    subscribers: usize,
    /// Bindings handed out but neither subscribed nor dropped yet.
    pending: usize,
    ever_subscribed: bool,
    reply_received: bool,
}

/// Splits the messages arriving on one reply queue into per-handle streams.
pub struct Demultiplexer {
    address: String,
    method: &'static str,
    invocation_id: InvocationId,
    call_site: Option<Arc<str>>,
    created_at: Instant,
    max_message_size: usize,
    waiter: Arc<Waiter>,
    registry: Weak<StreamRegistry>,
    pool: Arc<StickyPool>,
    dedup: Arc<DeduplicationChecker>,
    reaper: mpsc::UnboundedSender<ReapRequest>,
    inner: Mutex<DemuxInner>,
}

impl Demultiplexer {
    /// Creates the reply queue and attaches its consumer. Must complete before
    /// the request naming `address` is sent.
    pub(crate) async fn start(
        state: &ClientState,
        address: String,
        method: &'static str,
        invocation_id: InvocationId,
        call_site: Option<Arc<str>>,
    ) -> Result<Arc<Self>> {
        state.transport.create_queue(&address).await?;

        let demux = Arc::new(Self {
            address,
            method,
            invocation_id,
            call_site,
            created_at: Instant::now(),
            max_message_size: state.config.max_message_size,
            waiter: state.waiter.clone(),
            registry: Arc::downgrade(&state.registry),
            pool: state.pool.clone(),
            dedup: state.dedup.clone(),
            reaper: state.reaper.clone(),
            inner: Mutex::new(DemuxInner {
                state: DemuxState::Created,
                consumer: None,
                slots: HashMap::default(),
                subscribers: 0,
                pending: 0,
                ever_subscribed: false,
                reply_received: false,
            }),
        });

        let weak = Arc::downgrade(&demux);
        let handler: MessageHandler = Arc::new(move |msg| {
            if let Some(demux) = weak.upgrade() {
                demux.on_message(msg);
            }
        });
        match state.transport.create_consumer(&demux.address, handler).await {
            Ok(consumer) => {
                let mut inner = demux.lock();
                inner.consumer = Some(consumer);
                inner.state = DemuxState::Consuming;
            }
            Err(e) => {
                demux.lock().state = DemuxState::Closed;
                let _ = state.transport.delete_queue(&demux.address).await;
                return Err(e);
            }
        }

        state.registry.insert(&demux);
        tracing::debug!("created reply queue {} for {}", demux.address, method);
        Ok(demux)
    }

    fn lock(&self) -> MutexGuard<'_, DemuxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The reply queue this demultiplexer consumes.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Full name of the call that created the queue, e.g. `Feeds/numbers`.
    #[must_use]
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// The root invocation; the server keys every observation by it.
    #[must_use]
    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    /// Where the call was made, when call sites are tracked.
    #[must_use]
    pub fn call_site(&self) -> Option<&Arc<str>> {
        self.call_site.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> DemuxState {
        self.lock().state
    }

    /// Live subscriptions over all handles of the queue.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers
    }

    fn on_message(self: Arc<Self>, msg: TransportMessage) {
        if let Some((identity, sequence)) = sequence_of(&msg)
            && self.dedup.is_duplicate(identity, &self.address, sequence)
        {
            tracing::info!(
                "Message duplication detected on {}, discarding message",
                self.address
            );
            return;
        }
        match ServerToClient::from_message(msg) {
            Ok(ServerToClient::Reply(reply)) => {
                self.lock().reply_received = true;
                self.waiter.post_reply(reply, self.max_message_size);
            }
            Ok(ServerToClient::Observation(observation)) => {
                if observation.body.len() > self.max_message_size {
                    tracing::warn!(
                        "dropping observation of {} bytes on {}, the limit is {}",
                        observation.body.len(),
                        self.address,
                        self.max_message_size
                    );
                    return;
                }
                let key = observation.id.value;
                let demux = self.clone();
                self.pool.run(key, move || demux.dispatch(observation));
            }
            Err(e) => {
                tracing::warn!("dropping malformed message on {}: {e}", self.address);
            }
        }
    }

    fn dispatch(&self, observation: RpcObservation) {
        match observation
            .codec
            .deserialize::<ObservationBody>(&observation.body)
        {
            Ok(body) => self.deliver(
                body.handle,
                Delivery {
                    codec: observation.codec,
                    event: body.event,
                },
            ),
            Err(e) => {
                tracing::warn!("undecodable observation on {}: {e}", self.address);
            }
        }
    }

    /// Routes one event to its handle, creating the buffer first if nobody
    /// asked for the handle yet.
    pub(crate) fn deliver(&self, handle: u32, delivery: Delivery) {
        let mut inner = self.lock();
        if inner.state == DemuxState::Closed {
            tracing::debug!(
                "dropping observation for stream {handle} of closed queue {}",
                self.address
            );
            return;
        }
        let slot = inner.slots.entry(handle).or_insert_with(Slot::new);
        let terminal = delivery.event.is_terminal();
        if let Some(tx) = &slot.tx {
            let _ = tx.send(delivery);
        }
        if terminal {
            slot.tx = None;
        }
    }

    /// Returns the binding of `handle`, creating its buffer on first use.
    pub(crate) fn get_for_handle(self: &Arc<Self>, handle: u32) -> StreamBinding {
        let mut inner = self.lock();
        inner.slots.entry(handle).or_insert_with(Slot::new);
        inner.pending += 1;
        StreamBinding {
            demux: self.clone(),
            handle,
            pending: true,
        }
    }

    fn subscribe(
        self: &Arc<Self>,
        handle: u32,
    ) -> Result<(mpsc::UnboundedReceiver<Delivery>, SubscriptionGuard)> {
        let mut released = None;
        let result = {
            let mut inner = self.lock();
            inner.pending = inner.pending.saturating_sub(1);
            let rx = inner.slots.get_mut(&handle).and_then(|slot| slot.rx.take());
            match rx {
                Some(rx) => {
                    inner.subscribers += 1;
                    inner.ever_subscribed = true;
                    if inner.subscribers == 1
                        && inner.state == DemuxState::Consuming
                        && let Some(registry) = self.registry.upgrade()
                    {
                        registry.keep_alive(self.clone());
                    }
                    Ok((
                        rx,
                        SubscriptionGuard {
                            demux: self.clone(),
                            handle,
                        },
                    ))
                }
                None if inner.state == DemuxState::Closed => Err(Error::new(
                    ErrorKind::StreamClosed,
                    format!("stream {handle} of {} is already closed", self.method),
                )),
                None => {
                    released = self.close_if_unreferenced(&mut inner);
                    Err(Error::new(
                        ErrorKind::AlreadySubscribed,
                        format!("stream {handle} of {} was already subscribed", self.method),
                    ))
                }
            }
        };
        drop(released);
        result
    }

    fn unsubscribe(&self, handle: u32) {
        let released = {
            let mut inner = self.lock();
            inner.subscribers = inner.subscribers.saturating_sub(1);
            tracing::trace!("unsubscribed stream {handle} of {}", self.address);
            if inner.subscribers == 0 && inner.state == DemuxState::Consuming {
                if inner.pending == 0 {
                    self.close(&mut inner, None)
                } else {
                    self.registry
                        .upgrade()
                        .and_then(|registry| registry.release(&self.address))
                }
            } else {
                None
            }
        };
        drop(released);
    }

    fn binding_dropped(&self, handle: u32) {
        let released = {
            let mut inner = self.lock();
            inner.pending = inner.pending.saturating_sub(1);
            if inner.state != DemuxState::Consuming {
                return;
            }
            // discard whatever the server keeps pushing for this handle.
            if let Some(slot) = inner.slots.get_mut(&handle) {
                slot.tx = None;
                slot.rx = None;
            }
            warn_unsubscribed(self.method, &self.address, self.call_site.as_deref());
            self.close_if_unreferenced(&mut inner)
        };
        drop(released);
    }

    fn close_if_unreferenced(&self, inner: &mut DemuxInner) -> Option<Arc<Self>> {
        if inner.state == DemuxState::Consuming && inner.subscribers == 0 && inner.pending == 0 {
            self.close(inner, None)
        } else {
            None
        }
    }

    /// Final transition. Returns the keep-alive reference so the caller can
    /// drop it after releasing the lock.
    fn close(&self, inner: &mut DemuxInner, error: Option<&Error>) -> Option<Arc<Self>> {
        inner.state = DemuxState::Closed;
        if let Some(consumer) = inner.consumer.take() {
            consumer.close();
        }
        for slot in inner.slots.values_mut() {
            if let Some(tx) = slot.tx.take()
                && let Some(error) = error
            {
                let _ = tx.send(Delivery {
                    codec: Codec::default(),
                    event: StreamEvent::Error(error.clone()),
                });
            }
        }
        tracing::debug!("closing reply queue {} of {}", self.address, self.method);
        let _ = self.reaper.send(ReapRequest {
            address: self.address.clone(),
            invocation_id: self.invocation_id,
        });
        self.registry
            .upgrade()
            .and_then(|registry| registry.release(&self.address))
    }

    /// Terminates every stream with `error` and tears the queue down.
    pub(crate) fn fail(&self, error: &Error) {
        let released = {
            let mut inner = self.lock();
            if inner.state == DemuxState::Closed {
                return;
            }
            self.close(&mut inner, Some(error))
        };
        drop(released);
    }

    /// Closes a queue whose streams were never subscribed within `timeout`.
    pub(crate) fn close_if_idle(&self, timeout: Duration) -> bool {
        let released = {
            let mut inner = self.lock();
            if inner.state != DemuxState::Consuming
                || inner.subscribers > 0
                || inner.ever_subscribed
                || !inner.reply_received
                || self.created_at.elapsed() < timeout
            {
                return false;
            }
            warn_unsubscribed(self.method, &self.address, self.call_site.as_deref());
            // a binding still held sees the buffered values, then this error
            // rather than a normal completion.
            let error = Error::new(
                ErrorKind::StreamClosed,
                format!(
                    "streams of {} were closed after {:?} without a subscriber",
                    self.method, timeout
                ),
            );
            self.close(&mut inner, Some(&error))
        };
        drop(released);
        true
    }
}

fn warn_unsubscribed(method: &str, address: &str, call_site: Option<&str>) {
    tracing::warn!(
        "A stream returned from RPC {method} was never subscribed to, closing {address}. \
         The server kept pushing values nobody reads; call RemoteStream::not_used() on \
         streams you do not need.{}",
        call_site.map_or_else(
            || " Enable track_rpc_call_sites to see where the call was made.".to_string(),
            |site| format!(" Call site: {site}"),
        )
    );
}

impl Drop for Demultiplexer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.state == DemuxState::Consuming {
            inner.state = DemuxState::Closed;
            if let Some(consumer) = inner.consumer.take() {
                consumer.close();
            }
            if inner.slots.values().any(|slot| slot.rx.is_some()) {
                warn_unsubscribed(self.method, &self.address, self.call_site.as_deref());
            } else {
                tracing::debug!("closing reply queue {} of {}", self.address, self.method);
            }
            let _ = self.reaper.send(ReapRequest {
                address: self.address.clone(),
                invocation_id: self.invocation_id,
            });
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(&self.address);
        }
    }
}

impl std::fmt::Debug for Demultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demultiplexer")
            .field("address", &self.address)
            .field("method", &self.method)
            .field("invocation_id", &self.invocation_id)
            .finish_non_exhaustive()
    }
}

/// A decoded handle tied to its demultiplexer, not subscribed yet.
pub struct StreamBinding {
    demux: Arc<Demultiplexer>,
    handle: u32,
    pending: bool,
}

impl StreamBinding {
    /// Observable handle the server assigned to this stream.
    #[must_use]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub(crate) fn subscribe(
        mut self,
    ) -> Result<(mpsc::UnboundedReceiver<Delivery>, SubscriptionGuard)> {
        self.pending = false;
        self.demux.subscribe(self.handle)
    }
}

impl Drop for StreamBinding {
    fn drop(&mut self) {
        if self.pending {
            self.demux.binding_dropped(self.handle);
        }
    }
}

/// Held by a live subscription; dropping it is the unsubscribe.
pub(crate) struct SubscriptionGuard {
    demux: Arc<Demultiplexer>,
    handle: u32,
}

impl SubscriptionGuard {
    pub(crate) fn demux(&self) -> &Arc<Demultiplexer> {
        &self.demux
    }

    /// Call site of the call whose reply queue carries the stream.
    pub(crate) fn call_site(&self) -> Option<&Arc<str>> {
        self.demux.call_site()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.demux.unsubscribe(self.handle);
    }
}

/// Binds streams nested inside a stream value to the same reply queue.
pub(crate) struct NestedBinder<'a>(pub &'a Arc<Demultiplexer>);

impl StreamVisitor for NestedBinder<'_> {
    fn bind(&mut self, handle: u32) -> Result<StreamBinding> {
        Ok(self.0.get_for_handle(handle))
    }

    fn export(&mut self, _: Box<dyn ObservationSource>) -> Result<u32> {
        Err(Error::new(
            ErrorKind::InvalidArgument,
            "streams cannot be exported while decoding a stream value",
        ))
    }
}

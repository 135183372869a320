//! Push-streams embedded in RPC results.
//!
//! On the server a [`RemoteStream`] wraps the receiving end of a local
//! channel. When the result is encoded, every such stream is exported: it gets
//! a handle, and a forwarder starts pushing its events to the reply queue.
//! On the client the handle is decoded and bound to the demultiplexer of the
//! call's reply queue; [`RemoteStream::subscribe`] then yields the values.
//!
//! Finding the streams inside an arbitrary value is the job of
//! [`BindStreams`]; derive it with `#[derive(mqrpc::BindStreams)]`.

use std::{
    collections::{BTreeMap, HashMap},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use futures_util::{Stream, future::BoxFuture};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use tokio::sync::mpsc;

use crate::{
    Codec, Error, ErrorKind, Result, StreamEvent,
    demux::{Delivery, NestedBinder, StreamBinding, SubscriptionGuard},
};

/// Callback handed to [`BindStreams::visit_streams`].
pub trait StreamVisitor {
    /// Client side: resolves a decoded handle into a live binding.
    fn bind(&mut self, handle: u32) -> Result<StreamBinding>;

    /// Server side: starts forwarding `source` and returns its handle.
    fn export(&mut self, source: Box<dyn ObservationSource>) -> Result<u32>;
}

/// Visits every [`RemoteStream`] reachable from a value.
pub trait BindStreams {
    /// # Errors
    fn visit_streams(&mut self, visitor: &mut dyn StreamVisitor) -> Result<()>;
}

/// Server-side producer of stream events, type-erased.
pub trait ObservationSource: Send {
    /// Waits for the next event and encodes it. Streams nested inside a value
    /// are exported through `visitor`.
    fn next_event<'a>(
        &'a mut self,
        codec: Codec,
        visitor: &'a mut (dyn StreamVisitor + Send),
    ) -> BoxFuture<'a, StreamEvent>;
}

enum Event<T> {
    Next(T),
    Error(Error),
    Complete,
}

/// Producing half of a stream created with [`channel`].
pub struct StreamSender<T> {
    tx: mpsc::UnboundedSender<Event<T>>,
}

impl<T> StreamSender<T> {
    /// # Errors
    ///
    /// `StreamClosed` once the consumer went away, e.g. after the client
    /// dropped its subscription.
    pub fn send(&self, value: T) -> Result<()> {
        self.tx
            .send(Event::Next(value))
            .map_err(|_| Error::new(ErrorKind::StreamClosed, "stream has no consumer"))
    }

    pub fn error(self, error: Error) {
        let _ = self.tx.send(Event::Error(error));
    }

    pub fn complete(self) {
        let _ = self.tx.send(Event::Complete);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the consumer went away.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Creates a stream that can be returned from an RPC method.
#[must_use]
pub fn channel<T>() -> (StreamSender<T>, RemoteStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamSender { tx },
        RemoteStream {
            state: State::Local(rx),
        },
    )
}

enum State<T> {
    Local(mpsc::UnboundedReceiver<Event<T>>),
    Handle(u32),
    Bound(StreamBinding),
    Exported,
}

/// A stream of `T` that can travel inside an RPC result. It is encoded as its
/// handle.
pub struct RemoteStream<T> {
    state: State<T>,
}

impl<T> RemoteStream<T> {
    /// Handle within the reply queue, once exported or decoded.
    #[must_use]
    pub fn handle(&self) -> Option<u32> {
        match &self.state {
            State::Handle(handle) => Some(*handle),
            State::Bound(binding) => Some(binding.handle()),
            State::Local(_) | State::Exported => None,
        }
    }

    /// Starts receiving values. Values pushed before this call are buffered
    /// and delivered first.
    ///
    /// # Errors
    ///
    /// `AlreadySubscribed` if the handle was subscribed before, `StreamClosed`
    /// if its reply queue is already gone.
    pub fn subscribe(self) -> Result<Subscription<T>> {
        match self.state {
            State::Local(rx) => Ok(Subscription {
                source: Source::Local(rx),
                done: false,
            }),
            State::Bound(binding) => {
                let (rx, guard) = binding.subscribe()?;
                Ok(Subscription {
                    source: Source::Remote {
                        rx,
                        guard: Some(guard),
                    },
                    done: false,
                })
            }
            State::Handle(handle) => Err(Error::new(
                ErrorKind::InvalidArgument,
                format!(
                    "stream {handle} is not bound to a reply queue, was its method declared with #[rpc(streams)]?"
                ),
            )),
            State::Exported => Err(Error::new(
                ErrorKind::StreamClosed,
                "stream was exported and can no longer be read locally",
            )),
        }
    }

    /// Releases a stream the caller has no use for, so its reply queue can be
    /// torn down without a leak warning.
    pub fn not_used(self) {
        if let Ok(subscription) = self.subscribe() {
            drop(subscription);
        }
    }
}

impl<T> std::fmt::Debug for RemoteStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Local(_) => "local",
            State::Handle(_) => "unbound",
            State::Bound(_) => "bound",
            State::Exported => "exported",
        };
        f.debug_struct("RemoteStream")
            .field("state", &state)
            .field("handle", &self.handle())
            .finish()
    }
}

impl<T> Serialize for RemoteStream<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.handle() {
            Some(handle) => serializer.serialize_u32(handle),
            None => Err(serde::ser::Error::custom(
                "a local stream must be exported before it is serialized",
            )),
        }
    }
}

impl<'de, T> Deserialize<'de> for RemoteStream<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let handle = u32::deserialize(deserializer)?;
        Ok(RemoteStream {
            state: State::Handle(handle),
        })
    }
}

impl<T> BindStreams for RemoteStream<T>
where
    T: Serialize + BindStreams + Send + 'static,
{
    fn visit_streams(&mut self, visitor: &mut dyn StreamVisitor) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Exported) {
            State::Local(rx) => {
                let handle = visitor.export(Box::new(LocalSource { rx }))?;
                self.state = State::Handle(handle);
            }
            State::Handle(handle) => {
                self.state = State::Bound(visitor.bind(handle)?);
            }
            state => self.state = state,
        }
        Ok(())
    }
}

struct LocalSource<T> {
    rx: mpsc::UnboundedReceiver<Event<T>>,
}

impl<T> ObservationSource for LocalSource<T>
where
    T: Serialize + BindStreams + Send + 'static,
{
    fn next_event<'a>(
        &'a mut self,
        codec: Codec,
        visitor: &'a mut (dyn StreamVisitor + Send),
    ) -> BoxFuture<'a, StreamEvent> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Event::Next(mut value)) => {
                    match value
                        .visit_streams(visitor)
                        .and_then(|()| codec.serialize(&value))
                    {
                        Ok(bytes) => StreamEvent::Next(bytes),
                        Err(e) => StreamEvent::Error(e),
                    }
                }
                Some(Event::Error(e)) => StreamEvent::Error(e),
                // a dropped sender ends the stream.
                Some(Event::Complete) | None => StreamEvent::Complete,
            }
        })
    }
}

enum Source<T> {
    Local(mpsc::UnboundedReceiver<Event<T>>),
    Remote {
        rx: mpsc::UnboundedReceiver<Delivery>,
        guard: Option<SubscriptionGuard>,
    },
}

/// Values of a subscribed stream. Dropping it unsubscribes.
///
/// Yields `Ok(value)` per item, then ends; a failed stream yields one `Err`
/// and ends.
pub struct Subscription<T> {
    source: Source<T>,
    done: bool,
}

// No field is ever pinned.
impl<T> Unpin for Subscription<T> {}

impl<T: DeserializeOwned + BindStreams> Subscription<T> {
    pub async fn recv(&mut self) -> Option<Result<T>> {
        std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }
}

impl<T> Subscription<T> {
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T: DeserializeOwned + BindStreams> Stream for Subscription<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let item = match &mut this.source {
            Source::Local(rx) => match ready!(rx.poll_recv(cx)) {
                Some(Event::Next(value)) => Some(Ok(value)),
                Some(Event::Error(e)) => Some(Err(e)),
                Some(Event::Complete) | None => None,
            },
            Source::Remote { rx, guard } => match ready!(rx.poll_recv(cx)) {
                Some(Delivery {
                    codec,
                    event: StreamEvent::Next(bytes),
                }) => Some(codec.deserialize::<T>(&bytes).and_then(|mut value| {
                    if let Some(guard) = guard {
                        value.visit_streams(&mut NestedBinder(guard.demux()))?;
                    }
                    Ok(value)
                })),
                Some(Delivery {
                    event: StreamEvent::Error(e),
                    ..
                }) => {
                    let call_site = guard.as_ref().and_then(|guard| guard.call_site());
                    Some(Err(match call_site {
                        Some(call_site) => e.with_call_site(call_site.clone()),
                        None => e,
                    }))
                }
                Some(Delivery {
                    event: StreamEvent::Complete,
                    ..
                })
                | None => None,
            },
        };

        if !matches!(item, Some(Ok(_))) {
            this.done = true;
            if let Source::Remote { guard, .. } = &mut this.source {
                guard.take();
            }
        }
        Poll::Ready(item)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

macro_rules! impl_no_streams {
    ($($ty:ty),* $(,)?) => {
        $(
            impl BindStreams for $ty {
                fn visit_streams(&mut self, _: &mut dyn StreamVisitor) -> Result<()> {
                    Ok(())
                }
            }
        )*
    };
}

impl_no_streams!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    bytes::Bytes,
    serde_json::Value,
    std::time::Duration,
    std::time::SystemTime,
    Error,
    crate::InvocationId,
    crate::SessionId,
);

impl<T: BindStreams> BindStreams for Option<T> {
    fn visit_streams(&mut self, visitor: &mut dyn StreamVisitor) -> Result<()> {
        match self {
            Some(value) => value.visit_streams(visitor),
            None => Ok(()),
        }
    }
}

impl<T: BindStreams, E> BindStreams for std::result::Result<T, E> {
    fn visit_streams(&mut self, visitor: &mut dyn StreamVisitor) -> Result<()> {
        match self {
            Ok(value) => value.visit_streams(visitor),
            Err(_) => Ok(()),
        }
    }
}

impl<T: BindStreams> BindStreams for Vec<T> {
    fn visit_streams(&mut self, visitor: &mut dyn StreamVisitor) -> Result<()> {
        self.iter_mut().try_for_each(|value| value.visit_streams(visitor))
    }
}

impl<T: BindStreams> BindStreams for Box<T> {
    fn visit_streams(&mut self, visitor: &mut dyn StreamVisitor) -> Result<()> {
        self.as_mut().visit_streams(visitor)
    }
}

impl<K, V: BindStreams, S> BindStreams for HashMap<K, V, S> {
    fn visit_streams(&mut self, visitor: &mut dyn StreamVisitor) -> Result<()> {
        self.values_mut()
            .try_for_each(|value| value.visit_streams(visitor))
    }
}

impl<K, V: BindStreams> BindStreams for BTreeMap<K, V> {
    fn visit_streams(&mut self, visitor: &mut dyn StreamVisitor) -> Result<()> {
        self.values_mut()
            .try_for_each(|value| value.visit_streams(visitor))
    }
}

impl<T: ?Sized> BindStreams for Arc<T> {
    // shared values cannot be mutated, so they must not carry streams.
    fn visit_streams(&mut self, _: &mut dyn StreamVisitor) -> Result<()> {
        Ok(())
    }
}

macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: BindStreams),+> BindStreams for ($($name,)+) {
            #[allow(non_snake_case)]
            fn visit_streams(&mut self, visitor: &mut dyn StreamVisitor) -> Result<()> {
                let ($($name,)+) = self;
                $($name.visit_streams(visitor)?;)+
                Ok(())
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);
impl_tuple!(A, B, C, D, E);
impl_tuple!(A, B, C, D, E, F);

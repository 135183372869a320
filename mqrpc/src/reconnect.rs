//! Failover across a pool of brokers.
//!
//! [`ReconnectingProxy`] implements every `#[service]` interface like
//! [`Proxy`] does. A call failing with a connection error triggers a
//! reconnection (next address, growing backoff) and is then run again, unless
//! its method is declared `#[rpc(no_retry)]`. Feeds are re-subscribed with
//! [`ReconnectingProxy::observe`]; values emitted while disconnected are lost,
//! and some may be seen twice. Side effects whose completion cannot be
//! observed across a disconnect go through
//! [`ReconnectingProxy::run_with_logical_retry`].

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use futures_util::Stream;
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    BindStreams, Client, Connection, Error, ErrorKind, MethodInfo, Proxy, RemoteStream, Result,
    TaskSupervisor,
    transport::{BrokerAddress, Connector, Credentials},
};

/// Hooks called around a reconnection.
pub trait ReconnectListener: Send + Sync {
    fn on_disconnect(&self, _error: &Error) {}

    fn on_reconnect(&self, _connection: &Connection) {}
}

struct Current {
    connection: Option<Arc<Connection>>,
    index: usize,
    /// Bumped on every reconnection, so concurrent failures reconnect once.
    generation: u64,
}

struct Inner {
    client: Client,
    connector: Arc<dyn Connector>,
    addresses: Vec<BrokerAddress>,
    credentials: Credentials,
    listener: Option<Arc<dyn ReconnectListener>>,
    current: Mutex<Current>,
    reconnect_lock: tokio::sync::Mutex<()>,
    closed: CancellationToken,
    supervisor: TaskSupervisor,
}

/// A [`Proxy`] that survives broker restarts and fails over between brokers.
#[derive(Clone)]
pub struct ReconnectingProxy {
    inner: Arc<Inner>,
}

impl ReconnectingProxy {
    /// Tries every address once, in order.
    ///
    /// # Errors
    ///
    /// `ConnectFailed` when none of them accepts the connection.
    pub async fn connect(
        client: Client,
        connector: Arc<dyn Connector>,
        addresses: Vec<BrokerAddress>,
        credentials: Credentials,
        listener: Option<Arc<dyn ReconnectListener>>,
    ) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "no broker address given",
            ));
        }

        let mut connected = None;
        for (index, address) in addresses.iter().enumerate() {
            match client
                .connect(connector.as_ref(), address, &credentials)
                .await
            {
                Ok(connection) => {
                    connected = Some((index, connection));
                    break;
                }
                // the version check failing is not a reason to try elsewhere.
                Err(e) if !e.is_connection_error() && e.kind != ErrorKind::AuthenticationFailed => {
                    return Err(e);
                }
                Err(e) => tracing::warn!("could not connect to {address}: {e}"),
            }
        }
        let Some((index, connection)) = connected else {
            return Err(Error::new(
                ErrorKind::ConnectFailed,
                "Cannot connect to server(s). Tried with all available servers.",
            ));
        };

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                connector,
                addresses,
                credentials,
                listener,
                current: Mutex::new(Current {
                    connection: Some(Arc::new(connection)),
                    index,
                    generation: 0,
                }),
                reconnect_lock: tokio::sync::Mutex::default(),
                closed: CancellationToken::new(),
                supervisor: TaskSupervisor::create(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Current> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> (Option<Proxy>, u64) {
        let current = self.lock();
        (
            current
                .connection
                .as_ref()
                .map(|connection| connection.proxy().clone()),
            current.generation,
        )
    }

    /// The live connection, if any.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.lock().connection.clone()
    }

    /// Address of the broker currently (or last) connected to.
    ///
    /// # Returns
    ///
    /// The entry of the address list the last successful connection used.
    #[must_use]
    pub fn current_address(&self) -> &BrokerAddress {
        &self.inner.addresses[self.lock().index]
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// A proxy on the live connection, reconnecting first if there is none.
    ///
    /// # Errors
    ///
    /// `ProxyClosed` after [`close`](Self::close), `MaxRetriesExceeded` when
    /// the reconnection gave up.
    pub async fn proxy(&self) -> Result<Proxy> {
        Ok(self.current().await?.0)
    }

    async fn current(&self) -> Result<(Proxy, u64)> {
        loop {
            if self.is_closed() {
                return Err(Error::new(ErrorKind::ProxyClosed, "RPC Proxy is closed"));
            }
            match self.snapshot() {
                (Some(proxy), generation) => return Ok((proxy, generation)),
                (None, generation) => {
                    let error = Error::new(ErrorKind::ConnectionLost, "not connected");
                    self.reconnect(generation, &error).await?;
                }
            }
        }
    }

    /// Replaces the connection observed at `seen`. Callers that saw an older
    /// generation return at once: someone else already reconnected.
    async fn reconnect(&self, seen: u64, error: &Error) -> Result<()> {
        let _guard = self.inner.reconnect_lock.lock().await;
        let (old, mut index) = {
            let mut current = self.lock();
            if current.generation != seen {
                return Ok(());
            }
            (current.connection.take(), current.index)
        };
        if self.is_closed() {
            return Err(Error::new(ErrorKind::ProxyClosed, "RPC Proxy is closed"));
        }

        tracing::warn!("connection failure detected ({error}), reconnecting");
        if let Some(listener) = &self.inner.listener {
            listener.on_disconnect(error);
        }
        if let Some(old) = old {
            old.force_close().await;
        }

        let config = &self.inner.client.config;
        let mut interval = config.connection_retry_interval;
        let mut attempts = 0u32;
        loop {
            if let Some(max) = config.max_reconnect_attempts
                && attempts >= max
            {
                self.lock().generation += 1;
                return Err(Error::new(
                    ErrorKind::MaxRetriesExceeded,
                    format!("Max number of reconnect attempts ({max}) reached"),
                ));
            }
            attempts += 1;

            tokio::select! {
                () = self.inner.closed.cancelled() => {
                    return Err(Error::new(ErrorKind::ProxyClosed, "RPC Proxy is closed"));
                }
                () = tokio::time::sleep(interval) => {}
            }

            index = (index + 1) % self.inner.addresses.len();
            let address = &self.inner.addresses[index];
            tracing::info!("reconnecting to {address}, attempt {attempts}");
            match self
                .inner
                .client
                .connect(self.inner.connector.as_ref(), address, &self.inner.credentials)
                .await
            {
                Ok(connection) => {
                    if self.is_closed() {
                        connection.force_close().await;
                        return Err(Error::new(ErrorKind::ProxyClosed, "RPC Proxy is closed"));
                    }
                    tracing::info!("reconnected to {address} after {attempts} attempts");
                    if let Some(listener) = &self.inner.listener {
                        listener.on_reconnect(&connection);
                    }
                    let mut current = self.lock();
                    current.connection = Some(Arc::new(connection));
                    current.index = index;
                    current.generation += 1;
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!("reconnection attempt {attempts} to {address} failed: {e}");
                    interval = interval
                        .mul_f64(config.connection_retry_interval_multiplier)
                        .min(config.connection_max_retry_interval);
                }
            }
        }
    }

    async fn retrying<T, F, Fut>(&self, method: &MethodInfo, f: F) -> Result<T>
    where
        F: Fn(Proxy) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let (proxy, generation) = self.current().await?;
            match f(proxy).await {
                Err(e) if e.is_connection_error() && !self.is_closed() => {
                    self.reconnect(generation, &e).await?;
                    if method.no_retry() {
                        return Err(e);
                    }
                    tracing::info!("retrying {} after reconnection", method.name);
                }
                result => return result,
            }
        }
    }

    /// [`Proxy::invoke`], retried across reconnections.
    ///
    /// # Errors
    ///
    /// Any error of the call other than a connection error. A connection
    /// error is returned as-is for a `no_retry` method, after the
    /// reconnection it triggered.
    pub async fn invoke<Req, Rsp>(&self, method: &'static MethodInfo, args: &Req) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        self.retrying(method, |proxy| async move { proxy.invoke(method, args).await })
            .await
    }

    /// [`Proxy::invoke_streams`], retried across reconnections. Streams
    /// already returned are not re-established; use [`observe`](Self::observe)
    /// for that.
    ///
    /// # Errors
    ///
    /// Same as [`invoke`](Self::invoke).
    pub async fn invoke_streams<Req, Rsp>(
        &self,
        method: &'static MethodInfo,
        args: &Req,
    ) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned + BindStreams,
    {
        self.retrying(method, |proxy| async move {
            proxy.invoke_streams(method, args).await
        })
        .await
    }

    /// Follows the feed returned by `subscribe`, calling it again on every
    /// reconnection. Values emitted while disconnected are missed; some may
    /// be delivered twice.
    pub fn observe<T, F, Fut>(&self, subscribe: F) -> ReconnectingSubscription<T>
    where
        T: DeserializeOwned + BindStreams + Send + 'static,
        F: Fn(Proxy) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RemoteStream<T>>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = self.clone();
        self.inner.supervisor.spawn(async move {
            'resubscribe: loop {
                let (proxy, generation) = match this.current().await {
                    Ok(current) => current,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let mut subscription = match subscribe(proxy).await.and_then(RemoteStream::subscribe) {
                    Ok(subscription) => subscription,
                    Err(e) if e.is_connection_error() => {
                        if let Err(e) = this.reconnect(generation, &e).await {
                            let _ = tx.send(Err(e));
                            return;
                        }
                        continue;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };

                loop {
                    let item = tokio::select! {
                        () = tx.closed() => return,
                        item = subscription.recv() => item,
                    };
                    match item {
                        Some(Ok(value)) => {
                            if tx.send(Ok(value)).is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) if e.is_connection_error() && !this.is_closed() => {
                            tracing::info!("feed interrupted ({e}), re-subscribing");
                            if let Err(e) = this.reconnect(generation, &e).await {
                                let _ = tx.send(Err(e));
                                return;
                            }
                            continue 'resubscribe;
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                        None => return,
                    }
                }
            }
        });
        ReconnectingSubscription { rx }
    }

    /// Runs a side-effecting action at most once.
    ///
    /// `start` begins the action. When it fails with a connection error, the
    /// action may or may not have happened: after a reconnection and
    /// `logical_retry_check_delay`, `has_started` is asked. If it reports the
    /// action done, `on_confirmed` runs and `Ok(None)` is returned; otherwise
    /// `start` runs again, up to `logical_retry_attempts` more times. A
    /// successful `start` also runs `on_confirmed` and returns its value.
    ///
    /// # Errors
    ///
    /// Errors from `start` other than connection errors, from `has_started`,
    /// or the last connection error once the attempts are used up.
    pub async fn run_with_logical_retry<T, Start, StartFut, Check, CheckFut, Confirm>(
        &self,
        start: Start,
        has_started: Check,
        on_confirmed: Confirm,
    ) -> Result<Option<T>>
    where
        Start: Fn(Proxy) -> StartFut,
        StartFut: Future<Output = Result<T>>,
        Check: Fn(Proxy) -> CheckFut,
        CheckFut: Future<Output = Result<bool>>,
        Confirm: FnOnce(),
    {
        let config = &self.inner.client.config;
        let mut retries_left = config.logical_retry_attempts;
        loop {
            let (proxy, generation) = self.current().await?;
            let error = match start(proxy).await {
                Ok(value) => {
                    on_confirmed();
                    return Ok(Some(value));
                }
                Err(e) if e.is_connection_error() => e,
                Err(e) => return Err(e),
            };

            tracing::warn!("could not confirm the action started: {error}");
            self.reconnect(generation, &error).await?;
            tokio::time::sleep(config.logical_retry_check_delay).await;

            let started = loop {
                let (proxy, generation) = self.current().await?;
                match has_started(proxy).await {
                    Ok(started) => break started,
                    Err(e) if e.is_connection_error() => self.reconnect(generation, &e).await?,
                    Err(e) => return Err(e),
                }
            };
            if started {
                tracing::info!("the action was found completed, not starting it again");
                on_confirmed();
                return Ok(None);
            }
            if retries_left == 0 {
                return Err(error);
            }
            retries_left -= 1;
            tracing::info!("the action did not happen, starting it again");
        }
    }

    /// Closes the live connection gracefully and stops every feed.
    pub async fn close(&self) {
        self.inner.closed.cancel();
        self.inner.supervisor.stop();
        let connection = self.lock().connection.take();
        if let Some(connection) = connection {
            connection.close().await;
        }
    }
}

impl std::fmt::Debug for ReconnectingProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.lock();
        f.debug_struct("ReconnectingProxy")
            .field("addresses", &self.inner.addresses)
            .field("index", &current.index)
            .field("generation", &current.generation)
            .field("connected", &current.connection.is_some())
            .finish_non_exhaustive()
    }
}

/// Values of a feed followed with [`ReconnectingProxy::observe`]. Dropping it
/// stops following.
pub struct ReconnectingSubscription<T> {
    rx: mpsc::UnboundedReceiver<Result<T>>,
}

impl<T> Unpin for ReconnectingSubscription<T> {}

impl<T> ReconnectingSubscription<T> {
    pub async fn recv(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }
}

impl<T> Stream for ReconnectingSubscription<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for ReconnectingSubscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectingSubscription").finish_non_exhaustive()
    }
}

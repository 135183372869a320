//! In-process broker.
//!
//! Queues live in a single map behind a mutex. Each attached consumer gets an
//! unbounded channel drained by its own task, so delivery is sequential per
//! queue. Temporary queues disappear with the connection that created them.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    BrokerAddress, Connector, Consumer, Credentials, MessageHandler, Producer, Transport,
    TransportMessage, VALIDATED_USER,
};
use crate::{Error, ErrorKind, Result};

/// A set of brokers reachable by address, standing in for the network.
#[derive(Default)]
pub struct MemoryNetwork {
    brokers: DashMap<BrokerAddress, Arc<MemoryBroker>, RandomState>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Starts a broker at `address`, replacing any previous one.
    pub fn add_broker(&self, address: impl Into<BrokerAddress>) -> Arc<MemoryBroker> {
        let address = address.into();
        let broker = Arc::new(MemoryBroker::new(address.clone()));
        self.brokers.insert(address, broker.clone());
        broker
    }

    #[must_use]
    pub fn broker(&self, address: &BrokerAddress) -> Option<Arc<MemoryBroker>> {
        self.brokers.get(address).map(|b| b.clone())
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn connect(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Transport>> {
        let broker = self.broker(address).ok_or_else(|| {
            Error::new(
                ErrorKind::ConnectFailed,
                format!("no broker listening at {address}"),
            )
        })?;
        broker.connect(credentials)
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("brokers", &self.brokers.len())
            .finish()
    }
}

struct Queue {
    owner: u64,
    pending: VecDeque<TransportMessage>,
    consumer: Option<(u64, mpsc::UnboundedSender<TransportMessage>)>,
}

struct BrokerInner {
    running: bool,
    queues: HashMap<String, Queue, RandomState>,
    connections: HashMap<u64, CancellationToken, RandomState>,
}

pub struct MemoryBroker {
    address: BrokerAddress,
    users: DashMap<String, String, RandomState>,
    inner: Mutex<BrokerInner>,
    next_id: AtomicU64,
    redeliver: AtomicBool,
}

impl MemoryBroker {
    fn new(address: BrokerAddress) -> Self {
        Self {
            address,
            users: DashMap::default(),
            inner: Mutex::new(BrokerInner {
                running: true,
                queues: HashMap::default(),
                connections: HashMap::default(),
            }),
            next_id: AtomicU64::new(1),
            redeliver: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.users.insert(username.into(), password.into());
    }

    /// Opens a connection after checking the credentials.
    ///
    /// # Errors
    ///
    /// `ConnectFailed` while stopped, `AuthenticationFailed` on a bad login.
    pub fn connect(self: &Arc<Self>, credentials: &Credentials) -> Result<Arc<dyn Transport>> {
        let mut inner = self.lock();
        if !inner.running {
            return Err(Error::new(
                ErrorKind::ConnectFailed,
                format!("broker {} is not running", self.address),
            ));
        }
        match self.users.get(&credentials.username) {
            Some(password) if *password == credentials.password => {}
            _ => {
                return Err(Error::new(
                    ErrorKind::AuthenticationFailed,
                    format!("invalid login for user {}", credentials.username),
                ));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let token = CancellationToken::new();
        inner.connections.insert(id, token.clone());
        tracing::debug!(
            "broker {}: connection {id} opened by {}",
            self.address,
            credentials.username
        );

        Ok(Arc::new(MemoryTransport {
            broker: self.clone(),
            id,
            username: credentials.username.clone(),
            token,
        }))
    }

    /// Simulates a broker crash: every connection drops and all queues are lost.
    /// New connections are refused until [`start`](Self::start).
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.running = false;
        inner.queues.clear();
        for (_, token) in inner.connections.drain() {
            token.cancel();
        }
        tracing::info!("broker {} stopped", self.address);
    }

    pub fn start(&self) {
        self.lock().running = true;
        tracing::info!("broker {} started", self.address);
    }

    /// Drops every open connection while staying up.
    pub fn sever_connections(&self) {
        let ids: Vec<u64> = self.lock().connections.keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
    }

    /// Delivers every message sent from now on twice, the way an
    /// at-least-once broker may after a failover.
    pub fn set_redelivery(&self, enabled: bool) {
        self.redeliver.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    #[must_use]
    pub fn queue_exists(&self, address: &str) -> bool {
        self.lock().queues.contains_key(address)
    }

    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    fn disconnect(&self, id: u64) {
        let mut inner = self.lock();
        if let Some(token) = inner.connections.remove(&id) {
            token.cancel();
            inner.queues.retain(|_, queue| queue.owner != id);
            tracing::debug!("broker {}: connection {id} closed", self.address);
        }
    }

    fn create_queue(&self, owner: u64, address: &str) -> Result<()> {
        let mut inner = self.lock();
        if inner.queues.contains_key(address) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("queue {address} already exists"),
            ));
        }
        inner.queues.insert(
            address.to_string(),
            Queue {
                owner,
                pending: VecDeque::new(),
                consumer: None,
            },
        );
        Ok(())
    }

    fn delete_queue(&self, address: &str) -> Result<()> {
        match self.lock().queues.remove(address) {
            Some(_) => Ok(()),
            None => Err(queue_not_found(address)),
        }
    }

    fn attach(
        self: &Arc<Self>,
        address: &str,
        handler: MessageHandler,
        token: CancellationToken,
    ) -> Result<MemoryConsumer> {
        let mut inner = self.lock();
        let queue = inner
            .queues
            .get_mut(address)
            .ok_or_else(|| queue_not_found(address))?;
        if queue.consumer.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("queue {address} already has a consumer"),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let (tx, mut rx) = mpsc::unbounded_channel();
        for msg in queue.pending.drain(..) {
            let _ = tx.send(msg);
        }
        queue.consumer = Some((id, tx));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => handler(msg),
                        None => break,
                    },
                }
            }
        });

        Ok(MemoryConsumer {
            broker: Arc::downgrade(self),
            address: address.to_string(),
            id,
            closed: AtomicBool::new(false),
        })
    }

    fn detach(&self, address: &str, consumer_id: u64) {
        let mut inner = self.lock();
        if let Some(queue) = inner.queues.get_mut(address)
            && queue.consumer.as_ref().is_some_and(|(id, _)| *id == consumer_id)
        {
            queue.consumer = None;
        }
    }

    fn route(&self, sender: &str, destination: &str, mut msg: TransportMessage) -> Result<()> {
        let mut inner = self.lock();
        if !inner.running {
            return Err(Error::new(
                ErrorKind::ConnectionLost,
                format!("broker {} is not running", self.address),
            ));
        }
        msg.put_string(VALIDATED_USER, sender);

        let queue = inner
            .queues
            .get_mut(destination)
            .ok_or_else(|| queue_not_found(destination))?;
        let copies = if self.redeliver.load(Ordering::Acquire) {
            vec![msg.clone(), msg]
        } else {
            vec![msg]
        };
        for msg in copies {
            match &queue.consumer {
                Some((_, tx)) => {
                    if let Err(mpsc::error::SendError(msg)) = tx.send(msg) {
                        queue.consumer = None;
                        queue.pending.push_back(msg);
                    }
                }
                None => queue.pending.push_back(msg),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn queue_not_found(address: &str) -> Error {
    Error::new(
        ErrorKind::QueueNotFound,
        format!("queue {address} does not exist"),
    )
}

fn connection_lost() -> Error {
    Error::new(ErrorKind::ConnectionLost, "connection to broker closed")
}

struct MemoryTransport {
    broker: Arc<MemoryBroker>,
    id: u64,
    username: String,
    token: CancellationToken,
}

impl MemoryTransport {
    fn check_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(connection_lost())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn username(&self) -> &str {
        &self.username
    }

    async fn create_queue(&self, address: &str) -> Result<()> {
        self.check_open()?;
        self.broker.create_queue(self.id, address)
    }

    async fn delete_queue(&self, address: &str) -> Result<()> {
        self.check_open()?;
        self.broker.delete_queue(address)
    }

    async fn create_consumer(
        &self,
        address: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Consumer>> {
        self.check_open()?;
        let consumer = self.broker.attach(address, handler, self.token.clone())?;
        Ok(Box::new(consumer))
    }

    async fn create_producer(&self) -> Result<Box<dyn Producer>> {
        self.check_open()?;
        Ok(Box::new(MemoryProducer {
            broker: self.broker.clone(),
            username: self.username.clone(),
            token: self.token.clone(),
        }))
    }

    async fn close(&self, _graceful: bool) {
        // Sends are synchronous here, so there is nothing to drain.
        self.broker.disconnect(self.id);
    }

    fn closed(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.broker.disconnect(self.id);
    }
}

struct MemoryConsumer {
    broker: Weak<MemoryBroker>,
    address: String,
    id: u64,
    closed: AtomicBool,
}

impl Consumer for MemoryConsumer {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel)
            && let Some(broker) = self.broker.upgrade()
        {
            broker.detach(&self.address, self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemoryProducer {
    broker: Arc<MemoryBroker>,
    username: String,
    token: CancellationToken,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, destination: &str, message: TransportMessage) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(connection_lost());
        }
        self.broker.route(&self.username, destination, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn network() -> (Arc<MemoryNetwork>, Arc<MemoryBroker>) {
        let network = MemoryNetwork::new();
        let broker = network.add_broker("broker-a");
        broker.add_user("alice", "pw");
        (network, broker)
    }

    fn collector() -> (MessageHandler, mpsc::UnboundedReceiver<TransportMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |msg| {
            let _ = tx.send(msg);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_queued_before_consumer() {
        let (network, _broker) = network();
        let transport = network
            .connect(&"broker-a".into(), &Credentials::new("alice", "pw"))
            .await
            .unwrap();

        transport.create_queue("q").await.unwrap();
        let producer = transport.create_producer().await.unwrap();
        for i in 0..3 {
            let mut msg = TransportMessage::default();
            msg.put_int("n", i);
            producer.send("q", msg).await.unwrap();
        }

        let (handler, mut rx) = collector();
        let _consumer = transport.create_consumer("q", handler).await.unwrap();
        for i in 0..3 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.get_int("n"), Some(i));
            assert_eq!(msg.get_string(VALIDATED_USER), Some("alice"));
        }
    }

    #[tokio::test]
    async fn test_redelivery() {
        let (network, broker) = network();
        let transport = network
            .connect(&"broker-a".into(), &Credentials::new("alice", "pw"))
            .await
            .unwrap();
        transport.create_queue("q").await.unwrap();
        let (handler, mut rx) = collector();
        let _consumer = transport.create_consumer("q", handler).await.unwrap();
        let producer = transport.create_producer().await.unwrap();

        broker.set_redelivery(true);
        let mut msg = TransportMessage::default();
        msg.put_int("n", 1);
        producer.send("q", msg).await.unwrap();
        broker.set_redelivery(false);
        let mut msg = TransportMessage::default();
        msg.put_int("n", 2);
        producer.send("q", msg).await.unwrap();

        for expected in [1, 1, 2] {
            assert_eq!(rx.recv().await.unwrap().get_int("n"), Some(expected));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_authentication_and_missing_queue() {
        let (network, _broker) = network();
        let err = network
            .connect(&"broker-a".into(), &Credentials::new("alice", "nope"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::AuthenticationFailed);

        let err = network
            .connect(&"broker-b".into(), &Credentials::new("alice", "pw"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::ConnectFailed);

        let transport = network
            .connect(&"broker-a".into(), &Credentials::new("alice", "pw"))
            .await
            .unwrap();
        let producer = transport.create_producer().await.unwrap();
        let err = producer
            .send("missing", TransportMessage::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueNotFound);
    }

    #[tokio::test]
    async fn test_stop_drops_connections_and_queues() {
        let (network, broker) = network();
        let transport = network
            .connect(&"broker-a".into(), &Credentials::new("alice", "pw"))
            .await
            .unwrap();
        transport.create_queue("temp").await.unwrap();
        assert!(broker.queue_exists("temp"));

        broker.stop();
        tokio::time::timeout(Duration::from_secs(1), transport.closed().cancelled())
            .await
            .unwrap();
        assert!(transport.is_closed());
        assert!(!broker.queue_exists("temp"));
        assert!(
            network
                .connect(&"broker-a".into(), &Credentials::new("alice", "pw"))
                .await
                .is_err()
        );

        broker.start();
        let transport = network
            .connect(&"broker-a".into(), &Credentials::new("alice", "pw"))
            .await
            .unwrap();
        transport.close(true).await;
        assert_eq!(broker.connection_count(), 0);
    }
}

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mqrpc::{
    Result, Router, Server, ServerConfig,
    msg::RPC_SERVER_QUEUE_NAME,
    transport::{
        BrokerAddress, Connector, Consumer, Credentials, MessageHandler, Producer, Transport,
        TransportMessage,
        memory::{MemoryBroker, MemoryNetwork},
    },
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";

pub fn credentials() -> Credentials {
    Credentials::new(USER, PASSWORD)
}

/// A running broker with the server and client users registered.
pub fn add_broker(network: &MemoryNetwork, address: &str) -> Arc<MemoryBroker> {
    let broker = network.add_broker(address);
    broker.add_user("server", "server-secret");
    broker.add_user(USER, PASSWORD);
    broker
}

pub async fn start_server(broker: &Arc<MemoryBroker>, router: Router, config: ServerConfig) -> Server {
    let transport = broker
        .connect(&Credentials::new("server", "server-secret"))
        .unwrap();
    Server::start(transport, router, config).await.unwrap()
}

/// What the client did on the wire, across all its connections.
#[derive(Default)]
pub struct Recording {
    pub sends: Mutex<Vec<String>>,
    pub deletes: Mutex<Vec<String>>,
    pub connects: Mutex<Vec<(BrokerAddress, Instant)>>,
}

impl Recording {
    pub fn requests(&self) -> usize {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .filter(|destination| *destination == RPC_SERVER_QUEUE_NAME)
            .count()
    }

    pub fn deletes_of(&self, address: &str) -> usize {
        self.deletes
            .lock()
            .unwrap()
            .iter()
            .filter(|deleted| *deleted == address)
            .count()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }
}

/// Connector over a [`MemoryNetwork`] recording every transport operation.
pub struct RecordingConnector {
    pub network: Arc<MemoryNetwork>,
    pub recording: Arc<Recording>,
}

impl RecordingConnector {
    pub fn new(network: Arc<MemoryNetwork>) -> Arc<Self> {
        Arc::new(Self {
            network,
            recording: Arc::default(),
        })
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    async fn connect(
        &self,
        address: &BrokerAddress,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Transport>> {
        self.recording
            .connects
            .lock()
            .unwrap()
            .push((address.clone(), Instant::now()));
        let inner = self.network.connect(address, credentials).await?;
        Ok(Arc::new(RecordingTransport {
            inner,
            recording: self.recording.clone(),
        }))
    }
}

struct RecordingTransport {
    inner: Arc<dyn Transport>,
    recording: Arc<Recording>,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn username(&self) -> &str {
        self.inner.username()
    }

    async fn create_queue(&self, address: &str) -> Result<()> {
        self.inner.create_queue(address).await
    }

    async fn delete_queue(&self, address: &str) -> Result<()> {
        self.recording
            .deletes
            .lock()
            .unwrap()
            .push(address.to_string());
        self.inner.delete_queue(address).await
    }

    async fn create_consumer(
        &self,
        address: &str,
        handler: MessageHandler,
    ) -> Result<Box<dyn Consumer>> {
        self.inner.create_consumer(address, handler).await
    }

    async fn create_producer(&self) -> Result<Box<dyn Producer>> {
        let inner = self.inner.create_producer().await?;
        Ok(Box::new(RecordingProducer {
            inner,
            recording: self.recording.clone(),
        }))
    }

    async fn close(&self, graceful: bool) {
        self.inner.close(graceful).await;
    }

    fn closed(&self) -> CancellationToken {
        self.inner.closed()
    }
}

struct RecordingProducer {
    inner: Box<dyn Producer>,
    recording: Arc<Recording>,
}

#[async_trait]
impl Producer for RecordingProducer {
    async fn send(&self, destination: &str, message: TransportMessage) -> Result<()> {
        self.recording
            .sends
            .lock()
            .unwrap()
            .push(destination.to_string());
        self.inner.send(destination, message).await
    }
}

/// Collects what the `tracing` macros emit on the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Installs the capture as the thread's default subscriber until the
    /// guard drops. `#[tokio::test]` runs every task on that thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    pub fn lines_with(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|line| line.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

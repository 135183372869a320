#![forbid(unsafe_code)]

mod common;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{RecordingConnector, add_broker, credentials, start_server};
use mqrpc::{
    Client, ClientConfig, Connection, Error, ErrorKind, Proxy, ReconnectListener,
    ReconnectingProxy, RemoteStream, Router, Server, ServerConfig,
    transport::{
        BrokerAddress,
        memory::{MemoryBroker, MemoryNetwork},
    },
};
use tokio::{sync::Notify, time::Instant};

#[mqrpc::service]
trait Bank {
    /// Name of the server answering.
    async fn name(&self) -> mqrpc::Result<String>;

    async fn stall(&self) -> mqrpc::Result<()>;

    #[rpc(no_retry)]
    async fn withdraw(&self, amount: u64) -> mqrpc::Result<u64>;

    async fn transfer(&self, id: u64, amount: u64) -> mqrpc::Result<u64>;

    async fn has_transfer(&self, id: u64) -> mqrpc::Result<bool>;

    #[rpc(streams)]
    async fn ticks(&self) -> mqrpc::Result<RemoteStream<String>>;
}

/// Makes the next transfer drop every connection of `broker`, before or
/// after the transfer is applied.
struct Sabotage {
    broker: Arc<MemoryBroker>,
    after_effect: bool,
}

/// State shared by the servers of every broker.
#[derive(Default)]
struct Ledger {
    transfers: Mutex<HashMap<u64, usize>>,
    sabotage: Mutex<Option<Sabotage>>,
    entered: Notify,
}

impl Ledger {
    fn applied(&self, id: u64) -> usize {
        self.transfers
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or_default()
    }
}

struct BankServer {
    name: String,
    ledger: Arc<Ledger>,
}

impl Bank for BankServer {
    async fn name(&self) -> mqrpc::Result<String> {
        Ok(self.name.clone())
    }

    async fn stall(&self) -> mqrpc::Result<()> {
        self.ledger.entered.notify_one();
        std::future::pending().await
    }

    async fn withdraw(&self, amount: u64) -> mqrpc::Result<u64> {
        Ok(amount)
    }

    async fn transfer(&self, id: u64, amount: u64) -> mqrpc::Result<u64> {
        let sabotage = self.ledger.sabotage.lock().unwrap().take();
        if let Some(Sabotage {
            broker,
            after_effect: false,
        }) = &sabotage
        {
            broker.sever_connections();
            return Err(Error::new(ErrorKind::ConnectionLost, "lost before applying"));
        }
        *self.ledger.transfers.lock().unwrap().entry(id).or_default() += 1;
        if let Some(Sabotage { broker, .. }) = &sabotage {
            broker.sever_connections();
        }
        Ok(amount)
    }

    async fn has_transfer(&self, id: u64) -> mqrpc::Result<bool> {
        Ok(self.ledger.applied(id) > 0)
    }

    async fn ticks(&self) -> mqrpc::Result<RemoteStream<String>> {
        let (tx, stream) = mqrpc::channel();
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut index = 0;
            while tx.send(format!("{name}-{index}")).is_ok() {
                index += 1;
                tokio::select! {
                    () = tx.closed() => break,
                    () = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
        });
        Ok(stream)
    }
}

#[derive(Default)]
struct Counter {
    disconnects: AtomicUsize,
    reconnects: AtomicUsize,
}

impl ReconnectListener for Counter {
    fn on_disconnect(&self, _error: &Error) {
        self.disconnects.fetch_add(1, Ordering::AcqRel);
    }

    fn on_reconnect(&self, _connection: &Connection) {
        self.reconnects.fetch_add(1, Ordering::AcqRel);
    }
}

struct Env {
    brokers: Vec<Arc<MemoryBroker>>,
    _servers: Vec<Server>,
    ledger: Arc<Ledger>,
    connector: Arc<RecordingConnector>,
}

async fn setup(names: &[&str]) -> Env {
    let network = MemoryNetwork::new();
    let ledger = Arc::new(Ledger::default());
    let mut brokers = vec![];
    let mut servers = vec![];
    for name in names {
        let broker = add_broker(&network, &format!("broker-{name}"));
        let mut router = Router::default();
        Arc::new(BankServer {
            name: name.to_string(),
            ledger: ledger.clone(),
        })
        .mqrpc_export(&mut router);
        servers.push(start_server(&broker, router, ServerConfig::default()).await);
        brokers.push(broker);
    }
    Env {
        brokers,
        _servers: servers,
        ledger,
        connector: RecordingConnector::new(network),
    }
}

impl Env {
    async fn connect(
        &self,
        config: ClientConfig,
        listener: Option<Arc<dyn ReconnectListener>>,
    ) -> ReconnectingProxy {
        let addresses = self
            .brokers
            .iter()
            .map(|broker| broker.address().clone())
            .collect();
        ReconnectingProxy::connect(
            Client::new(config),
            self.connector.clone(),
            addresses,
            credentials(),
            listener,
        )
        .await
        .unwrap()
    }
}

fn config() -> ClientConfig {
    ClientConfig {
        connection_retry_interval: Duration::from_secs(1),
        connection_retry_interval_multiplier: 2.0,
        logical_retry_check_delay: Duration::from_secs(1),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_failover_retries_the_call() {
    let env = setup(&["a", "b"]).await;
    let counter = Arc::new(Counter::default());
    let listener: Arc<dyn ReconnectListener> = counter.clone();
    let proxy = env.connect(config(), Some(listener)).await;
    assert_eq!(proxy.name().await.unwrap(), "a");

    env.brokers[0].stop();
    assert_eq!(proxy.name().await.unwrap(), "b");
    assert_eq!(proxy.current_address(), &BrokerAddress::from("broker-b"));
    assert_eq!(counter.disconnects.load(Ordering::Acquire), 1);
    assert_eq!(counter.reconnects.load(Ordering::Acquire), 1);

    proxy.close().await;
    let err = proxy.name().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProxyClosed);
}

#[tokio::test(start_paused = true)]
async fn test_no_retry_method_is_not_repeated() {
    let env = setup(&["a", "b"]).await;
    let proxy = env.connect(config(), None).await;
    assert_eq!(proxy.withdraw(5).await.unwrap(), 5);

    env.brokers[0].stop();
    let err = proxy.withdraw(5).await.unwrap_err();
    assert!(err.is_connection_error());
    // the wrapper reconnected anyway; the next call goes through.
    assert_eq!(proxy.current_address(), &BrokerAddress::from("broker-b"));
    assert_eq!(proxy.withdraw(5).await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_reconnect_attempts() {
    let env = setup(&["a"]).await;
    let proxy = env
        .connect(
            ClientConfig {
                max_reconnect_attempts: Some(3),
                ..config()
            },
            None,
        )
        .await;

    let call = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.stall().await }
    });
    env.ledger.entered.notified().await;
    let severed = Instant::now();
    env.brokers[0].stop();

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::MaxRetriesExceeded);
    assert_eq!(err.msg, "Max number of reconnect attempts (3) reached");

    let times = env.connector.recording.connect_times();
    assert_eq!(times.len(), 4);
    let mut previous = severed;
    for (at, expected) in times[1..].iter().zip([1, 2, 4]) {
        let wait = *at - previous;
        let expected = Duration::from_secs(expected);
        assert!(
            wait >= expected && wait < expected + Duration::from_millis(50),
            "waited {wait:?}, expected {expected:?}"
        );
        previous = *at;
    }
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_tries_every_address() {
    let env = setup(&["a", "b"]).await;
    env.brokers[0].stop();
    let proxy = env.connect(config(), None).await;
    assert_eq!(proxy.current_address(), &BrokerAddress::from("broker-b"));
    assert_eq!(proxy.name().await.unwrap(), "b");

    env.brokers[1].stop();
    let err = ReconnectingProxy::connect(
        Client::new(config()),
        env.connector.clone(),
        env.brokers
            .iter()
            .map(|broker| broker.address().clone())
            .collect(),
        credentials(),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ConnectFailed);
    assert_eq!(
        err.msg,
        "Cannot connect to server(s). Tried with all available servers."
    );
}

#[tokio::test(start_paused = true)]
async fn test_logical_retry_when_confirmation_is_lost() {
    let env = setup(&["a", "b"]).await;
    let proxy = env.connect(config(), None).await;
    *env.ledger.sabotage.lock().unwrap() = Some(Sabotage {
        broker: env.brokers[0].clone(),
        after_effect: true,
    });

    let confirmed = AtomicBool::new(false);
    let result = proxy
        .run_with_logical_retry(
            |proxy: Proxy| async move { proxy.transfer(1, 100).await },
            |proxy: Proxy| async move { proxy.has_transfer(1).await },
            || confirmed.store(true, Ordering::Release),
        )
        .await
        .unwrap();
    assert_eq!(result, None);
    assert!(confirmed.load(Ordering::Acquire));
    assert_eq!(env.ledger.applied(1), 1);
    assert_eq!(proxy.current_address(), &BrokerAddress::from("broker-b"));
}

#[tokio::test(start_paused = true)]
async fn test_logical_retry_when_request_is_lost() {
    let env = setup(&["a", "b"]).await;
    let proxy = env.connect(config(), None).await;
    *env.ledger.sabotage.lock().unwrap() = Some(Sabotage {
        broker: env.brokers[0].clone(),
        after_effect: false,
    });

    let confirmed = AtomicBool::new(false);
    let result = proxy
        .run_with_logical_retry(
            |proxy: Proxy| async move { proxy.transfer(2, 100).await },
            |proxy: Proxy| async move { proxy.has_transfer(2).await },
            || confirmed.store(true, Ordering::Release),
        )
        .await
        .unwrap();
    assert_eq!(result, Some(100));
    assert!(confirmed.load(Ordering::Acquire));
    assert_eq!(env.ledger.applied(2), 1);
}

#[tokio::test(start_paused = true)]
async fn test_observe_resubscribes_after_failover() {
    let env = setup(&["a", "b"]).await;
    let proxy = env.connect(config(), None).await;

    let mut feed = proxy.observe(|proxy: Proxy| async move { proxy.ticks().await });
    assert_eq!(feed.recv().await.unwrap().unwrap(), "a-0");
    assert_eq!(feed.recv().await.unwrap().unwrap(), "a-1");

    env.brokers[0].stop();
    let mut next = feed.recv().await.unwrap().unwrap();
    while next.starts_with("a-") {
        next = feed.recv().await.unwrap().unwrap();
    }
    assert_eq!(next, "b-0");
    assert_eq!(feed.recv().await.unwrap().unwrap(), "b-1");

    drop(feed);
    proxy.close().await;
}

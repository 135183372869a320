#![forbid(unsafe_code)]

mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use common::{LogCapture, RecordingConnector, add_broker, credentials, start_server};
use mqrpc::{
    Client, ClientConfig, Codec, ErrorKind, InvocationId, ObservationBody, Proxy, RemoteStream,
    Router, RpcObservation, Server, ServerConfig, ServerToClient, StreamEvent,
    transport::{
        Credentials, Producer, Transport, TransportMessage,
        memory::{MemoryBroker, MemoryNetwork},
    },
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, mqrpc::BindStreams, Debug)]
struct Pair {
    first: RemoteStream<u32>,
    second: RemoteStream<u32>,
}

#[mqrpc::service]
trait Feeds {
    /// Two streams on one reply queue, each pushing its values then completing.
    #[rpc(streams)]
    async fn pair(&self, first: Vec<u32>, second: Vec<u32>) -> mqrpc::Result<Pair>;

    #[rpc(streams)]
    async fn numbers(&self, count: u32) -> mqrpc::Result<RemoteStream<u32>>;

    /// Pushes until the client goes away.
    #[rpc(streams)]
    async fn endless(&self) -> mqrpc::Result<RemoteStream<u64>>;

    #[rpc(streams)]
    async fn nested(&self, names: Vec<String>) -> mqrpc::Result<RemoteStream<RemoteStream<String>>>;

    #[rpc(streams)]
    async fn failing(&self) -> mqrpc::Result<RemoteStream<u32>>;
}

#[derive(Default)]
struct FeedsImpl {
    endless_stopped: Arc<AtomicBool>,
    numbers_calls: AtomicUsize,
}

fn pushed<T: Send + 'static>(values: impl IntoIterator<Item = T>) -> RemoteStream<T> {
    let (tx, stream) = mqrpc::channel();
    for value in values {
        tx.send(value).unwrap();
    }
    tx.complete();
    stream
}

impl Feeds for FeedsImpl {
    async fn pair(&self, first: Vec<u32>, second: Vec<u32>) -> mqrpc::Result<Pair> {
        Ok(Pair {
            first: pushed(first),
            second: pushed(second),
        })
    }

    async fn numbers(&self, count: u32) -> mqrpc::Result<RemoteStream<u32>> {
        self.numbers_calls.fetch_add(1, Ordering::AcqRel);
        Ok(pushed(0..count))
    }

    async fn endless(&self) -> mqrpc::Result<RemoteStream<u64>> {
        let (tx, stream) = mqrpc::channel();
        let stopped = self.endless_stopped.clone();
        tokio::spawn(async move {
            let mut value = 0u64;
            while tx.send(value).is_ok() {
                value += 1;
                tokio::select! {
                    () = tx.closed() => break,
                    () = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
            }
            stopped.store(true, Ordering::Release);
        });
        Ok(stream)
    }

    async fn nested(&self, names: Vec<String>) -> mqrpc::Result<RemoteStream<RemoteStream<String>>> {
        Ok(pushed(names.into_iter().map(|name| {
            pushed([format!("hello {name}"), format!("bye {name}")])
        })))
    }

    async fn failing(&self) -> mqrpc::Result<RemoteStream<u32>> {
        let (tx, stream) = mqrpc::channel();
        tx.send(7).unwrap();
        tx.error(mqrpc::Error::new(ErrorKind::Application, "feed broke"));
        Ok(stream)
    }
}

struct Env {
    broker: Arc<MemoryBroker>,
    server: Server,
    feeds: Arc<FeedsImpl>,
    connector: Arc<RecordingConnector>,
}

async fn setup() -> Env {
    let network = MemoryNetwork::new();
    let broker = add_broker(&network, "broker-a");
    let feeds = Arc::new(FeedsImpl::default());
    let mut router = Router::default();
    feeds.clone().mqrpc_export(&mut router);
    let server = start_server(&broker, router, ServerConfig::default()).await;
    Env {
        broker,
        server,
        feeds,
        connector: RecordingConnector::new(network),
    }
}

impl Env {
    async fn proxy(&self, config: ClientConfig) -> Proxy {
        Client::new(config)
            .connect(&*self.connector, self.broker.address(), &credentials())
            .await
            .unwrap()
            .proxy()
            .clone()
    }

    /// Reply queues of streaming calls still on the broker.
    fn stream_queues(&self, proxy: &Proxy) -> Vec<String> {
        self.broker
            .queue_names()
            .into_iter()
            .filter(|name| name.starts_with("rpc.client.") && name != proxy.reply_address())
            .collect()
    }
}

async fn collect<T>(stream: RemoteStream<T>) -> Vec<T>
where
    T: serde::de::DeserializeOwned + mqrpc::BindStreams,
{
    let mut subscription = stream.subscribe().unwrap();
    let mut values = vec![];
    while let Some(value) = subscription.recv().await {
        values.push(value.unwrap());
    }
    values
}

#[tokio::test]
async fn test_two_streams_on_one_queue() {
    for use_msgpack in [true, false] {
        let env = setup().await;
        let proxy = env
            .proxy(ClientConfig {
                use_msgpack,
                ..Default::default()
            })
            .await;

        let pair = proxy.pair(vec![1, 2, 3], vec![10]).await.unwrap();
        assert_eq!(pair.first.handle(), Some(0));
        assert_eq!(pair.second.handle(), Some(1));
        assert_eq!(env.stream_queues(&proxy).len(), 1);
        assert_eq!(proxy.registry().live_count(), 1);

        let first = collect(pair.first).await;
        let second = collect(pair.second).await;
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(second, vec![10]);
    }
}

#[tokio::test]
async fn test_stream_isolation() {
    let env = setup().await;
    let proxy = env.proxy(ClientConfig::default()).await;

    let pair = proxy.pair(vec![1, 2, 3], vec![10, 11]).await.unwrap();
    // let every event reach the client before anyone subscribes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(collect(pair.second).await, vec![10, 11]);
    pair.first.not_used();
}

#[tokio::test]
async fn test_teardown_deletes_queue_once() {
    let env = setup().await;
    let proxy = env.proxy(ClientConfig::default()).await;

    let stream = proxy.numbers(3).await.unwrap();
    let queues = env.stream_queues(&proxy);
    assert_eq!(queues.len(), 1);
    assert_eq!(collect(stream).await, vec![0, 1, 2]);

    proxy.reap().await;
    proxy.reap().await;
    assert!(env.stream_queues(&proxy).is_empty());
    assert_eq!(env.connector.recording.deletes_of(&queues[0]), 1);
    assert_eq!(proxy.registry().live_count(), 0);
    assert_eq!(proxy.registry().keep_alive_count(), 0);
}

#[tokio::test]
async fn test_unsubscribe_stops_the_server() {
    let env = setup().await;
    let proxy = env.proxy(ClientConfig::default()).await;

    let stream = proxy.endless().await.unwrap();
    let mut subscription = stream.subscribe().unwrap();
    for expected in 0..3u64 {
        assert_eq!(subscription.recv().await.unwrap().unwrap(), expected);
    }
    assert_eq!(proxy.registry().keep_alive_count(), 1);
    drop(subscription);
    assert_eq!(proxy.registry().keep_alive_count(), 0);

    proxy.reap().await;
    assert!(env.stream_queues(&proxy).is_empty());
    tokio::time::timeout(Duration::from_secs(5), async {
        while env.server.active_streams() > 0 || !env.feeds.endless_stopped.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_dropped_stream_is_collected() {
    let logs = LogCapture::default();
    let _guard = logs.install();
    let env = setup().await;
    let proxy = env.proxy(ClientConfig::default()).await;

    let stream = proxy.numbers(3).await.unwrap();
    assert_eq!(env.stream_queues(&proxy).len(), 1);
    assert!(logs.lines_with("never subscribed").is_empty());
    drop(stream);
    assert_eq!(proxy.registry().live_count(), 0);

    let warnings = logs.lines_with("never subscribed");
    assert_eq!(warnings.len(), 1, "{}", logs.contents());
    assert!(warnings[0].contains("WARN"));
    assert!(warnings[0].contains("RPC Feeds/numbers"));
    assert!(warnings[0].contains("not_used()"));

    proxy.reap().await;
    assert!(env.stream_queues(&proxy).is_empty());
}

/// An observation the server could have had in flight for a finished stream.
fn late_observation(handle: u32) -> TransportMessage {
    let body = ObservationBody {
        handle,
        event: StreamEvent::Next(Codec::Json.serialize(&99u32).unwrap()),
    };
    ServerToClient::Observation(RpcObservation {
        id: InvocationId::new(1, 1),
        codec: Codec::Json,
        body: Codec::Json.serialize(&body).unwrap().into(),
    })
    .into_message()
    .unwrap()
}

#[tokio::test]
async fn test_observation_after_teardown_is_dropped() {
    let env = setup().await;
    let proxy = env.proxy(ClientConfig::default()).await;

    let pair = proxy.pair(vec![1], vec![10]).await.unwrap();
    let queue = env.stream_queues(&proxy).remove(0);
    // both streams complete before anyone subscribes.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let transport = env
        .broker
        .connect(&Credentials::new("server", "server-secret"))
        .unwrap();
    let producer = transport.create_producer().await.unwrap();
    producer.send(&queue, late_observation(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(collect(pair.second).await, vec![10]);
    assert_eq!(collect(pair.first).await, vec![1]);
    assert_eq!(proxy.registry().live_count(), 0);

    proxy.reap().await;
    assert!(!env.broker.queue_exists(&queue));
    let err = producer
        .send(&queue, late_observation(0))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::QueueNotFound);
}

#[tokio::test]
async fn test_idle_stream_is_swept() {
    let env = setup().await;
    let proxy = env
        .proxy(ClientConfig {
            reap_interval: Duration::from_millis(20),
            unsubscribed_stream_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .await;

    let stream = proxy.numbers(3).await.unwrap();
    assert_eq!(env.stream_queues(&proxy).len(), 1);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !env.stream_queues(&proxy).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    drop(stream);
}

#[tokio::test]
async fn test_subscribing_after_the_sweep_fails_the_stream() {
    let env = setup().await;
    let proxy = env
        .proxy(ClientConfig {
            reap_interval: Duration::from_millis(20),
            unsubscribed_stream_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .await;

    let stream = proxy.endless().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !env.stream_queues(&proxy).is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // values buffered before the sweep are still handed out, then the
    // stream fails instead of completing.
    let mut subscription = stream.subscribe().unwrap();
    let mut values = 0;
    let err = loop {
        match subscription.recv().await {
            Some(Ok(_)) => values += 1,
            Some(Err(e)) => break e,
            None => panic!("swept stream completed normally after {values} values"),
        }
    };
    assert!(values > 0);
    assert_eq!(err.kind, ErrorKind::StreamClosed);
    assert!(err.msg.contains("without a subscriber"));
    assert_eq!(err.call_site.as_deref(), Some("Feeds/endless"));
    assert!(subscription.recv().await.is_none());
    assert_eq!(proxy.registry().keep_alive_count(), 0);
}

#[tokio::test]
async fn test_redelivered_messages_are_dropped() {
    let env = setup().await;
    let proxy = env.proxy(ClientConfig::default()).await;
    env.broker.set_redelivery(true);

    let stream = proxy.numbers(3).await.unwrap();
    assert_eq!(collect(stream).await, vec![0, 1, 2]);
    assert_eq!(env.feeds.numbers_calls.load(Ordering::Acquire), 1);

    let pair = proxy.pair(vec![1, 2], vec![]).await.unwrap();
    assert_eq!(collect(pair.first).await, vec![1, 2]);
    assert!(collect(pair.second).await.is_empty());

    let stream = proxy.numbers(2).await.unwrap();
    assert_eq!(collect(stream).await, vec![0, 1]);
    assert_eq!(env.feeds.numbers_calls.load(Ordering::Acquire), 2);
}

#[tokio::test]
async fn test_nested_streams() {
    let env = setup().await;
    let proxy = env.proxy(ClientConfig::default()).await;

    let outer = proxy
        .nested(vec!["Merry".to_string(), "Pippin".to_string()])
        .await
        .unwrap();
    let inners = collect(outer).await;
    assert_eq!(inners.len(), 2);
    // the inner streams live on the reply queue of the call.
    assert_eq!(env.stream_queues(&proxy).len(), 1);
    assert_eq!(proxy.registry().live_count(), 1);

    let mut greetings = vec![];
    for inner in inners {
        greetings.extend(collect(inner).await);
    }
    assert_eq!(
        greetings,
        vec!["hello Merry", "bye Merry", "hello Pippin", "bye Pippin"]
    );
}

#[tokio::test]
async fn test_stream_error() {
    let env = setup().await;
    let proxy = env.proxy(ClientConfig::default()).await;

    let mut subscription = proxy.failing().await.unwrap().subscribe().unwrap();
    assert_eq!(subscription.recv().await.unwrap().unwrap(), 7);
    let err = subscription.recv().await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Application);
    assert_eq!(err.msg, "feed broke");
    assert_eq!(err.call_site.as_deref(), Some("Feeds/failing"));
    assert!(subscription.recv().await.is_none());
    assert!(subscription.is_terminated());
}

#[tokio::test]
async fn test_connection_loss_fails_streams() {
    let env = setup().await;
    let proxy = env.proxy(ClientConfig::default()).await;

    let mut subscription = proxy.endless().await.unwrap().subscribe().unwrap();
    assert_eq!(subscription.recv().await.unwrap().unwrap(), 0);
    env.broker.stop();

    let err = loop {
        match subscription.recv().await {
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e,
            None => panic!("stream ended without an error"),
        }
    };
    assert_eq!(err.kind, ErrorKind::ConnectionLost);
}

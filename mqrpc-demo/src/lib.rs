use std::time::Duration;

use mqrpc::{Context, RemoteStream, Result};
use serde::{Deserialize, Serialize};

#[mqrpc::service]
pub trait Greeter {
    async fn greet(&self, name: String) -> Result<String>;

    /// Counts down from `from` to 1, one value per `interval`.
    #[rpc(streams)]
    async fn countdown(&self, from: u32, interval: Duration) -> Result<RemoteStream<u32>>;

    #[rpc(since = 2)]
    async fn farewell(&self, name: String) -> Result<String>;
}

#[derive(Debug, Default)]
pub struct GreeterImpl;

impl Greeter for GreeterImpl {
    async fn greet(&self, name: String) -> Result<String> {
        if let Some(ctx) = Context::current() {
            tracing::info!("{} greets {name}", ctx.user);
        }
        Ok(format!("Oh, hello {name}!"))
    }

    async fn countdown(&self, from: u32, interval: Duration) -> Result<RemoteStream<u32>> {
        let (tx, stream) = mqrpc::channel();
        tokio::spawn(async move {
            for value in (1..=from).rev() {
                if tx.send(value).is_err() {
                    return;
                }
                tokio::select! {
                    () = tx.closed() => return,
                    () = tokio::time::sleep(interval) => {}
                }
            }
            tx.complete();
        });
        Ok(stream)
    }

    async fn farewell(&self, name: String) -> Result<String> {
        Ok(format!("Goodbye, {name}."))
    }
}

/// Settings of the demo binary, read from a JSON file.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DemoConfig {
    #[serde(default)]
    pub client: mqrpc::ClientConfig,
    #[serde(default)]
    pub server: mqrpc::ServerConfig,
}

impl Default for DemoConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

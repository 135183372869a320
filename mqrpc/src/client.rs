use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::{
    Actor, Error, ErrorKind, Proxy, ReconnectingProxy, Result, Trace,
    services::MetaService,
    state::ClientState,
    transport::{BrokerAddress, Connector, Credentials},
};

/// Client settings. Every field has a default, so `{}` is a valid config.
#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct ClientConfig {
    /// Default per-call timeout; none blocks until the reply or connection
    /// loss.
    #[serde_inline_default(None)]
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde_inline_default(true)]
    pub use_msgpack: bool,
    /// Connecting to an older server fails with `UnsupportedVersion`.
    #[serde_inline_default(0)]
    pub minimum_server_protocol_version: u32,
    /// Capture a backtrace per call, reported with failures and leak warnings.
    #[serde_inline_default(false)]
    pub track_rpc_call_sites: bool,
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// Grace period before a never-subscribed reply queue is closed.
    #[serde_inline_default(Duration::from_secs(60))]
    #[serde(with = "humantime_serde")]
    pub unsubscribed_stream_timeout: Duration,
    #[serde_inline_default(4)]
    pub observation_executor_pool_size: usize,
    /// How long the watermark of a silent server is kept for dropping
    /// redelivered messages.
    #[serde_inline_default(Duration::from_secs(24 * 60 * 60))]
    #[serde(with = "humantime_serde")]
    pub deduplication_cache_expiry: Duration,
    #[serde_inline_default(10 << 20)]
    pub max_message_size: usize,
    /// None retries forever.
    #[serde_inline_default(None)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub connection_retry_interval: Duration,
    #[serde_inline_default(1.5)]
    pub connection_retry_interval_multiplier: f64,
    #[serde_inline_default(Duration::from_secs(180))]
    #[serde(with = "humantime_serde")]
    pub connection_max_retry_interval: Duration,
    /// Extra runs of the start function allowed by logical retry.
    #[serde_inline_default(2)]
    pub logical_retry_attempts: u32,
    /// Pause before asking whether an interrupted action already happened.
    #[serde_inline_default(Duration::from_secs(4))]
    #[serde(with = "humantime_serde")]
    pub logical_retry_check_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

/// Identity data stamped on every request of a connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectOptions {
    pub external_trace: Option<Trace>,
    pub impersonated_actor: Option<Actor>,
}

#[derive(Debug, Clone, Default)]
pub struct Client {
    pub config: ClientConfig,
    pub options: ConnectOptions,
}

impl Client {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            options: ConnectOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    /// Authenticates against the broker at `address`, opens the private reply
    /// queue and asks the server for its protocol version.
    ///
    /// # Errors
    ///
    /// Connection errors from the broker, `AuthenticationFailed`, or
    /// `UnsupportedVersion` when the server is older than
    /// `minimum_server_protocol_version`.
    pub async fn connect(
        &self,
        connector: &dyn Connector,
        address: &BrokerAddress,
        credentials: &Credentials,
    ) -> Result<Connection> {
        let transport = connector.connect(address, credentials).await?;
        let state = match ClientState::start(
            transport.clone(),
            self.config.clone(),
            self.options.external_trace,
            self.options.impersonated_actor.clone(),
        )
        .await
        {
            Ok(state) => state,
            Err(e) => {
                transport.close(false).await;
                return Err(e);
            }
        };
        let proxy = Proxy::new(state);

        let version = match MetaService::protocol_version(&proxy).await {
            Ok(version) => version,
            Err(e) => {
                proxy.force_close().await;
                return Err(e);
            }
        };
        proxy.set_server_protocol_version(version);

        let minimum = self.config.minimum_server_protocol_version;
        if version < minimum {
            proxy.force_close().await;
            return Err(Error::new(
                ErrorKind::UnsupportedVersion,
                format!(
                    "Requested minimum protocol version ({minimum}) is higher than the server's supported protocol version ({version})"
                ),
            ));
        }

        tracing::info!(
            "connected to {address} as {}, server protocol version {version}",
            credentials.username
        );
        Ok(Connection {
            proxy,
            address: address.clone(),
            server_protocol_version: version,
        })
    }

    /// Connects to the first reachable broker of `addresses`, then keeps
    /// reconnecting across them.
    ///
    /// # Errors
    ///
    /// `ConnectFailed` when no address accepts the first connection.
    pub async fn connect_reconnecting(
        &self,
        connector: Arc<dyn Connector>,
        addresses: Vec<BrokerAddress>,
        credentials: Credentials,
    ) -> Result<ReconnectingProxy> {
        ReconnectingProxy::connect(self.clone(), connector, addresses, credentials, None).await
    }
}

/// A live, authenticated connection.
#[derive(Debug)]
pub struct Connection {
    proxy: Proxy,
    address: BrokerAddress,
    server_protocol_version: u32,
}

impl Connection {
    /// The proxy bound to this connection. Clones share its state.
    #[must_use]
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    #[must_use]
    pub fn address(&self) -> &BrokerAddress {
        &self.address
    }

    /// Protocol version the server reported during the handshake.
    #[must_use]
    pub fn server_protocol_version(&self) -> u32 {
        self.server_protocol_version
    }

    /// Tears streams down, tells the server, deletes the reply queues and
    /// disconnects.
    pub async fn close(&self) {
        self.proxy.close().await;
    }

    /// Disconnects without any server round trip.
    pub async fn force_close(&self) {
        self.proxy.force_close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout, None);
        assert!(config.use_msgpack);
        assert_eq!(config.reap_interval, Duration::from_secs(1));
        assert_eq!(config.observation_executor_pool_size, 4);
        assert_eq!(config.deduplication_cache_expiry, Duration::from_secs(86_400));
        assert_eq!(config.max_message_size, 10 * 1024 * 1024);
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.connection_retry_interval, Duration::from_secs(5));
        assert_eq!(config.connection_max_retry_interval, Duration::from_secs(180));
        assert_eq!(config.logical_retry_attempts, 2);
    }

    #[test]
    fn test_config_from_json() {
        let config: ClientConfig = serde_json::from_value(serde_json::json!({
            "timeout": "1s 500ms",
            "max_reconnect_attempts": 3,
            "connection_retry_interval": "1s",
            "connection_retry_interval_multiplier": 2.0,
            "deduplication_cache_expiry": "1h",
        }))
        .unwrap();
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert_eq!(config.connection_retry_interval, Duration::from_secs(1));
        assert_eq!(config.deduplication_cache_expiry, Duration::from_secs(3600));
        assert!((config.connection_retry_interval_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.use_msgpack);
    }
}

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use mqrpc::{
    Client, Router, Server,
    transport::{Credentials, memory::MemoryNetwork},
};
use mqrpc_demo::{DemoConfig, Greeter, GreeterImpl};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// JSON file with `client` and `server` settings.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Name to greet.
    #[arg(short, long, default_value = "alice")]
    pub name: String,

    /// Length of the countdown stream.
    #[arg(long, default_value = "5")]
    pub count: u32,

    /// Milliseconds between countdown values.
    #[arg(long, default_value = "200")]
    pub interval_ms: u64,

    /// Use JSON instead of MessagePack.
    #[arg(long, default_value_t = false)]
    pub use_json: bool,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn run(args: Args) -> mqrpc::Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                mqrpc::Error::new(
                    mqrpc::ErrorKind::InvalidArgument,
                    format!("cannot read {}: {e}", path.display()),
                )
            })?;
            serde_json::from_str::<DemoConfig>(&text)?
        }
        None => DemoConfig::default(),
    };
    if args.use_json {
        config.client.use_msgpack = false;
    }

    let network = MemoryNetwork::new();
    let broker = network.add_broker("broker-a");
    broker.add_user("server", "server-secret");
    broker.add_user(args.name.clone(), "secret");

    let transport = broker.connect(&Credentials::new("server", "server-secret"))?;
    let mut router = Router::default();
    Arc::new(GreeterImpl).mqrpc_export(&mut router);
    let server = Server::start(transport, router, config.server.clone()).await?;
    tracing::info!(
        "serving {} on {}",
        <GreeterImpl as Greeter>::NAME,
        broker.address()
    );

    let client = Client::new(config.client.clone());
    let connection = client
        .connect(
            &*network,
            broker.address(),
            &Credentials::new(args.name.clone(), "secret"),
        )
        .await?;
    let proxy = connection.proxy();
    tracing::info!("{proxy}");

    let rsp = proxy.greet(args.name.clone()).await?;
    tracing::info!("greet rsp: {rsp}");

    let stream = proxy
        .countdown(args.count, Duration::from_millis(args.interval_ms))
        .await?;
    let mut subscription = stream.subscribe()?;
    while let Some(value) = subscription.recv().await {
        tracing::info!("countdown: {}", value?);
    }

    match proxy.farewell(args.name.clone()).await {
        Ok(rsp) => tracing::info!("farewell rsp: {rsp}"),
        Err(e) => tracing::warn!("farewell failed: {e}"),
    }

    connection.close().await;
    server.stop();
    server.join().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        tracing::error!("demo failed: {e}");
        std::process::exit(1);
    }
}

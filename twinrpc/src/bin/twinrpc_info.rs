use clap::Parser;
use std::time::Duration;
use twinrpc::{
    ChannelConfig, ClientChannel,
    services::{MetaService, MetaServiceProxy},
};

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Lists the services a twinrpc peer exposes", long_about = None)]
pub struct Args {
    /// Peer address, `host:port`.
    #[arg(default_value = "127.0.0.1:8000")]
    pub addr: String,

    /// Call timeout in seconds.
    #[arg(long, default_value_t = 5)]
    pub timeout: u64,

    /// Use JSON instead of `MessagePack`.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

async fn collect(meta: &MetaServiceProxy) -> twinrpc::Result<serde_json::Value> {
    let mut services = serde_json::Map::new();
    for service in meta.list_services().await? {
        let methods = meta.list_methods(service.clone()).await?;
        services.insert(service, methods.into());
    }
    Ok(services.into())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let args = Args::parse();

    let mut config = ChannelConfig::default().with_endpoints(args.addr);
    config.timeout = Duration::from_secs(args.timeout);
    config.connect_timeout = config.timeout;
    config.max_retry = 0;
    config.use_msgpack = !args.json;
    config.client_id = "twinrpc_info".into();

    let client = match ClientChannel::connect(config).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("connect failed: {err}");
            std::process::exit(1);
        }
    };
    let meta = client.get_remote_service::<MetaServiceProxy>();
    match collect(&meta).await {
        Ok(services) => match serde_json::to_string_pretty(&services) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("format failed: {err}"),
        },
        Err(err) => eprintln!("request failed: {err}"),
    }
    client.close();
}

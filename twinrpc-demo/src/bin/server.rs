use clap::Parser;
use std::sync::Arc;
use twinrpc::{ChannelConfig, ServerChannel};
use twinrpc_demo::{Calculator, CalculatorImpl};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:8000")]
    pub addr: std::net::SocketAddr,

    /// Use JSON instead of `MessagePack` for calls back into clients.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let config = ChannelConfig {
        use_msgpack: !args.json,
        ..Default::default()
    };
    let server = match ServerChannel::new(config) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!("invalid config: {err}");
            return;
        }
    };
    server.bind_service(Arc::new(CalculatorImpl::default()).twinrpc_export());

    let addr = match server.listen(args.addr).await {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!("listen failed: {err}");
            return;
        }
    };
    tracing::info!(
        "Serving {:?} on {addr}...",
        server.registry().service_names()
    );

    tokio::select! {
        () = server.join() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            server.stop();
            server.join().await;
        }
    }
}

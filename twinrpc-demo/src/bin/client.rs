use clap::Parser;
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use twinrpc::{ChannelConfig, ClientChannel, Result};
use twinrpc_demo::{Calculator, CalculatorProxy, Progress};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address list, `host:port[,host:port]`.
    #[arg(default_value = "127.0.0.1:8000")]
    pub addr: String,

    /// Left operand.
    #[arg(short, long, default_value_t = 6)]
    pub a: i64,

    /// Right operand.
    #[arg(short, long, default_value_t = 3)]
    pub b: i64,

    /// Use JSON instead of `MessagePack`.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

struct PrintProgress;

impl Progress for PrintProgress {
    async fn report(&self, done: usize, total: usize) -> Result<()> {
        tracing::info!("sum progress: {done}/{total}");
        Ok(())
    }
}

#[derive(Default)]
struct State {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(args: Args, calculator: CalculatorProxy) {
    let state = Arc::new(State::default());
    let start_time = std::time::Instant::now();
    let (a, b, secs) = (args.a, args.b, args.secs);
    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let state = state.clone();
        let calculator = calculator.clone();
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < secs {
                for _ in 0..256 {
                    let result = calculator.add(a, b).await;
                    state.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        state.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }));
    }
    tokio::select! {
        () = async {
            for task in tasks {
                if let Err(err) = task.await {
                    tracing::error!("stress task failed: {err}");
                }
            }
        } => {}
        () = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = state.total.swap(0, Ordering::AcqRel);
                let fails = state.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {}
    }
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
        client_id: "twinrpc-demo".into(),
        ..Default::default()
    }
    .with_endpoints(args.addr.clone());
    let client = match ClientChannel::connect(config).await {
        Ok(client) => client,
        Err(err) => {
            tracing::error!("connect failed: {err}");
            return;
        }
    };
    client.bind_service(Arc::new(PrintProgress).twinrpc_export());
    let calculator = client.get_remote_service::<CalculatorProxy>();

    if args.stress {
        stress_test(args, calculator).await;
    } else {
        tracing::info!("add rsp: {:?}", calculator.add(args.a, args.b).await);
        tracing::info!("divide rsp: {:?}", calculator.divide(args.a, args.b).await);
        let values = (1..=args.a.clamp(0, 10)).collect();
        tracing::info!("sum rsp: {:?}", calculator.sum(values).await);
        let note = format!("{} {}", args.a, args.b);
        tracing::info!("record rsp: {:?}", calculator.record(note).await);
        tracing::info!("stats rsp: {:?}", calculator.stats().await);
    }
    client.close();
}

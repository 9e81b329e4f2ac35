use std::io;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vanish_common::{
    DEFAULT_DATA_DIR, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_STATIC_DIR, DEFAULT_SWEEP_INTERVAL_MS,
    MAX_UPLOAD_SIZE, StoreError, StoreResult, SweepError,
};
use vanish_server::{AppState, RouterConfig, create_router};
use vanish_storage::{EngineOptions, FsyncPolicy, Sweeper, TtlStore};

#[derive(Parser, Debug)]
#[command(name = "vanish-server", about = "VanishDB: blobs com prazo de validade via HTTP")]
struct Args {
    #[arg(long, env = "VANISH_HOST", default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,
    #[arg(long, env = "VANISH_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
    /// always, everysec ou no
    #[arg(long, env = "VANISH_FSYNC", default_value = "always")]
    fsync: FsyncPolicy,
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_MS)]
    sweep_interval_ms: u64,
    #[arg(long, default_value_t = MAX_UPLOAD_SIZE)]
    max_upload_bytes: usize,
    /// Serve o build do front e desliga o CORS aberto
    #[arg(long, env = "VANISH_PRODUCTION")]
    production: bool,
    #[arg(long, env = "VANISH_STATIC_DIR", default_value = DEFAULT_STATIC_DIR)]
    static_dir: PathBuf,
    /// Base das URLs devolvidas no upload (padrão: http://{Host})
    #[arg(long, env = "VANISH_PUBLIC_URL")]
    public_url: Option<String>,
}

fn init_tracing(production: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vanish_server=info,vanish_storage=info,tower_http=info".into());
    let json = production || std::env::var("LOG_FORMAT").is_ok_and(|f| f == "json");

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.production);

    let addr = format!("{}:{}", args.host, args.port);
    let options = EngineOptions {
        fsync: args.fsync,
        ..EngineOptions::default()
    };
    let data_dir = args.data_dir.clone();
    let store = tokio::task::spawn_blocking(move || TtlStore::open(data_dir, options)).await??;
    info!(
        "store aberto em {} ({} chaves)",
        args.data_dir.display(),
        store.engine().len()
    );

    let sweeper = Sweeper::new(store.clone(), Duration::from_millis(args.sweep_interval_ms)).spawn();

    let state = AppState {
        store: store.clone(),
        sweeper: sweeper.subscribe(),
        public_url: args.public_url.clone(),
    };
    let config = RouterConfig {
        max_upload_bytes: args.max_upload_bytes,
        static_dir: args.production.then(|| args.static_dir.clone()),
    };
    if args.production {
        info!("modo produção: servindo {}", args.static_dir.display());
    }
    let app = create_router(state, &config);

    let listener = TcpListener::bind(&addr).await?;
    info!("VanishDB escutando em http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sweeper.failed()))
        .await?;

    // Para o sweeper antes do flush final.
    let swept = sweeper.shutdown().await;
    let flushed = match tokio::task::spawn_blocking(move || store.flush()).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Io(io::Error::other(format!(
            "task de flush abortou: {e}"
        )))),
    };
    exit_status(swept, flushed)
}

async fn shutdown_signal(sweeper_failed: impl Future<Output = String>) {
    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown signal recebido"),
        msg = sweeper_failed => error!("sweeper parou, encerrando o servidor: {msg}"),
    }
}

/// Com o log quebrado o flush também falha; o erro do sweeper é a causa e é
/// ele que encerra o processo.
fn exit_status(swept: Result<(), SweepError>, flushed: StoreResult<()>) -> anyhow::Result<()> {
    match (swept, flushed) {
        (Err(e), flushed) => {
            if let Err(flush_err) = flushed {
                error!("flush final do store falhou: {flush_err}");
            }
            error!("encerrando por falha do sweeper: {e}");
            Err(e.into())
        }
        (Ok(()), Err(e)) => Err(e.into()),
        (Ok(()), Ok(())) => {
            info!("store fechado");
            Ok(())
        }
    }
}

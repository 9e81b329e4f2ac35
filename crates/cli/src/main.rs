use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vanish_common::{DEFAULT_DATA_DIR, StoreError};
use vanish_storage::keys::REVERSE_PREFIX;
use vanish_storage::{EngineOptions, FsyncPolicy, TtlStore, now_millis, parse_ttl};

/// Inspeção e manutenção offline do diretório de dados.
///
/// Abre o log diretamente: não rode com o servidor no ar.
#[derive(Parser, Debug)]
#[command(name = "vanish-cli", about = "VanishDB admin CLI")]
struct Args {
    #[arg(long, env = "VANISH_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
    #[arg(long, default_value = "always")]
    fsync: FsyncPolicy,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mostra o valor de uma chave
    Get {
        key: String,
        /// Grava os bytes crus nesse arquivo em vez de imprimir
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Grava um valor, opcionalmente com TTL em segundos
    Put {
        key: String,
        value: Option<String>,
        /// Lê o valor de um arquivo
        #[arg(long, conflicts_with = "value")]
        file: Option<PathBuf>,
        #[arg(long)]
        ttl: Option<String>,
    },
    /// Remove uma chave
    Del { key: String },
    /// Tempo restante até a expiração
    Ttl { key: String },
    /// Roda um ciclo de sweep agora
    Sweep,
    /// Reescreve o log só com as chaves vivas
    Compact,
    /// Estatísticas do engine
    Stats,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "vanish_storage=warn".into()),
        )
        .init();

    let args = Args::parse();
    let store = TtlStore::open(
        &args.data_dir,
        EngineOptions {
            fsync: args.fsync,
            ..EngineOptions::default()
        },
    )?;

    let output = run(&store, args.command)?;
    if !output.is_empty() {
        println!("{output}");
    }
    store.flush()?;
    Ok(())
}

fn run(store: &TtlStore, command: Command) -> anyhow::Result<String> {
    let out = match command {
        Command::Get { key, out } => match store.get(key.as_bytes()) {
            Ok(value) => match out {
                Some(path) => {
                    std::fs::write(&path, &value)?;
                    format!("{} bytes gravados em {}", value.len(), path.display())
                }
                None => format_value(&value),
            },
            Err(StoreError::NotFound) => "(nil)".into(),
            Err(e) => return Err(e.into()),
        },
        Command::Put {
            key,
            value,
            file,
            ttl,
        } => {
            let ttl = parse_ttl(ttl.as_deref())?;
            let value = match (value, file) {
                (_, Some(path)) => Bytes::from(std::fs::read(&path)?),
                (Some(v), None) => Bytes::from(v),
                (None, None) => anyhow::bail!("informe o valor ou --file"),
            };
            store.put(key.as_bytes(), value, ttl)?;
            info!(%key, "valor gravado");
            "OK".into()
        }
        Command::Del { key } => match store.delete(key.as_bytes()) {
            Ok(()) => "(integer) 1".into(),
            Err(StoreError::NotFound) => "(integer) 0".into(),
            Err(e) => return Err(e.into()),
        },
        Command::Ttl { key } => match store.ttl_remaining(key.as_bytes(), now_millis()) {
            Ok(remaining) => format_ttl(remaining),
            Err(StoreError::NotFound) => "(nil)".into(),
            Err(e) => return Err(e.into()),
        },
        Command::Sweep => {
            let stats = store.sweep_once(now_millis())?;
            let mut line = format!(
                "examinados: {}, removidos: {}, descartados: {}, falhas: {}",
                stats.examined, stats.reaped, stats.discarded, stats.failed
            );
            if let Some(e) = stats.last_error {
                line.push_str(&format!("\núltimo erro: {e}"));
            }
            line
        }
        Command::Compact => {
            let before = store.engine().stats().log_bytes;
            store.engine().compact()?;
            let after = store.engine().stats().log_bytes;
            format!("log compactado: {before} -> {after} bytes")
        }
        Command::Stats => {
            let stats = store.engine().stats();
            let with_ttl = store.engine().scan_prefix(REVERSE_PREFIX).count();
            format!(
                "chaves no engine: {}\nentradas com ttl: {with_ttl}\nregistros no log: {} ({} obsoletos)\nbytes no log: {}\ngravável: {}",
                stats.keys, stats.log_ops, stats.obsolete_ops, stats.log_bytes, stats.writable
            )
        }
    };
    Ok(out)
}

/// Formata um valor para exibição humana.
fn format_value(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(s) => format!("\"{s}\""),
        Err(_) => format!("(binary) {} bytes", data.len()),
    }
}

fn format_ttl(remaining: Option<Duration>) -> String {
    match remaining {
        None => "(sem expiração)".into(),
        Some(d) => format!("(ms) {}", d.as_millis()),
    }
}

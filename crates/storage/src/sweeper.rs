use std::io;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{error, info, warn};

use vanish_common::{MAX_CONSECUTIVE_SWEEP_FAILURES, StoreError, StoreResult, SweepError};

use crate::ttl::{SweepStats, TtlStore, now_millis};

/// Estado observável do sweeper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweeperStatus {
    Running,
    Stopped,
    Failed(String),
}

/// Task em background que roda `sweep_once` em intervalo fixo.
///
/// Uma entrada vencida continua legível por até um intervalo além do prazo.
pub struct Sweeper {
    store: TtlStore,
    interval: Duration,
    max_failures: u32,
}

impl Sweeper {
    pub fn new(store: TtlStore, interval: Duration) -> Self {
        Self {
            store,
            interval,
            max_failures: MAX_CONSECUTIVE_SWEEP_FAILURES,
        }
    }

    pub fn max_consecutive_failures(mut self, max: u32) -> Self {
        self.max_failures = max.max(1);
        self
    }

    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(SweeperStatus::Running);
        let task = tokio::spawn(self.run(shutdown_rx, status_tx));
        SweeperHandle {
            shutdown: shutdown_tx,
            status: status_rx,
            task,
        }
    }

    async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        status: watch::Sender<SweeperStatus>,
    ) -> Result<(), SweepError> {
        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        info!("sweeper iniciado: intervalo de {:?}", self.interval);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                // sinal explícito ou handle descartado
                _ = shutdown.changed() => {
                    status.send_replace(SweeperStatus::Stopped);
                    info!("sweeper encerrado");
                    return Ok(());
                }
            }

            match self.cycle().await {
                Ok(mut stats) if stats.is_failure() => {
                    failures += 1;
                    let last = stats
                        .last_error
                        .take()
                        .unwrap_or_else(|| StoreError::Io(io::Error::other("falha sem detalhe")));
                    warn!("ciclo de sweep falhou ({failures}/{}): {last}", self.max_failures);

                    if failures >= self.max_failures {
                        let err = SweepError::TooManyFailures { failures, last };
                        error!("{err}");
                        status.send_replace(SweeperStatus::Failed(err.to_string()));
                        return Err(err);
                    }
                }
                Ok(_) => failures = 0,
                Err(e) => {
                    let err = SweepError::Unavailable(e);
                    error!("{err}");
                    status.send_replace(SweeperStatus::Failed(err.to_string()));
                    return Err(err);
                }
            }
        }
    }

    // O sweep faz I/O síncrono (fsync), então roda no pool de blocking.
    async fn cycle(&self) -> StoreResult<SweepStats> {
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let stats = store.sweep_once(now_millis())?;
            if stats.reaped > 0
                && let Err(e) = store.engine().maybe_compact()
            {
                warn!("compactação após sweep falhou: {e}");
            }
            Ok(stats)
        })
        .await;

        match result {
            Ok(stats) => stats,
            Err(e) => Err(StoreError::Io(io::Error::other(format!(
                "task de sweep abortou: {e}"
            )))),
        }
    }
}

/// Handle do sweeper em execução.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<SweeperStatus>,
    task: JoinHandle<Result<(), SweepError>>,
}

impl SweeperHandle {
    pub fn status(&self) -> SweeperStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SweeperStatus> {
        self.status.clone()
    }

    /// Resolve quando o sweeper desiste, com a mensagem do erro.
    ///
    /// O future não empresta o handle, então pode ir para um
    /// `with_graceful_shutdown` enquanto o handle segue para o `shutdown`.
    /// Uma task que some sem publicar estado final também conta como falha;
    /// um encerramento pedido (`Stopped`) nunca resolve.
    pub fn failed(&self) -> impl Future<Output = String> + Send + 'static {
        let mut rx = self.status.clone();
        async move {
            loop {
                let current = rx.borrow_and_update().clone();
                match current {
                    SweeperStatus::Failed(msg) => return msg,
                    SweeperStatus::Stopped => std::future::pending::<()>().await,
                    SweeperStatus::Running => {}
                }
                if rx.changed().await.is_err() {
                    return "task do sweeper terminou sem publicar estado".to_owned();
                }
            }
        }
    }

    /// Pede o encerramento e espera a task terminar.
    pub async fn shutdown(self) -> Result<(), SweepError> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(SweepError::Unavailable(StoreError::Io(io::Error::other(
                format!("task de sweep abortou: {e}"),
            )))),
        }
    }
}

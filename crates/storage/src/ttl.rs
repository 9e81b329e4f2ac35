use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, warn};

use vanish_common::{StoreError, StoreResult};

use crate::batch::WriteBatch;
use crate::engine::{Engine, EngineOptions};
use crate::keys::{
    EXPIRY_PREFIX, data_key, decode_deadline, decode_expiry_key, encode_deadline, expiry_key,
    reverse_key,
};

/// Maior TTL aceito (100 anos); acima disso é quase certamente erro do cliente.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Relógio de parede em milissegundos desde a epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Interpreta o TTL vindo do cliente, em segundos (aceita fração).
///
/// Ausente, vazio ou zero significa "nunca expira". Negativo, não numérico,
/// infinito ou acima de [`MAX_TTL`] é rejeitado antes de qualquer escrita.
pub fn parse_ttl(raw: Option<&str>) -> StoreResult<Option<Duration>> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(s) => s,
    };
    let secs: f64 = raw
        .parse()
        .map_err(|_| StoreError::invalid(format!("ttl '{raw}' não é numérico")))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(StoreError::invalid(format!("ttl '{raw}' deve ser >= 0")));
    }
    if secs == 0.0 {
        return Ok(None);
    }
    let ttl = Duration::try_from_secs_f64(secs)
        .map_err(|_| StoreError::invalid(format!("ttl '{raw}' fora do intervalo")))?;
    if ttl > MAX_TTL {
        return Err(StoreError::invalid(format!("ttl '{raw}' excede o máximo")));
    }
    Ok(Some(ttl))
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Contadores de um ciclo de sweep.
#[derive(Debug, Default)]
pub struct SweepStats {
    /// Registros do índice lidos, incluindo o primeiro ainda não vencido.
    pub examined: usize,
    /// Valores removidos por TTL vencido.
    pub reaped: usize,
    /// Registros do índice descartados sem valor a remover (órfãos ou obsoletos).
    pub discarded: usize,
    /// Reaps que falharam neste ciclo.
    pub failed: usize,
    pub last_error: Option<StoreError>,
}

impl SweepStats {
    /// Ciclo em que tudo que foi tentado falhou.
    pub fn is_failure(&self) -> bool {
        self.failed > 0 && self.reaped == 0 && self.discarded == 0
    }
}

enum Reap {
    Reaped,
    Discarded,
    /// Registro já removido por um put/delete concorrente.
    Gone,
}

/// Store com expiração por chave sobre o [`Engine`].
///
/// Cada chave com TTL tem um registro no índice ordenado por
/// `(expira, chave)`; o sweep percorre só o começo desse índice, então o custo
/// de um ciclo é proporcional às entradas vencidas e não ao total de chaves.
#[derive(Clone)]
pub struct TtlStore {
    engine: Engine,
}

impl TtlStore {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    pub fn open(dir: impl AsRef<Path>, options: EngineOptions) -> StoreResult<Self> {
        Ok(Self::new(Engine::open(dir, options)?))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn put(&self, key: &[u8], value: Bytes, ttl: Option<Duration>) -> StoreResult<()> {
        self.put_at(key, value, ttl, now_millis())
    }

    /// Como [`put`](Self::put), com o instante atual explícito.
    ///
    /// Valor, remoção do registro antigo do índice e o novo registro vão no
    /// mesmo batch.
    pub fn put_at(
        &self,
        key: &[u8],
        value: Bytes,
        ttl: Option<Duration>,
        now: u64,
    ) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::invalid("chave vazia"));
        }
        let deadline = ttl
            .filter(|t| !t.is_zero())
            .map(|t| now.saturating_add(ttl_millis(t)));

        self.engine.update(|view| {
            let mut batch = WriteBatch::new();
            let rkey = reverse_key(key);

            if let Some(old) = view.get(&rkey).and_then(|raw| decode_deadline(raw)) {
                batch.delete(expiry_key(old, key));
                if deadline.is_none() {
                    batch.delete(rkey.clone());
                }
            }

            batch.put(data_key(key), value);

            if let Some(at) = deadline {
                batch.put(expiry_key(at, key), Bytes::copy_from_slice(key));
                batch.put(rkey, encode_deadline(at));
            }
            Ok((batch, ()))
        })
    }

    /// Leitura direta; não consulta o índice.
    pub fn get(&self, key: &[u8]) -> StoreResult<Bytes> {
        self.engine.get(&data_key(key))
    }

    /// Remove valor e registro de índice. `NotFound` se o valor não existia.
    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let existed = self.engine.update(|view| {
            let mut batch = WriteBatch::new();
            let dkey = data_key(key);
            let rkey = reverse_key(key);

            let existed = view.contains_key(&dkey);
            if existed {
                batch.delete(dkey);
            }
            if let Some(at) = view.get(&rkey).and_then(|raw| decode_deadline(raw)) {
                batch.delete(expiry_key(at, key));
                batch.delete(rkey);
            }
            Ok((batch, existed))
        })?;

        if existed {
            Ok(())
        } else {
            Err(StoreError::NotFound)
        }
    }

    /// Prazo de expiração atual da chave, em ms desde a epoch.
    pub fn expires_at(&self, key: &[u8]) -> StoreResult<Option<u64>> {
        if !self.engine.contains_key(&data_key(key)) {
            return Err(StoreError::NotFound);
        }
        match self.engine.get(&reverse_key(key)) {
            Ok(raw) => Ok(decode_deadline(&raw)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Tempo restante até o prazo; `None` se a chave não expira.
    pub fn ttl_remaining(&self, key: &[u8], now: u64) -> StoreResult<Option<Duration>> {
        Ok(self
            .expires_at(key)?
            .map(|at| Duration::from_millis(at.saturating_sub(now))))
    }

    /// Um ciclo de sweep: remove tudo que venceu até `now`.
    ///
    /// Percorre o índice do começo e para no primeiro registro ainda no futuro.
    /// Falha em uma chave é logada e o ciclo segue; só um engine indisponível
    /// interrompe o ciclo com erro.
    pub fn sweep_once(&self, now: u64) -> StoreResult<SweepStats> {
        self.engine.ensure_writable()?;

        let mut stats = SweepStats::default();
        for (index_key, _) in self.engine.scan_prefix(EXPIRY_PREFIX) {
            stats.examined += 1;

            let Some((expires_at, id)) = decode_expiry_key(&index_key) else {
                warn!("registro de índice malformado, descartando: {:?}", index_key);
                let mut batch = WriteBatch::new();
                batch.delete(index_key.clone());
                match self.engine.write(batch) {
                    Ok(()) => stats.discarded += 1,
                    Err(e) => record_failure(&mut stats, e),
                }
                continue;
            };

            if expires_at > now {
                break;
            }

            match self.reap(&index_key, id, expires_at) {
                Ok(Reap::Reaped) => {
                    debug!("chave expirada removida: {}", String::from_utf8_lossy(id));
                    stats.reaped += 1;
                }
                Ok(Reap::Discarded) => stats.discarded += 1,
                Ok(Reap::Gone) => {}
                Err(e) => {
                    warn!(
                        "falha ao remover chave expirada {}: {e}",
                        String::from_utf8_lossy(id)
                    );
                    record_failure(&mut stats, e);
                }
            }
        }

        if stats.reaped > 0 || stats.discarded > 0 {
            debug!(
                "sweep: {} examinados, {} removidos, {} descartados",
                stats.examined, stats.reaped, stats.discarded
            );
        }
        Ok(stats)
    }

    // Só remove se o prazo ainda é o mesmo (pode ter sido re-setado).
    fn reap(&self, index_key: &Bytes, id: &[u8], expires_at: u64) -> StoreResult<Reap> {
        self.engine.update(|view| {
            let mut batch = WriteBatch::new();
            if !view.contains_key(index_key) {
                return Ok((batch, Reap::Gone));
            }
            batch.delete(index_key.clone());

            let rkey = reverse_key(id);
            let current = view.get(&rkey).and_then(|raw| decode_deadline(raw));
            if current != Some(expires_at) {
                return Ok((batch, Reap::Discarded));
            }
            batch.delete(rkey);

            let dkey = data_key(id);
            if !view.contains_key(&dkey) {
                return Ok((batch, Reap::Discarded));
            }
            batch.delete(dkey);
            Ok((batch, Reap::Reaped))
        })
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.engine.flush()
    }
}

fn record_failure(stats: &mut SweepStats, err: StoreError) {
    stats.failed += 1;
    stats.last_error = Some(err);
}

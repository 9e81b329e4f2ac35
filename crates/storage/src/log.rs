use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, info, warn};

use vanish_common::{MAX_RECORD_SIZE, StoreError, StoreResult};

use crate::batch::WriteBatch;

/// len(u32) + crc(u32)
pub(crate) const HEADER_LEN: usize = 8;

/// Política de fsync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync após cada commit.
    #[default]
    Always,
    /// Fsync no máximo uma vez por segundo.
    EverySec,
    /// Sem fsync explícito (deixa pro OS).
    No,
}

impl FromStr for FsyncPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(FsyncPolicy::Always),
            "everysec" => Ok(FsyncPolicy::EverySec),
            "no" => Ok(FsyncPolicy::No),
            _ => Err(format!("valor inválido: '{s}'. Use: always, everysec, no")),
        }
    }
}

/// Encoda um batch como registro completo: len | crc | corpo.
pub(crate) fn encode_record(batch: &WriteBatch) -> BytesMut {
    let mut body = BytesMut::new();
    batch.encode(&mut body);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut record = BytesMut::with_capacity(HEADER_LEN + body.len());
    record.put_u32_le(body.len() as u32);
    record.put_u32_le(crc);
    record.put_slice(&body);
    record
}

/// Writer append-only do log. Cada commit é um único registro.
pub(crate) struct LogWriter {
    file: File,
    path: PathBuf,
    policy: FsyncPolicy,
    len: u64,
    last_sync: Instant,
    broken: bool,
}

impl LogWriter {
    pub(crate) fn open(path: &Path, policy: FsyncPolicy) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            policy,
            len,
            last_sync: Instant::now(),
            broken: false,
        })
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub(crate) fn ensure_usable(&self) -> StoreResult<()> {
        if self.broken {
            return Err(StoreError::Io(io::Error::other(format!(
                "log {:?} indisponível após falha de escrita",
                self.path
            ))));
        }
        Ok(())
    }

    /// Escreve o batch e aplica a política de fsync.
    ///
    /// Em falha de escrita o arquivo é truncado de volta para o último
    /// registro íntegro; se nem isso funcionar, ou se o fsync falhar, o writer
    /// fica marcado como quebrado e recusa novos commits.
    pub(crate) fn append(&mut self, batch: &WriteBatch) -> StoreResult<()> {
        self.ensure_usable()?;

        let record = encode_record(batch);
        if record.len() - HEADER_LEN > MAX_RECORD_SIZE {
            return Err(StoreError::invalid(format!(
                "registro de {} bytes excede o máximo de {MAX_RECORD_SIZE}",
                record.len()
            )));
        }

        if let Err(e) = self.file.write_all(&record) {
            if let Err(rollback) = self.file.set_len(self.len) {
                error!("falha ao desfazer escrita parcial no log: {rollback}");
                self.broken = true;
            }
            return Err(e.into());
        }
        self.len += record.len() as u64;

        let due = match self.policy {
            FsyncPolicy::Always => true,
            FsyncPolicy::EverySec => self.last_sync.elapsed() >= Duration::from_secs(1),
            FsyncPolicy::No => false,
        };
        if due {
            self.sync()?;
        }
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> StoreResult<()> {
        if let Err(e) = self.file.sync_data() {
            error!("fsync do log falhou, engine passa a recusar escritas: {e}");
            self.broken = true;
            return Err(e.into());
        }
        self.last_sync = Instant::now();
        Ok(())
    }
}

/// Resultado do replay do log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Replay {
    pub batches: usize,
    pub ops: u64,
    pub valid_len: u64,
    pub torn_tail: bool,
    /// Bytes após `valid_len` que o truncamento descartaria.
    pub discarded: u64,
}

/// Lê o log registro a registro e entrega cada batch íntegro, em ordem.
///
/// Só o último registro do arquivo pode estar incompleto (escrita
/// interrompida); isso encerra o replay sem erro e `valid_len` indica onde
/// truncar. Tamanho acima de [`MAX_RECORD_SIZE`], CRC inválido no meio do
/// arquivo, ou um tamanho que passa do fim mas com registro íntegro depois,
/// é corrupção e vira `StoreError::Corrupt`.
pub(crate) fn replay_log<F>(path: &Path, mut apply: F) -> StoreResult<Replay>
where
    F: FnMut(WriteBatch),
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("log não encontrado, iniciando sem dados");
            return Ok(Replay::default());
        }
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut replay = Replay::default();
    let mut pos = 0u64;
    let mut header = [0u8; HEADER_LEN];

    while pos < file_len {
        let rest = file_len - pos;
        if rest < HEADER_LEN as u64 {
            replay.torn_tail = true;
            break;
        }

        reader.read_exact(&mut header)?;
        let mut fields = &header[..];
        let len = fields.get_u32_le() as u64;
        let crc = fields.get_u32_le();

        if len > MAX_RECORD_SIZE as u64 {
            return Err(StoreError::Corrupt { offset: pos });
        }
        if len > rest - HEADER_LEN as u64 {
            // tamanho passa do fim: só é escrita interrompida se nada íntegro vem depois
            if has_record_after(path, pos + 1, file_len)? {
                return Err(StoreError::Corrupt { offset: pos });
            }
            replay.torn_tail = true;
            break;
        }

        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body)?;
        let end = pos + HEADER_LEN as u64 + len;

        if crc32fast::hash(&body) != crc {
            if end == file_len {
                replay.torn_tail = true;
                break;
            }
            return Err(StoreError::Corrupt { offset: pos });
        }

        let batch =
            WriteBatch::decode(Bytes::from(body)).ok_or(StoreError::Corrupt { offset: pos })?;
        replay.ops += batch.len() as u64;
        apply(batch);
        replay.batches += 1;
        pos = end;
    }

    replay.valid_len = pos;
    replay.discarded = file_len - pos;
    if replay.torn_tail {
        warn!(
            "log: registro incompleto no final do arquivo, descartando {} bytes",
            replay.discarded
        );
    }
    Ok(replay)
}

/// Procura, a partir de `from`, qualquer registro com CRC válido e batch
/// decodificável. Só roda quando um cabeçalho aponta além do fim do arquivo.
fn has_record_after(path: &Path, from: u64, file_len: u64) -> StoreResult<bool> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let mut rest = Vec::with_capacity(file_len.saturating_sub(from) as usize);
    file.read_to_end(&mut rest)?;

    let mut off = 0;
    while off + HEADER_LEN < rest.len() {
        let mut fields = &rest[off..off + HEADER_LEN];
        let len = fields.get_u32_le() as usize;
        let crc = fields.get_u32_le();
        let body_start = off + HEADER_LEN;

        if len <= MAX_RECORD_SIZE && len <= rest.len() - body_start {
            let body = &rest[body_start..body_start + len];
            if crc32fast::hash(body) == crc
                && WriteBatch::decode(Bytes::copy_from_slice(body)).is_some_and(|b| !b.is_empty())
            {
                return Ok(true);
            }
        }
        off += 1;
    }
    Ok(false)
}

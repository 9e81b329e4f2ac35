/// Erros do engine de armazenamento e do índice de TTL.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chave não encontrada")]
    NotFound,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("log corrompido no offset {offset}")]
    Corrupt { offset: u64 },
    #[error("argumento inválido: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidArgument(msg.into())
    }

    /// Verdadeiro para falhas do engine (disco, corrupção), que viram 500 no HTTP.
    pub fn is_io(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Corrupt { .. })
    }
}

/// Erros do loop de sweep em background.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("sweep abortado após {failures} ciclos consecutivos com falha: {last}")]
    TooManyFailures { failures: u32, last: StoreError },
    #[error("engine indisponível para o sweep: {0}")]
    Unavailable(StoreError),
}

/// Result type alias.
pub type StoreResult<T> = Result<T, StoreError>;

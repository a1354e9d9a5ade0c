use thiserror::Error;

pub type ZkvResult<T> = Result<T, ZkvError>;

#[derive(Debug, Error)]
pub enum ZkvError {
    #[error("key derivation failed: {0}")]
    Derivation(String),

    /// Authentication tag mismatch. Folded into `WrongSecretOrCorrupted`
    /// before it reaches a UI collaborator.
    #[error("authentication tag mismatch")]
    TamperDetected,

    #[error("wrong secret or corrupted data")]
    WrongSecretOrCorrupted,

    #[error("crypto task {task_id} timed out after {timeout_ms}ms")]
    WorkerTimeout { task_id: u64, timeout_ms: u64 },

    #[error("sync error: {0}")]
    Sync(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("vault is locked")]
    Locked,

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ZkvError {
    /// True for errors caused by a wrong secret, tampering, or corruption.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ZkvError::TamperDetected | ZkvError::WrongSecretOrCorrupted
        )
    }

    /// Collapse tamper and wrong-secret into one outcome so callers cannot
    /// tell which check rejected their secret.
    pub fn into_user_facing(self) -> Self {
        if self.is_auth_failure() {
            ZkvError::WrongSecretOrCorrupted
        } else {
            self
        }
    }
}

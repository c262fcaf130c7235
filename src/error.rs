use thiserror::Error;

/// Stable, FFI-facing error taxonomy. `code()` returns the exact integer
/// a surrounding application (or the sync server glue) keys off of.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("memory error")]
    MemErr,

    #[error("invalid parameter: {0}")]
    ParamErr(String),

    #[error("I/O error: {0}")]
    IoErr(#[from] std::io::Error),

    #[error("cryptographic operation failed")]
    CryptoErr,

    #[error("vault is already open")]
    VOpen,

    #[error("vault is not open")]
    VClose,

    #[error("system call failed: {0}")]
    Syscall(String),

    #[error("vault file already exists")]
    Exist,

    #[error("permission denied")]
    Access,

    #[error("key already exists")]
    KeyExist,

    #[error("vault file integrity check failed")]
    FileCorrupt,

    /// Internal only: `SessionEngine::add` always compacts and retries
    /// instead of letting this escape to a caller.
    #[error("slot table is full")]
    NoSpace,

    #[error("wrong password")]
    WrongPass,
}

impl VaultError {
    /// The stable integer code from the file format spec.
    pub fn code(&self) -> i32 {
        match self {
            VaultError::MemErr => 1,
            VaultError::ParamErr(_) => 2,
            VaultError::IoErr(_) => 3,
            VaultError::CryptoErr => 4,
            VaultError::VOpen => 5,
            VaultError::VClose => 6,
            VaultError::Syscall(_) => 7,
            VaultError::Exist => 8,
            VaultError::Access => 9,
            VaultError::KeyExist => 10,
            VaultError::FileCorrupt => 11,
            VaultError::NoSpace => 12,
            VaultError::WrongPass => 13,
        }
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("device already exists: {0}")]
    Conflict(String),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum BleError {
    #[error("bluetooth adapter not available")]
    AdapterNotAvailable,

    #[error("invalid bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("not connected")]
    NotConnected,

    #[error("GATT service not found: {0}")]
    ServiceNotFound(Uuid),

    #[error("GATT characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("scan already in progress")]
    ScanInProgress,

    #[error("hardware error: {0}")]
    Hardware(String),
}

pub type BleResult<T> = std::result::Result<T, BleError>;

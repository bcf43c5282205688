use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for lumodb operations
pub type Result<T> = result::Result<T, Error>;

/// lumodb error codes
#[derive(Debug, Error)]
pub enum Error {
    /// Key/data pair already exists
    #[error("Key/data pair already exists")]
    KeyExist,
    /// No matching key/data pair found
    #[error("No matching key/data pair found")]
    NotFound,
    /// Database file is corrupted
    #[error("Database file is corrupted: {0}")]
    Corrupted(String),
    /// Database version mismatch
    #[error("Database version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    /// File is not a valid lumodb file
    #[error("File is not a valid lumodb file")]
    Invalid,
    /// Environment mapsize limit reached
    #[error("Environment mapsize limit reached")]
    MapFull,
    /// Existing data does not fit the requested map size
    #[error("Database needs {needed} bytes but the map size is {map_size}")]
    MapSizeExceeded { needed: usize, map_size: usize },
    /// Environment maxdbs limit reached
    #[error("Environment maxdbs limit reached")]
    DbsFull,
    /// Environment maxreaders limit reached
    #[error("Environment maxreaders limit reached")]
    ReadersFull,
    /// Operation and DB incompatible
    #[error("Operation and DB incompatible")]
    Incompatible,
    /// Transaction must abort, has a child, or is invalid
    #[error("Transaction must abort, has a child, or is invalid")]
    BadTxn,
    /// Unsupported size of key/DB name/data
    #[error("Unsupported size of key/DB name/data")]
    BadValSize,
    /// The specified DBI is not valid in this transaction
    #[error("The specified DBI is not valid in this transaction")]
    BadDbi,
    /// Environment is already open
    #[error("Environment is already open")]
    EnvAlreadyOpen,
    /// Environment is not initialized
    #[error("Environment is not initialized")]
    EnvNotInitialized,
    /// Environment is read-only
    #[error("Environment is read-only")]
    EnvReadOnly,
    /// Environment path is invalid
    #[error("Invalid environment path")]
    EnvInvalidPath,
    /// Environment map size is invalid
    #[error("Invalid map size")]
    EnvInvalidMapSize,
    /// Environment still has live transactions
    #[error("Environment has {0} active transactions")]
    EnvHasActiveTxns(usize),
    /// Transaction is read-only
    #[error("Transaction is read-only")]
    TxnReadOnly,
    /// Transaction was already committed, aborted or reset
    #[error("Transaction is finished")]
    TxnFinished,
    /// Another write transaction holds the writer slot
    #[error("Another write transaction is active")]
    WriterBusy,
    /// I/O failure from the data file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Error::Corrupted(reason.into())
    }

    /// Whether this error leaves the transaction unable to continue writing.
    pub(crate) fn poisons_txn(&self) -> bool {
        !matches!(
            self,
            Error::KeyExist
                | Error::NotFound
                | Error::BadValSize
                | Error::BadDbi
                | Error::Incompatible
                | Error::TxnReadOnly
                | Error::TxnFinished
                | Error::BadTxn
        )
    }
}

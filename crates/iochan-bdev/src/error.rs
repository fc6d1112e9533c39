//! Block layer errors

use thiserror::Error;

use crate::io::IoType;

pub type Result<T> = std::result::Result<T, BdevError>;

#[derive(Debug, Error)]
pub enum BdevError {
    #[error("bdev {0} not found")]
    NotFound(String),

    #[error("bdev {0} already exists")]
    AlreadyExists(String),

    #[error("bdev {bdev} already claimed by module {module}")]
    Claimed { bdev: String, module: String },

    #[error("bdev {0} opened read-only")]
    ReadOnly(String),

    #[error("blocks {offset}+{num} out of range for bdev {bdev} ({count} blocks)")]
    OutOfRange {
        bdev: String,
        offset: u64,
        num: u64,
        count: u64,
    },

    #[error("buffer of {actual} bytes where {expected} were expected")]
    BufferSize { expected: usize, actual: usize },

    #[error("bdev {bdev} does not support {io_type} I/O")]
    Unsupported { bdev: String, io_type: IoType },

    #[error("bdev {0} is being removed")]
    Removing(String),

    #[error("descriptor for bdev {0} is closed")]
    Closed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] iochan_core::Error),
}

impl BdevError {
    /// Whether retrying after the bdev finished going away cannot help
    pub fn is_gone(&self) -> bool {
        matches!(self, BdevError::NotFound(_) | BdevError::Removing(_) | BdevError::Closed(_))
    }
}

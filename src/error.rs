use std::fmt;

/// Errors produced while writing or reading a symdb block.
///
/// Storage-level failures (`Io`, `ObjectStore`, `Parquet`, `Arrow`) wrap the
/// underlying library error. The remaining variants describe block-format
/// conditions: unrecognized files, failed chunk checksums, identifiers that
/// fall outside a partition's tables, and empty parquet files (an empty block
/// is not a valid block).
#[derive(Debug)]
pub enum Error {
    /// Local file I/O failed
    Io(std::io::Error),

    /// Bucket operation failed
    ObjectStore(object_store::Error),

    /// Parquet encode/decode failed
    Parquet(parquet::errors::ParquetError),

    /// Arrow array construction or conversion failed
    Arrow(arrow::error::ArrowError),

    /// Index file does not start with the symdb magic
    InvalidMagic([u8; 4]),

    /// Index file carries a format version this build cannot read
    UnsupportedVersion(u32),

    /// Index file is truncated or internally inconsistent
    CorruptIndex(String),

    /// Stacktrace chunk checksum mismatch (got, expected)
    InvalidChecksum { got: u32, expected: u32 },

    /// Stacktrace chunk body failed to decode
    CorruptChunk(String),

    /// An identifier points past the end of its table
    OutOfRange {
        what: &'static str,
        id: u64,
        max: u64,
    },

    /// A parquet file reported zero rows on open
    EmptyParquetFile(String),

    /// A parquet table does not carry the expected columns
    Schema(String),

    /// No partition with the requested key in this block
    PartitionNotFound(u64),

    /// The operation was cancelled before completion
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymdbError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<object_store::Error> for Error {
    fn from(value: object_store::Error) -> Self {
        Self::ObjectStore(value)
    }
}

impl From<parquet::errors::ParquetError> for Error {
    fn from(value: parquet::errors::ParquetError) -> Self {
        Self::Parquet(value)
    }
}

impl From<arrow::error::ArrowError> for Error {
    fn from(value: arrow::error::ArrowError) -> Self {
        Self::Arrow(value)
    }
}

/// Symdb result
pub type Result<T> = std::result::Result<T, Error>;

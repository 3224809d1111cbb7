use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The full error taxonomy for the engine. Every fallible public operation
/// in this crate returns `Result<T>` built on this type.
#[derive(Debug)]
pub enum Error {
    /// Disk read/write or file-open failed.
    Io(std::io::Error),
    /// Allocation could not find a contiguous extent of the requested size.
    NoSpace,
    /// Block address outside the file or not mapped to any segment.
    BadAddress(u32),
    /// Catalog lookup or index lookup found nothing.
    NotFound(String),
    /// Type mismatch, arity mismatch, or unknown attribute.
    SchemaViolation(String),
    /// NOT NULL / UNIQUE / CHECK / BETWEEN / referential rejection.
    ConstraintViolation(String),
    /// Catalog name collision (segment, constraint, index).
    DuplicateName(String),
    /// Caller-side error: empty name, out-of-range argument, malformed config.
    InvalidArgument(String),
    /// Block kind/header inconsistent, free_space does not match slots.
    CorruptState(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::NoSpace => write!(f, "no space: allocation failed to find a contiguous extent"),
            Error::BadAddress(addr) => write!(f, "bad address: block {} out of range or unmapped", addr),
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::SchemaViolation(msg) => write!(f, "schema violation: {}", msg),
            Error::ConstraintViolation(msg) => write!(f, "constraint violation: {}", msg),
            Error::DuplicateName(name) => write!(f, "duplicate name: {}", name),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::CorruptState(msg) => write!(f, "corrupt state: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(err: bincode::error::EncodeError) -> Self {
        Error::CorruptState(format!("encode failed: {}", err))
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::CorruptState(format!("decode failed: {}", err))
    }
}

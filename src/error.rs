use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A bucket, file or file set cannot accept more data. A caller holding
    /// more context (e.g. the tree) may retry after making room.
    #[error("no space left in {0}")]
    NoSpace(&'static str),
    /// The entry alone exceeds what an empty block can ever hold; no retry
    /// at any level can succeed.
    #[error("entry larger than an empty block can hold")]
    TooBig,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Exists(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Every open descriptor is pinned and the open-file budget is spent.
    #[error("open-file budget exhausted")]
    Busy,
    #[error("bad magic number in {0}")]
    BadMagic(&'static str),
    #[error("CRC mismatch in {0}")]
    CrcMismatch(&'static str),
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("missing argument for option {0}")]
    MissingArg(String),
}

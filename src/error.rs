//! Typed failure kinds for the archiver.

use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("name does not fit a v7 header: {0:?}")]
    NameTooLong(String),

    #[error("link target does not fit a v7 header: {0:?}")]
    LinkTooLong(String),

    #[error("{path:?} is {size} bytes, too large for a v7 header")]
    SizeOverflow { path: PathBuf, size: u64 },

    #[error("name is not 7-bit ASCII: {0:?}")]
    BadName(PathBuf),

    #[error("unsupported file type: {0:?}")]
    UnsupportedFileType(PathBuf),

    #[error("cannot stat {path:?}: {source}")]
    StatFailed { path: PathBuf, source: io::Error },

    #[error("cannot open {path:?}: {source}")]
    OpenFailed { path: PathBuf, source: io::Error },

    #[error("read failed on {path:?}: {source}")]
    ReadFailed { path: PathBuf, source: io::Error },

    #[error("write failed on {path:?}: {source}")]
    WriteFailed { path: PathBuf, source: io::Error },

    #[error("seek to {offset} failed on {path:?}: {source}")]
    SeekFailed {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    #[error("corrupt header at offset {0}")]
    CorruptHeader(u64),

    #[error("no offset index trailer")]
    NotAPtarArchive,

    #[error("inconsistent arguments")]
    InvalidArguments,
}

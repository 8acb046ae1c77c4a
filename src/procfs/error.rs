use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("mount point `{0}` is not a readable directory")]
    InvalidMountPoint(PathBuf),
    #[error("process {0} not found")]
    NotFound(i32),
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid stat data for process {pid}: {reason}")]
    InvalidStat { pid: i32, reason: String },
}

impl Error {
    /// Maps a per-process read error, folding `ENOENT` into
    /// [`Error::NotFound`] so races against process exit are uniform.
    pub(crate) fn from_proc_io(pid: i32, path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Error::NotFound(pid),
            _ => Error::Io { path, source },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

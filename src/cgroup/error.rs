use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read cgroup file for process {pid}: {source}")]
    Read {
        pid: i32,
        #[source]
        source: io::Error,
    },
    #[error("invalid cgroup line `{0}`")]
    InvalidLine(String),
    #[error("failed to read controller file `{path}`: {source}")]
    Controller {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

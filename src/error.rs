use std::path::PathBuf;

/// Errors that can occur while loading trees or metadata.
///
/// Per-tree failures are recoverable at the batch level: callers log them and
/// continue with an empty contribution for that tree.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {source} ({path})")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("Newick parsing error in {path}: {message}")]
    Newick { path: PathBuf, message: String },

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("metadata file is missing required column '{0}'")]
    MissingColumn(&'static str),
}

impl Error {
    /// Convenience for wrapping an `io::Error` with a path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: path.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            source: err,
            path: PathBuf::from("<unknown>"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use std::fs;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// One entry could not be read during a crawl. Recovered locally.
    #[error("Crawl entry error at {path}: {source}")]
    CrawlEntry {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A crawl root is not mounted or not reachable.
    #[error("Volume unreachable: {0}")]
    VolumeUnreachable(PathBuf),

    #[error(transparent)]
    QuerySyntax(#[from] QuerySyntaxError),

    /// Persistence failure. The in-memory state stays usable.
    #[error("Store error: {0}")]
    StoreIo(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// The only way a raw search string can fail to compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Query syntax error: missing closing quote for quote at byte {position}")]
pub struct QuerySyntaxError {
    /// Byte offset of the unmatched opening quote.
    pub position: usize,
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Canonicalizes a path, returning the original if canonicalization fails.
pub fn canonicalize_existing_path(path: PathBuf) -> PathBuf {
    fs::canonicalize(&path).unwrap_or(path)
}

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the page cache.
///
/// Load failures are shared between every caller waiting on the same page,
/// so I/O sources are held behind an `Arc` and the whole type is `Clone`.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Builder parameters are inconsistent.
    #[error("invalid cache configuration: {detail}")]
    InvalidConfig { detail: String },

    /// The backing file could not be opened.
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Page ids are non-negative.
    #[error("invalid page id {page_id}")]
    InvalidPageId { page_id: i64 },

    /// Reading a page from the backing source failed.
    #[error("failed to load page {page_id}: {source}")]
    PageLoad {
        page_id: i64,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The slot was recycled or refilled while the caller was reading it.
    #[error("stale read of slot {slot}: expected version {expected}, found {actual}")]
    StaleRead { slot: u32, expected: u64, actual: u64 },

    /// The requested byte range does not fit in a page.
    #[error("range {offset}+{len} is outside a {page_size}-byte page")]
    OutOfBounds {
        offset: usize,
        len: usize,
        page_size: usize,
    },

    /// A load tried to publish a page that is already indexed.
    #[error("broken invariant: duplicate insert of page {page_id}")]
    DuplicateInsert { page_id: i64 },

    /// Two loads for the same page were in flight at once.
    #[error("broken invariant: concurrent loads of page {page_id}")]
    ConcurrentLoad { page_id: i64 },
}

impl CacheError {
    pub(crate) fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Returns `true` when repeating the lookup and read is expected to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StaleRead { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stale_reads_are_retryable() {
        let stale = CacheError::StaleRead {
            slot: 1,
            expected: 2,
            actual: 3,
        };
        assert!(stale.is_retryable());
        assert!(!CacheError::DuplicateInsert { page_id: 7 }.is_retryable());
    }

    #[test]
    fn load_errors_keep_their_source() {
        use std::error::Error as _;

        let err = CacheError::PageLoad {
            page_id: 4,
            source: Arc::new(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
        };
        let cloned = err.clone();
        assert!(cloned.source().is_some());
        assert!(cloned.to_string().contains("page 4"));
    }
}

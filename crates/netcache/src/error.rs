//! Error taxonomy for the cache coordinator.
//!
//! Nothing in this crate is allowed to fail the surrounding file read or
//! write path. Every error here describes *why* the cache could not help, and
//! every one of them degrades to "behave as if no cache were present":
//!
//! - [`CacheError::Disabled`] - caching is off for the session, or the file
//!   has no registered cache object. Permanent and silent.
//! - [`CacheError::GateClosed`] - the capability/type gate failed. Re-evaluated
//!   on every call.
//! - [`CacheError::Miss`] / [`CacheError::Obsolete`] - content is absent or
//!   stale. Triggers a remote fetch.
//! - [`CacheError::Backend`] - an unexpected store failure. Logged, then
//!   treated exactly like a miss.

use thiserror::Error;

/// Errors reported by a [`CacheBackend`](crate::CacheBackend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The object or page cannot be cached (no space, no object).
    #[error("no cache buffers available")]
    NoBuffers,

    /// The page is not present in the store.
    #[error("page not present in cache")]
    NoData,

    /// The stored object no longer matches the remote file.
    #[error("cached object is obsolete")]
    Obsolete,

    /// The store cannot be reached at all.
    #[error("cache store unavailable")]
    Unavailable,

    /// Unexpected I/O failure inside the store.
    #[error("cache store I/O failure ({code}): {message}")]
    Io {
        /// Store-specific error code.
        code: i32,
        /// Human-readable description.
        message: String,
    },
}

impl BackendError {
    /// Build an I/O error from a code and message.
    pub fn io(code: i32, message: impl Into<String>) -> Self {
        Self::Io {
            code,
            message: message.into(),
        }
    }

    /// Whether this error means "not cached" rather than "something broke".
    ///
    /// An unreachable store answers nothing, which is the same as a miss.
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            Self::NoBuffers | Self::NoData | Self::Obsolete | Self::Unavailable
        )
    }
}

/// Why the cache could not serve or accept a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Caching is off for this session, or the file has no cache object.
    #[error("caching disabled for this file")]
    Disabled,

    /// The file is not a regular file or lacks read-cache/lazy-IO capabilities.
    #[error("capability gate closed")]
    GateClosed,

    /// The content is not in the cache.
    #[error("content not cached")]
    Miss,

    /// The cached content no longer matches the remote file.
    #[error("cached content is obsolete")]
    Obsolete,

    /// Unexpected backend failure (demoted to miss semantics).
    #[error("cache backend failure: {0}")]
    Backend(BackendError),
}

impl CacheError {
    /// Classify a backend error into the cache taxonomy.
    pub fn from_backend(err: BackendError) -> Self {
        match err {
            BackendError::Obsolete => Self::Obsolete,
            e if e.is_miss() => Self::Miss,
            e => Self::Backend(e),
        }
    }

    /// Whether the caller must fetch the content from the remote side.
    ///
    /// Always true: a cache error never means the data is unavailable.
    pub fn needs_remote_fetch(&self) -> bool {
        true
    }

    /// Whether this error should fail the surrounding operation. Never.
    pub fn is_fatal(&self) -> bool {
        false
    }

    /// Whether this is an unexpected backend failure rather than a miss.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

impl From<BackendError> for CacheError {
    fn from(err: BackendError) -> Self {
        Self::from_backend(err)
    }
}

/// Errors loading or validating a [`CacheConfig`](crate::CacheConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration could not be parsed.
    #[error("invalid cache configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The configuration parsed but holds an unusable value.
    #[error("invalid cache configuration value for `{field}`: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

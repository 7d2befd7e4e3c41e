//! The persisted, hierarchical key/value store shared by every request.

use std::fmt::{Display, Formatter};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub mod fs;

pub use fs::{FsLock, FsStore};

/// Longest permitted key segment.
pub const MAX_SEGMENT_LEN: usize = 128;

/// Can `segment` be used as one component of a [`Key`]?
///
/// Segments are restricted to ASCII alphanumerics plus `-`, `_` and `.`,
/// and may not start with a dot, so they can never escape their parent or
/// collide with the store's own bookkeeping files.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= MAX_SEGMENT_LEN
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// A hierarchical store key, e.g. `votes/38001010001/<record>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Vec<String>);

impl Key {
    /// Build a key, validating every segment.
    pub fn new<I, S>(segments: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments = segments.into_iter().map(Into::into).collect::<Vec<_>>();
        if segments.is_empty() {
            return Err(StoreError::InvalidKey(String::new()));
        }
        if let Some(bad) = segments.iter().find(|s| !is_valid_segment(s)) {
            return Err(StoreError::InvalidKey(bad.clone()));
        }
        Ok(Self(segments))
    }

    /// Build a key from segments already known to be valid, such as the
    /// string forms of the model's identifier types.
    pub(crate) fn trusted<const N: usize>(segments: [&str; N]) -> Self {
        debug_assert!(segments.iter().all(|s| is_valid_segment(s)));
        Self(segments.iter().map(|s| s.to_string()).collect())
    }

    /// Extend this key by one validated segment.
    pub fn child(&self, segment: &str) -> Result<Self, StoreError> {
        if !is_valid_segment(segment) {
            return Err(StoreError::InvalidKey(segment.to_string()));
        }
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key segment {0:?}")]
    InvalidKey(String),
    #[error("key {0} already exists")]
    AlreadyExists(Key),
    #[error("value for {0} would span several lines")]
    MultilineEntry(Key),
    #[error("I/O failure on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unreadable value at {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(key: impl Display, source: std::io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn codec(key: impl Display, source: serde_json::Error) -> Self {
        Self::Codec {
            key: key.to_string(),
            source,
        }
    }
}

/// A directory-structured key/value store with atomic create, atomic
/// replace, append-only line logs and per-key advisory locks.
///
/// Values written by [`Store::create`] are never overwritten; a crash at any
/// point leaves either the complete value or nothing visible.
pub trait Store {
    /// Held while a lock on a key is in force; dropping it releases the lock.
    type Lock;

    /// Read a value, or `None` if the key holds nothing.
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically create a value. Fails with [`StoreError::AlreadyExists`]
    /// rather than overwrite.
    fn create(&self, key: &Key, value: &[u8]) -> Result<(), StoreError>;

    /// Atomically create or replace a value.
    fn replace(&self, key: &Key, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a value. Returns whether anything was there.
    fn remove(&self, key: &Key) -> Result<bool, StoreError>;

    /// Names directly below `key`, sorted.
    fn children(&self, key: &Key) -> Result<Vec<String>, StoreError>;

    /// Durably append one line to an append-only log.
    fn append_line(&self, key: &Key, line: &str) -> Result<(), StoreError>;

    /// All lines of an append-only log, in append order.
    fn lines(&self, key: &Key) -> Result<Vec<String>, StoreError>;

    /// Block until an exclusive lock on `key` is held.
    fn lock_exclusive(&self, key: &Key) -> Result<Self::Lock, StoreError>;

    /// Block until a shared lock on `key` is held.
    fn lock_shared(&self, key: &Key) -> Result<Self::Lock, StoreError>;

    fn exists(&self, key: &Key) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    fn get_json<T: DeserializeOwned>(&self, key: &Key) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::codec(key, e)),
            None => Ok(None),
        }
    }

    fn create_json<T: Serialize>(&self, key: &Key, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::codec(key, e))?;
        self.create(key, &bytes)
    }

    fn replace_json<T: Serialize>(&self, key: &Key, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::codec(key, e))?;
        self.replace(key, &bytes)
    }
}

//! Error taxonomy for the activity stream cache.
//!
//! Storage and codec failures are contained by the engine (logged, the
//! operation abandoned). Only lookups that miss are surfaced to callers.

use std::path::PathBuf;
use thiserror::Error;

use crate::cache::CodecError;
use crate::fetch::RequestToken;

pub type Result<T, E = StreamError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum StreamError {
  /// The on-disk store could not be opened, read or written.
  #[error("cache database {} unavailable: {source}", path.display())]
  StorageUnavailable {
    path: PathBuf,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  /// A stored or remote payload could not be (de)serialized.
  #[error(transparent)]
  Codec(#[from] CodecError),

  /// The fetch layer reported a failure for a request.
  #[error("request {token} failed: {message}")]
  RemoteFetchFailed {
    token: RequestToken,
    message: String,
  },

  /// Lookup for an id that is not in the working set.
  #[error("{kind} {id} not found")]
  NotFound { kind: &'static str, id: i64 },

  /// An operation that needs a subject was called before `load`.
  #[error("no activity stream loaded")]
  NotLoaded,
}

impl StreamError {
  pub fn storage(
    path: impl Into<PathBuf>,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
  ) -> Self {
    Self::StorageUnavailable {
      path: path.into(),
      source: source.into(),
    }
  }
}

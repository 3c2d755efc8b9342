//! Boundary to the remote activity service.

mod client;

pub use client::HttpRemote;

use color_eyre::Result;
use futures::future::BoxFuture;
use std::collections::BTreeMap;

use crate::cache::Payload;
use crate::stream::Subject;

/// Parameters of an incremental activity stream read.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityStreamQuery {
  pub subject: Subject,
  /// Extra fields to return for linked entities, per entity type.
  pub entity_fields: BTreeMap<String, Vec<String>>,
  /// Only events with a strictly greater id are returned.
  pub since_id: Option<i64>,
  pub limit: usize,
}

/// Remote read operations consumed by the fetch layer.
///
/// Futures are boxed and `'static` so they can be moved onto worker tasks.
pub trait RemoteService: Send + Sync + 'static {
  /// Returns a document with an `updates` list.
  fn activity_stream_read(&self, query: ActivityStreamQuery) -> BoxFuture<'static, Result<Payload>>;

  /// Returns the list of entities making up a note conversation.
  fn note_thread_read(&self, note_id: i64) -> BoxFuture<'static, Result<Payload>>;

  fn download_thumbnail(&self, url: String) -> BoxFuture<'static, Result<Vec<u8>>>;
}

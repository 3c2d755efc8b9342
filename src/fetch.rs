//! Asynchronous fetch layer.
//!
//! Requests are handed out as [`RequestToken`]s immediately; the work runs on
//! a tokio task and its outcome is posted to a channel that the owner drains
//! on its own turn.
//!
//! # Example
//!
//! ```ignore
//! let (mut dispatcher, mut outcomes) = FetchDispatcher::new(remote);
//! let token = dispatcher.submit(FetchRequest::NoteThread { note_id: 12 });
//!
//! // In the owner loop
//! while let Some(outcome) = outcomes.recv().await {
//!     stream.handle_outcome(outcome);
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::cache::Payload;
use crate::remote::{ActivityStreamQuery, RemoteService};

/// Opaque identifier correlating a completion with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(u64);

#[cfg(test)]
impl RequestToken {
  pub fn new(raw: u64) -> Self {
    Self(raw)
  }
}

impl fmt::Display for RequestToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Work that can be submitted to the fetch layer.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchRequest {
  ActivityStream(ActivityStreamQuery),
  NoteThread { note_id: i64 },
}

/// Thumbnail download for the `field` of an owning entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailRequest {
  pub image_url: String,
  pub owner_type: String,
  pub owner_id: i64,
  pub field: String,
  /// When false, nothing is downloaded and no image is reported.
  pub load_image: bool,
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
  ActivityStream(Payload),
  NoteThread(Payload),
  Thumbnail { image: Option<Vec<u8>> },
}

impl FetchResponse {
  pub fn kind(&self) -> &'static str {
    match self {
      FetchResponse::ActivityStream(_) => "activity_stream",
      FetchResponse::NoteThread(_) => "note_thread",
      FetchResponse::Thumbnail { .. } => "thumbnail",
    }
  }
}

/// Completion or failure reported for a token.
#[derive(Debug)]
pub struct FetchOutcome {
  pub token: RequestToken,
  pub result: Result<FetchResponse, String>,
}

/// The fetch layer as seen by the sync engine.
pub trait FetchService {
  fn submit(&mut self, request: FetchRequest) -> RequestToken;

  fn request_thumbnail(&mut self, request: ThumbnailRequest) -> RequestToken;

  /// Drop interest in everything in flight.
  fn clear(&mut self);
}

/// Runs requests against a [`RemoteService`] on tokio tasks.
pub struct FetchDispatcher<R: RemoteService> {
  remote: Arc<R>,
  tx: mpsc::UnboundedSender<FetchOutcome>,
  next_token: u64,
  in_flight: Vec<AbortHandle>,
}

impl<R: RemoteService> FetchDispatcher<R> {
  /// Create a dispatcher and the receiver its outcomes are posted to.
  pub fn new(remote: R) -> (Self, mpsc::UnboundedReceiver<FetchOutcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = Self {
      remote: Arc::new(remote),
      tx,
      next_token: 0,
      in_flight: Vec::new(),
    };
    (dispatcher, rx)
  }

  fn spawn<F>(&mut self, work: F) -> RequestToken
  where
    F: std::future::Future<Output = color_eyre::Result<FetchResponse>> + Send + 'static,
  {
    self.next_token += 1;
    let token = RequestToken(self.next_token);
    let tx = self.tx.clone();

    self.in_flight.retain(|handle| !handle.is_finished());
    let handle = tokio::spawn(async move {
      let result = work.await.map_err(|e| format!("{:#}", e));
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(FetchOutcome { token, result });
    });
    self.in_flight.push(handle.abort_handle());

    debug!(%token, "Dispatched request");
    token
  }
}

impl<R: RemoteService> FetchService for FetchDispatcher<R> {
  fn submit(&mut self, request: FetchRequest) -> RequestToken {
    match request {
      FetchRequest::ActivityStream(query) => {
        let work = self.remote.activity_stream_read(query);
        self.spawn(async move { work.await.map(FetchResponse::ActivityStream) })
      }
      FetchRequest::NoteThread { note_id } => {
        let work = self.remote.note_thread_read(note_id);
        self.spawn(async move { work.await.map(FetchResponse::NoteThread) })
      }
    }
  }

  fn request_thumbnail(&mut self, request: ThumbnailRequest) -> RequestToken {
    if !request.load_image {
      return self.spawn(async { Ok(FetchResponse::Thumbnail { image: None }) });
    }

    let work = self.remote.download_thumbnail(request.image_url);
    self.spawn(async move {
      let image = work.await?;
      Ok(FetchResponse::Thumbnail {
        image: (!image.is_empty()).then_some(image),
      })
    })
  }

  fn clear(&mut self) {
    for handle in self.in_flight.drain(..) {
      handle.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stream::Subject;
  use color_eyre::eyre::eyre;
  use futures::future::BoxFuture;
  use futures::FutureExt;
  use serde_json::json;
  use std::collections::BTreeMap;
  use std::time::Duration;

  struct FakeRemote;

  impl RemoteService for FakeRemote {
    fn activity_stream_read(
      &self,
      query: ActivityStreamQuery,
    ) -> BoxFuture<'static, color_eyre::Result<Payload>> {
      async move {
        Ok(Payload::from_remote(json!({
          "updates": [{"id": query.since_id.unwrap_or(0) + 1, "update_type": "create"}]
        })))
      }
      .boxed()
    }

    fn note_thread_read(&self, note_id: i64) -> BoxFuture<'static, color_eyre::Result<Payload>> {
      async move {
        if note_id < 0 {
          return Err(eyre!("note {} does not exist", note_id));
        }
        tokio::time::sleep(Duration::from_millis(note_id as u64)).await;
        Ok(Payload::from_remote(json!([{"type": "Note", "id": note_id}])))
      }
      .boxed()
    }

    fn download_thumbnail(&self, url: String) -> BoxFuture<'static, color_eyre::Result<Vec<u8>>> {
      async move { Ok(url.into_bytes()) }.boxed()
    }
  }

  fn query() -> ActivityStreamQuery {
    ActivityStreamQuery {
      subject: Subject::new("Shot", 1),
      entity_fields: BTreeMap::new(),
      since_id: Some(41),
      limit: 100,
    }
  }

  fn thumbnail(url: &str, load_image: bool) -> ThumbnailRequest {
    ThumbnailRequest {
      image_url: url.to_string(),
      owner_type: "HumanUser".to_string(),
      owner_id: 3,
      field: "image".to_string(),
      load_image,
    }
  }

  #[tokio::test]
  async fn test_tokens_are_unique() {
    let (mut dispatcher, _rx) = FetchDispatcher::new(FakeRemote);
    let a = dispatcher.submit(FetchRequest::ActivityStream(query()));
    let b = dispatcher.submit(FetchRequest::NoteThread { note_id: 1 });
    let c = dispatcher.request_thumbnail(thumbnail("x", true));
    assert_ne!(a, b);
    assert_ne!(b, c);
    assert_ne!(a, c);
  }

  #[tokio::test]
  async fn test_outcome_carries_token_and_payload() {
    let (mut dispatcher, mut rx) = FetchDispatcher::new(FakeRemote);
    let token = dispatcher.submit(FetchRequest::ActivityStream(query()));

    let outcome = rx.recv().await.unwrap();
    assert_eq!(outcome.token, token);
    match outcome.result {
      Ok(FetchResponse::ActivityStream(payload)) => {
        let updates = payload.get("updates").cloned().unwrap().into_list().unwrap();
        assert_eq!(updates[0].get("id"), Some(&Payload::Int(42)));
      }
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_failure_is_reported_as_message() {
    let (mut dispatcher, mut rx) = FetchDispatcher::new(FakeRemote);
    let token = dispatcher.submit(FetchRequest::NoteThread { note_id: -1 });

    let outcome = rx.recv().await.unwrap();
    assert_eq!(outcome.token, token);
    assert!(outcome.result.unwrap_err().contains("does not exist"));
  }

  #[tokio::test]
  async fn test_thumbnail_without_loading_reports_no_image() {
    let (mut dispatcher, mut rx) = FetchDispatcher::new(FakeRemote);
    dispatcher.request_thumbnail(thumbnail("https://example.com/a.png", false));
    dispatcher.request_thumbnail(thumbnail("", true));

    for _ in 0..2 {
      let outcome = rx.recv().await.unwrap();
      assert!(matches!(outcome.result, Ok(FetchResponse::Thumbnail { image: None })));
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_clear_aborts_in_flight_work() {
    let (mut dispatcher, mut rx) = FetchDispatcher::new(FakeRemote);
    dispatcher.submit(FetchRequest::NoteThread { note_id: 200 });
    dispatcher.clear();

    let quick = dispatcher.submit(FetchRequest::NoteThread { note_id: 1 });
    let outcome = rx.recv().await.unwrap();
    assert_eq!(outcome.token, quick);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
  }
}

//! Incremental sync engine for one activity stream.
//!
//! # State Machine
//!
//! ```text
//! +----------------+
//! |    Unloaded    | subject=None
//! +-------+--------+
//!         | load()
//!         v
//! +----------------+   rescan()    +----------------+
//! | Loaded (idle)  | ------------> | Loaded (sync)  | rescan_token=Some
//! |                | <------------ |                |
//! +----------------+  completion   +----------------+
//! ```
//!
//! Any `load()` starts over: correlations are dropped so late completions
//! for the previous subject find nothing to match.

use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::events::{StreamEvent, Thumbnail};
use super::types::{ActivityEvent, ReplyThread, Subject, ThumbnailKind};
use crate::cache::{normalize, ActivityStorage, Payload, WorkingSet};
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::fetch::{FetchOutcome, FetchRequest, FetchResponse, FetchService, RequestToken, ThumbnailRequest};
use crate::remote::ActivityStreamQuery;

/// Thread fetch issued for a reply update.
#[derive(Debug, Clone, Copy)]
struct NoteRequest {
  update_id: i64,
  note_id: i64,
}

/// Thumbnail fetch issued for an event.
#[derive(Debug, Clone, Copy)]
struct ThumbnailTarget {
  activity_id: i64,
  kind: ThumbnailKind,
}

/// Cache and sync state for the loaded subject.
pub struct ActivityStream<F: FetchService, S: ActivityStorage> {
  fetcher: F,
  storage: S,
  config: StreamConfig,
  subject: Option<Subject>,
  working_set: WorkingSet,
  /// Token of the one rescan whose result we still want
  rescan_token: Option<RequestToken>,
  note_requests: HashMap<RequestToken, NoteRequest>,
  thumbnail_requests: HashMap<RequestToken, ThumbnailTarget>,
  events_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl<F: FetchService, S: ActivityStorage> ActivityStream<F, S> {
  /// Create an engine and the receiver its notifications are posted to.
  pub fn new(
    fetcher: F,
    storage: S,
    config: StreamConfig,
  ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let stream = Self {
      fetcher,
      storage,
      config,
      subject: None,
      working_set: WorkingSet::new(),
      rescan_token: None,
      note_requests: HashMap::new(),
      thumbnail_requests: HashMap::new(),
      events_tx,
    };
    (stream, events_rx)
  }

  fn reset(&mut self) {
    self.fetcher.clear();
    self.subject = None;
    self.working_set = WorkingSet::new();
    self.rescan_token = None;
    self.note_requests.clear();
    self.thumbnail_requests.clear();
  }

  /// Drop all state and load the cached stream for `subject`.
  ///
  /// Returns the number of events loaded from the store.
  pub fn load(&mut self, subject: Subject) -> usize {
    self.reset();
    debug!(%subject, "Loading activity stream data");

    self.working_set = WorkingSet::load(&self.storage, &subject, self.config.load_limit);
    self.subject = Some(subject);
    self.working_set.len()
  }

  /// Ask for events newer than the newest one known.
  ///
  /// Supersedes any rescan still outstanding.
  pub fn rescan(&mut self) -> Result<RequestToken> {
    let subject = self.subject.clone().ok_or(StreamError::NotLoaded)?;

    let query = ActivityStreamQuery {
      subject,
      entity_fields: self.config.entity_fields.clone(),
      since_id: self.working_set.high_water_mark(),
      limit: self.config.page_size,
    };
    debug!(since_id = ?query.since_id, "Requesting activity stream updates");

    let token = self.fetcher.submit(FetchRequest::ActivityStream(query));
    if let Some(stale) = self.rescan_token.replace(token) {
      debug!(%stale, %token, "Superseding outstanding rescan");
    }
    Ok(token)
  }

  /// Event ids ascending, keeping only the newest `limit` if given.
  pub fn activity_ids(&self, limit: Option<usize>) -> Vec<i64> {
    self.working_set.activity_ids(limit)
  }

  pub fn event(&self, activity_id: i64) -> Result<&ActivityEvent> {
    self.working_set.event(activity_id)
  }

  pub fn thread(&self, note_id: i64) -> Result<&ReplyThread> {
    self.working_set.thread(note_id)
  }

  /// Request thumbnails for the author and the primary entity of an event.
  ///
  /// Returns one token per download issued.
  pub fn request_thumbnails(&mut self, activity_id: i64) -> Result<Vec<RequestToken>> {
    let requests: Vec<(ThumbnailKind, ThumbnailRequest)> = self
      .working_set
      .event(activity_id)?
      .thumbnail_sources()
      .into_iter()
      .filter_map(|(kind, entity)| {
        Some((
          kind,
          ThumbnailRequest {
            image_url: entity.image_url()?.to_string(),
            owner_type: entity.entity_type.clone(),
            owner_id: entity.id,
            field: "image".to_string(),
            load_image: true,
          },
        ))
      })
      .collect();

    let tokens = requests
      .into_iter()
      .map(|(kind, request)| {
        let token = self.fetcher.request_thumbnail(request);
        self
          .thumbnail_requests
          .insert(token, ThumbnailTarget { activity_id, kind });
        token
      })
      .collect();

    Ok(tokens)
  }

  pub fn subject(&self) -> Option<&Subject> {
    self.subject.as_ref()
  }

  pub fn is_syncing(&self) -> bool {
    self.rescan_token.is_some()
  }

  /// Tokens whose completion is still of interest.
  pub fn pending_tokens(&self) -> Vec<RequestToken> {
    let mut tokens: Vec<RequestToken> = self
      .rescan_token
      .iter()
      .chain(self.note_requests.keys())
      .chain(self.thumbnail_requests.keys())
      .copied()
      .collect();
    tokens.sort();
    tokens.dedup();
    tokens
  }

  pub fn handle_outcome(&mut self, outcome: FetchOutcome) {
    match outcome.result {
      Ok(response) => self.on_completed(outcome.token, response),
      Err(message) => self.on_failed(outcome.token, message),
    }
  }

  /// Apply a completed request.
  ///
  /// The rescan slot and both correlation maps are each checked on their
  /// own, so a token registered in more than one is handled by each.
  pub fn on_completed(&mut self, token: RequestToken, response: FetchResponse) {
    if self.rescan_token == Some(token) {
      self.rescan_token = None;
      self.apply_updates(&response);
    }

    if let Some(request) = self.note_requests.remove(&token) {
      self.apply_thread(request, &response);
    }

    if let Some(target) = self.thumbnail_requests.remove(&token) {
      self.apply_thumbnail(target, &response);
    }
  }

  /// A request failed. Nothing is retried and no state changes.
  pub fn on_failed(&mut self, token: RequestToken, message: String) {
    let err = StreamError::RemoteFetchFailed { token, message };
    warn!("Could not retrieve activity stream data: {}", err);
  }

  fn apply_updates(&mut self, response: &FetchResponse) {
    let FetchResponse::ActivityStream(payload) = response else {
      warn!(kind = response.kind(), "Rescan completed with unexpected response");
      return;
    };
    let Some(subject) = self.subject.clone() else {
      return;
    };

    let payload = normalize(payload.clone());
    let Some(Payload::List(updates)) = payload.get("updates") else {
      warn!("Activity stream response has no updates list");
      return;
    };
    info!(%subject, "Received {} activity stream updates", updates.len());

    let events: Vec<ActivityEvent> = updates
      .iter()
      .filter_map(|update| match ActivityEvent::from_payload(update) {
        Ok(event) => Some(event),
        Err(e) => {
          warn!("Skipping malformed activity update: {}", e);
          None
        }
      })
      .collect();

    if let Err(e) = self.storage.upsert_events(&subject, &events) {
      error!("Could not add activity stream data to cache: {}", e);
    }

    let mut new_ids = Vec::with_capacity(events.len());
    for event in events {
      if let Some(note_id) = event.reply_note_id() {
        debug!(note_id, "Requesting note thread download");
        let token = self.fetcher.submit(FetchRequest::NoteThread { note_id });
        self.note_requests.insert(
          token,
          NoteRequest {
            update_id: event.id,
            note_id,
          },
        );
      }
      new_ids.push(event.id);
      self.working_set.merge_event(event);
    }

    new_ids.sort_unstable();
    self.emit(StreamEvent::EventsUpdated(new_ids));
  }

  fn apply_thread(&mut self, request: NoteRequest, response: &FetchResponse) {
    let FetchResponse::NoteThread(payload) = response else {
      warn!(kind = response.kind(), "Note thread request completed with unexpected response");
      return;
    };
    debug!(update_id = request.update_id, "Received note reply info");

    let thread = match ReplyThread::from_payload(request.note_id, &normalize(payload.clone())) {
      Ok(thread) => thread,
      Err(e) => {
        warn!(note_id = request.note_id, "Skipping malformed note thread: {}", e);
        return;
      }
    };

    if let Err(e) = self.storage.replace_thread(request.update_id, &thread) {
      error!("Could not add note data to cache: {}", e);
    }

    self.working_set.replace_thread(thread);
    self.working_set.link_note(request.update_id, request.note_id);
    self.emit(StreamEvent::ThreadUpdated(request.note_id));
  }

  fn apply_thumbnail(&mut self, target: ThumbnailTarget, response: &FetchResponse) {
    match response {
      FetchResponse::Thumbnail { image: Some(image) } => {
        self.emit(StreamEvent::ThumbnailReady(Thumbnail {
          activity_id: target.activity_id,
          kind: target.kind,
          image: image.clone(),
        }));
      }
      FetchResponse::Thumbnail { image: None } => {
        debug!(activity_id = target.activity_id, kind = %target.kind, "Thumbnail returned no image");
      }
      other => {
        warn!(kind = other.kind(), "Thumbnail request completed with unexpected response");
      }
    }
  }

  fn emit(&self, event: StreamEvent) {
    // Ignore send errors - nobody may be listening
    let _ = self.events_tx.send(event);
  }
}

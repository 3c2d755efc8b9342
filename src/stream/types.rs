//! Typed records for the activity stream.
//!
//! Remote documents are parsed into these at the boundary. Fields this crate
//! does not interpret are carried along in `extra` so nothing is lost when a
//! record is written back to the store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::cache::{CodecError, Payload};

/// The (entity type, entity id) pair whose stream is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
  pub entity_type: String,
  pub entity_id: i64,
}

impl Subject {
  pub fn new(entity_type: impl Into<String>, entity_id: i64) -> Self {
    Self {
      entity_type: entity_type.into(),
      entity_id,
    }
  }
}

impl fmt::Display for Subject {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.entity_type, self.entity_id)
  }
}

/// Tag describing what an activity event records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UpdateType {
  Create,
  Update,
  CreateReply,
  CreateNote,
  /// Tags this crate has no special handling for; kept verbatim.
  Other(String),
}

impl From<String> for UpdateType {
  fn from(tag: String) -> Self {
    match tag.as_str() {
      "create" => UpdateType::Create,
      "update" => UpdateType::Update,
      "create_reply" => UpdateType::CreateReply,
      "create_note" => UpdateType::CreateNote,
      _ => UpdateType::Other(tag),
    }
  }
}

impl From<UpdateType> for String {
  fn from(update_type: UpdateType) -> Self {
    match update_type {
      UpdateType::Create => "create".to_string(),
      UpdateType::Update => "update".to_string(),
      UpdateType::CreateReply => "create_reply".to_string(),
      UpdateType::CreateNote => "create_note".to_string(),
      UpdateType::Other(tag) => tag,
    }
  }
}

/// Link to another entity, optionally carrying a thumbnail URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
  #[serde(rename = "type")]
  pub entity_type: String,
  pub id: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl EntityRef {
  /// Thumbnail URL, treating an empty string as absent.
  pub fn image_url(&self) -> Option<&str> {
    self.image.as_deref().filter(|url| !url.is_empty())
  }
}

/// A single entry in the activity stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
  pub id: i64,
  pub update_type: UpdateType,
  #[serde(default)]
  pub primary_entity: Option<EntityRef>,
  #[serde(default)]
  pub created_by: Option<EntityRef>,
  /// Epoch seconds.
  #[serde(default)]
  pub created_at: Option<f64>,
  /// Reply thread linked to this event. Lives in its own store column.
  #[serde(skip)]
  pub note_id: Option<i64>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl ActivityEvent {
  pub fn from_payload(payload: &Payload) -> Result<Self, CodecError> {
    payload.to_record()
  }

  pub fn to_payload(&self) -> Result<Payload, CodecError> {
    Payload::from_record(self)
  }

  /// Note whose thread should be fetched for this event, if any.
  pub fn reply_note_id(&self) -> Option<i64> {
    match self.update_type {
      UpdateType::CreateReply => self.primary_entity.as_ref().map(|e| e.id),
      _ => None,
    }
  }

  /// Entities on this event that carry a thumbnail.
  pub fn thumbnail_sources(&self) -> Vec<(ThumbnailKind, &EntityRef)> {
    [
      (ThumbnailKind::CreatedBy, self.created_by.as_ref()),
      (ThumbnailKind::PrimaryEntity, self.primary_entity.as_ref()),
    ]
    .into_iter()
    .filter_map(|(kind, entity)| entity.filter(|e| e.image_url().is_some()).map(|e| (kind, e)))
    .collect()
  }
}

/// One item of a note conversation: the note itself, a reply or an attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEntry {
  #[serde(rename = "type")]
  pub entity_type: String,
  pub id: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub content: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_at: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub user: Option<EntityRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub created_by: Option<EntityRef>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl ReplyEntry {
  pub fn author(&self) -> Option<&EntityRef> {
    self.user.as_ref().or(self.created_by.as_ref())
  }
}

/// Full conversation for a note. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyThread {
  pub note_id: i64,
  pub entries: Vec<ReplyEntry>,
}

impl ReplyThread {
  pub fn from_payload(note_id: i64, payload: &Payload) -> Result<Self, CodecError> {
    if !matches!(payload, Payload::List(_)) {
      return Err(CodecError::Shape {
        expected: "list of thread entries",
      });
    }
    Ok(Self {
      note_id,
      entries: payload.to_record()?,
    })
  }

  pub fn to_payload(&self) -> Result<Payload, CodecError> {
    Payload::from_record(&self.entries)
  }
}

/// Which entity on an event a thumbnail belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThumbnailKind {
  CreatedBy,
  PrimaryEntity,
}

impl fmt::Display for ThumbnailKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ThumbnailKind::CreatedBy => write!(f, "created_by"),
      ThumbnailKind::PrimaryEntity => write!(f, "primary_entity"),
    }
  }
}

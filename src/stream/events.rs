use super::types::ThumbnailKind;

/// Notifications raised to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
  /// New events arrived; ids ascending
  EventsUpdated(Vec<i64>),
  /// The thread for this note id was replaced
  ThreadUpdated(i64),
  /// A thumbnail finished downloading
  ThumbnailReady(Thumbnail),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thumbnail {
  pub activity_id: i64,
  pub kind: ThumbnailKind,
  pub image: Vec<u8>,
}

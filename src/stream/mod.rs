//! Activity stream model and the incremental sync engine.

mod engine;
mod events;
mod types;

pub use engine::ActivityStream;
pub use events::StreamEvent;
pub use types::{ActivityEvent, ReplyThread, Subject, UpdateType};

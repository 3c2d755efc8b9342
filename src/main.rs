mod cache;
mod config;
mod error;
mod fetch;
mod remote;
mod stream;

use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::{ActivityStorage, NoopStorage, SqliteStorage, WorkingSet};
use crate::config::Config;
use crate::fetch::FetchDispatcher;
use crate::remote::HttpRemote;
use crate::stream::{ActivityEvent, ActivityStream, ReplyThread, StreamEvent, Subject, UpdateType};

#[derive(Parser, Debug)]
#[command(name = "feedsync")]
#[command(about = "Local cache and incremental sync for activity streams")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/feedsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the cached activity stream for an entity
  Show {
    entity_type: String,
    entity_id: i64,
    /// Only print the newest N events
    #[arg(short, long)]
    limit: Option<usize>,
  },
  /// Fetch new activity for an entity and update the cache
  Sync {
    entity_type: String,
    entity_id: i64,
    /// Also download thumbnails for new events
    #[arg(long)]
    thumbnails: bool,
    /// Give up on outstanding requests after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let cache_dir = config.cache_dir()?;
  std::fs::create_dir_all(&cache_dir)?;
  let file_appender = tracing_appender::rolling::never(&cache_dir, "feedsync.log");
  let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "feedsync=info,warn".into()))
    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
    .with(fmt::layer().with_writer(std::io::stderr))
    .init();

  let storage = open_storage(&config)?;

  match args.command {
    Command::Show {
      entity_type,
      entity_id,
      limit,
    } => show(&config, storage, Subject::new(entity_type, entity_id), limit),
    Command::Sync {
      entity_type,
      entity_id,
      thumbnails,
      timeout_secs,
    } => {
      sync(
        &config,
        storage,
        Subject::new(entity_type, entity_id),
        thumbnails,
        Duration::from_secs(timeout_secs),
      )
      .await
    }
  }
}

fn open_storage(config: &Config) -> Result<Box<dyn ActivityStorage>> {
  if !config.cache.enabled {
    return Ok(Box::new(NoopStorage));
  }
  Ok(Box::new(SqliteStorage::open(config.store_path()?)?))
}

fn show(
  config: &Config,
  storage: Box<dyn ActivityStorage>,
  subject: Subject,
  limit: Option<usize>,
) -> Result<()> {
  let working_set = WorkingSet::load(&storage, &subject, config.stream.load_limit);

  for id in working_set.activity_ids(limit) {
    let event = working_set.event(id)?;
    println!("{}", describe(event));
    if let Some(thread) = event.note_id.and_then(|note_id| working_set.thread(note_id).ok()) {
      print_thread(thread);
    }
  }

  Ok(())
}

async fn sync(
  config: &Config,
  storage: Box<dyn ActivityStorage>,
  subject: Subject,
  thumbnails: bool,
  timeout: Duration,
) -> Result<()> {
  let remote = HttpRemote::new(config)?;
  let (dispatcher, mut outcomes) = FetchDispatcher::new(remote);
  let (mut stream, mut events) = ActivityStream::new(dispatcher, storage, config.stream.clone());

  let loaded = stream.load(subject.clone());
  info!(%subject, "{} events loaded from cache", loaded);
  stream.rescan()?;

  let deadline = tokio::time::Instant::now() + timeout;
  let mut failed = HashSet::new();

  loop {
    let pending = stream.pending_tokens();
    if pending.iter().all(|token| failed.contains(token)) {
      break;
    }

    let outcome = match tokio::time::timeout_at(deadline, outcomes.recv()).await {
      Ok(Some(outcome)) => outcome,
      Ok(None) => break,
      Err(_) => {
        warn!(
          syncing = stream.is_syncing(),
          "Timed out with {} requests outstanding",
          pending.len()
        );
        break;
      }
    };

    if outcome.result.is_err() {
      failed.insert(outcome.token);
    }
    stream.handle_outcome(outcome);

    while let Ok(event) = events.try_recv() {
      match event {
        StreamEvent::EventsUpdated(ids) => {
          println!("{} new events", ids.len());
          for id in ids {
            println!("{}", describe(stream.event(id)?));
            if thumbnails {
              stream.request_thumbnails(id)?;
            }
          }
        }
        StreamEvent::ThreadUpdated(note_id) => {
          println!("note {} updated", note_id);
          print_thread(stream.thread(note_id)?);
        }
        StreamEvent::ThumbnailReady(thumbnail) => {
          println!(
            "thumbnail {} for event {} ({} bytes)",
            thumbnail.kind,
            thumbnail.activity_id,
            thumbnail.image.len()
          );
        }
      }
    }
  }

  if let Some(subject) = stream.subject() {
    println!("{} events cached for {}", stream.activity_ids(None).len(), subject);
  }
  Ok(())
}

fn describe(event: &ActivityEvent) -> String {
  let when = event
    .created_at
    .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))
    .map(|ts| ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
    .unwrap_or_else(|| "-".to_string());

  let actor = event
    .created_by
    .as_ref()
    .and_then(|e| e.name.clone())
    .unwrap_or_else(|| "someone".to_string());

  let target = event
    .primary_entity
    .as_ref()
    .map(|e| match &e.name {
      Some(name) => format!("{} {} ({})", e.entity_type, e.id, name),
      None => format!("{} {}", e.entity_type, e.id),
    })
    .unwrap_or_default();

  let action = match &event.update_type {
    UpdateType::Create => "created",
    UpdateType::Update => "updated",
    UpdateType::CreateReply => "replied to",
    UpdateType::CreateNote => "wrote",
    UpdateType::Other(tag) => tag.as_str(),
  };

  format!("[{}] {} {} {} {}", event.id, when, actor, action, target)
}

fn print_thread(thread: &ReplyThread) {
  for entry in &thread.entries {
    let author = entry
      .author()
      .and_then(|a| a.name.as_deref())
      .unwrap_or("someone");
    if let Some(content) = &entry.content {
      println!("    {}: {}", author, content);
    }
  }
}

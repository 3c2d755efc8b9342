use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use url::Url;

use super::{ActivityStreamQuery, RemoteService};
use crate::cache::Payload;
use crate::config::Config;

/// REST client for the remote activity service
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base: Url,
  token: String,
}

impl HttpRemote {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_token(&config.api.url, token)
  }

  pub fn with_token(api_url: &str, token: String) -> Result<Self> {
    let base = Url::parse(api_url).map_err(|e| eyre!("Invalid API url {}: {}", api_url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("API url {} cannot be used as a base", api_url));
    }

    let client = reqwest::Client::builder()
      .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    // cannot_be_a_base was rejected in the constructor
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  fn activity_stream_url(&self, query: &ActivityStreamQuery) -> Result<Url> {
    let entity_id = query.subject.entity_id.to_string();
    let mut url = self.endpoint(&[
      "entity",
      &query.subject.entity_type,
      &entity_id,
      "activity_stream",
    ]);

    let entity_fields = serde_json::to_string(&query.entity_fields)?;
    {
      let mut pairs = url.query_pairs_mut();
      if let Some(since_id) = query.since_id {
        pairs.append_pair("min_id", &since_id.to_string());
      }
      pairs.append_pair("limit", &query.limit.to_string());
      pairs.append_pair("entity_fields", &entity_fields);
    }

    Ok(url)
  }

  fn thread_url(&self, note_id: i64) -> Url {
    self.endpoint(&["entity", "notes", &note_id.to_string(), "thread_contents"])
  }

  /// GET a JSON document and return its `data` member.
  async fn get_data(&self, url: Url) -> Result<Payload> {
    let bytes = self
      .client
      .get(url.clone())
      .bearer_auth(&self.token)
      .header(reqwest::header::ACCEPT, "application/json")
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

    let mut body: Value = serde_json::from_slice(&bytes)
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))?;

    let data = body
      .get_mut("data")
      .map(Value::take)
      .ok_or_else(|| eyre!("Response from {} has no data member", url))?;

    Ok(Payload::from_remote(data))
  }
}

impl RemoteService for HttpRemote {
  fn activity_stream_read(&self, query: ActivityStreamQuery) -> BoxFuture<'static, Result<Payload>> {
    let this = self.clone();
    async move {
      let url = this.activity_stream_url(&query)?;
      this.get_data(url).await
    }
    .boxed()
  }

  fn note_thread_read(&self, note_id: i64) -> BoxFuture<'static, Result<Payload>> {
    let this = self.clone();
    async move { this.get_data(this.thread_url(note_id)).await }.boxed()
  }

  fn download_thumbnail(&self, url: String) -> BoxFuture<'static, Result<Vec<u8>>> {
    let this = self.clone();
    async move {
      let bytes = this
        .client
        .get(&url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| eyre!("Thumbnail download from {} failed: {}", url, e))?
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read thumbnail from {}: {}", url, e))?;
      Ok(bytes.to_vec())
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stream::Subject;
  use std::collections::BTreeMap;

  fn remote(url: &str) -> HttpRemote {
    HttpRemote::with_token(url, "secret".to_string()).unwrap()
  }

  #[test]
  fn test_activity_stream_url() {
    let query = ActivityStreamQuery {
      subject: Subject::new("Shot", 1234),
      entity_fields: BTreeMap::from([("Shot".to_string(), vec!["image".to_string()])]),
      since_id: Some(77),
      limit: 100,
    };

    let url = remote("https://site.example.com/api/v1/")
      .activity_stream_url(&query)
      .unwrap();

    assert_eq!(url.path(), "/api/v1/entity/Shot/1234/activity_stream");
    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert_eq!(
      pairs,
      vec![
        ("min_id".to_string(), "77".to_string()),
        ("limit".to_string(), "100".to_string()),
        ("entity_fields".to_string(), r#"{"Shot":["image"]}"#.to_string()),
      ]
    );
  }

  #[test]
  fn test_first_read_has_no_min_id() {
    let query = ActivityStreamQuery {
      subject: Subject::new("Asset", 9),
      entity_fields: BTreeMap::new(),
      since_id: None,
      limit: 10,
    };

    let url = remote("https://site.example.com/api/v1")
      .activity_stream_url(&query)
      .unwrap();

    assert!(url.query_pairs().all(|(k, _)| k != "min_id"));
  }

  #[test]
  fn test_thread_url() {
    let url = remote("https://site.example.com/api/v1").thread_url(55);
    assert_eq!(url.path(), "/api/v1/entity/notes/55/thread_contents");
  }

  #[test]
  fn test_rejects_non_base_url() {
    assert!(HttpRemote::with_token("mailto:someone@example.com", String::new()).is_err());
  }
}

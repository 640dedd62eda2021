use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::config::{Config, RemoteConfig};
use crate::queue::{OfflineRecord, RecordKind};

use super::RemoteStore;

/// REST client for the hosted backend's table endpoints.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  authenticated: bool,
}

impl HttpRemote {
  /// Build a client using the API key from the environment. Without a key
  /// the client still constructs, so records can be queued, but every
  /// upsert fails.
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    Self::build(config, Config::get_api_key().ok().as_deref())
  }

  pub fn with_api_key(config: &RemoteConfig, api_key: &str) -> Result<Self> {
    Self::build(config, Some(api_key))
  }

  fn build(config: &RemoteConfig, api_key: Option<&str>) -> Result<Self> {
    let base_url = parse_base_url(&config.url)?;

    let mut headers = HeaderMap::new();
    if let Some(api_key) = api_key {
      let key = HeaderValue::from_str(api_key).map_err(|e| eyre!("Invalid API key: {}", e))?;
      let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
        .map_err(|e| eyre!("Invalid API key: {}", e))?;
      headers.insert("apikey", key);
      headers.insert(AUTHORIZATION, bearer);
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
      "Prefer",
      HeaderValue::from_static("resolution=merge-duplicates,return=minimal"),
    );

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(config.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      authenticated: api_key.is_some(),
    })
  }

  /// Upsert endpoint for a record kind, keyed on `id`.
  fn endpoint(&self, kind: RecordKind) -> Result<Url> {
    let mut url = self
      .base_url
      .join(&format!("rest/v1/{}", kind.table()))
      .map_err(|e| eyre!("Failed to build endpoint for {}: {}", kind, e))?;
    url.query_pairs_mut().append_pair("on_conflict", "id");
    Ok(url)
  }
}

impl RemoteStore for HttpRemote {
  async fn upsert(&self, record: &OfflineRecord) -> Result<()> {
    if !self.authenticated {
      return Err(eyre!("Backend API key not set, cannot send record {}", record.id));
    }

    let url = self.endpoint(record.kind)?;
    let body = serde_json::to_vec(&upsert_body(record))
      .map_err(|e| eyre!("Failed to serialize record {}: {}", record.id, e))?;

    debug!(id = %record.id, kind = %record.kind, %url, "upserting record");

    let response = self
      .client
      .post(url)
      .body(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to send record {}: {}", record.id, e))?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }

    let text = response.text().await.unwrap_or_default();
    Err(eyre!(
      "Remote rejected record {} ({}): {}",
      record.id,
      status,
      text.trim()
    ))
  }
}

/// Ensure the base URL ends with a slash so `join` appends instead of
/// replacing the last path segment.
fn parse_base_url(raw: &str) -> Result<Url> {
  let normalized = if raw.ends_with('/') {
    raw.to_string()
  } else {
    format!("{}/", raw)
  };
  Url::parse(&normalized).map_err(|e| eyre!("Invalid remote url '{}': {}", raw, e))
}

/// Row sent to the backend. The record id is the conflict key so a resent
/// record updates the row it created the first time.
fn upsert_body(record: &OfflineRecord) -> Value {
  let mut row = match &record.payload {
    Value::Object(fields) => fields.clone(),
    other => {
      let mut fields = Map::new();
      fields.insert("data".to_string(), other.clone());
      fields
    }
  };
  row.insert("id".to_string(), Value::String(record.id.clone()));
  Value::Object(row)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use tokio::task::JoinHandle;

  /// Accept one HTTP request, answer it with `response`, and hand back the
  /// raw request text.
  async fn serve_once(response: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut request = Vec::new();
      let mut buf = [0u8; 4096];

      let header_end = loop {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before headers ended");
        request.extend_from_slice(&buf[..n]);
        if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
          break pos + 4;
        }
      };

      let head = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
      let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map(|v| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);

      while request.len() < header_end + content_length {
        let n = socket.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before body ended");
        request.extend_from_slice(&buf[..n]);
      }

      socket.write_all(response.as_bytes()).await.unwrap();
      socket.shutdown().await.unwrap();
      String::from_utf8(request).unwrap()
    });

    (url, handle)
  }

  fn remote(url: &str) -> HttpRemote {
    let config = RemoteConfig {
      url: url.to_string(),
      timeout_secs: 1,
    };
    HttpRemote::with_api_key(&config, "test-key").unwrap()
  }

  #[test]
  fn test_endpoint_per_kind() {
    let remote = remote("https://example.co");
    let url = remote.endpoint(RecordKind::GoalNote).unwrap();
    assert_eq!(
      url.as_str(),
      "https://example.co/rest/v1/goal_notes?on_conflict=id"
    );
  }

  #[test]
  fn test_endpoint_keeps_base_path() {
    let remote = remote("https://example.co/backend");
    let url = remote.endpoint(RecordKind::Habit).unwrap();
    assert_eq!(
      url.as_str(),
      "https://example.co/backend/rest/v1/habits?on_conflict=id"
    );
  }

  #[tokio::test]
  async fn test_upsert_without_key_fails_fast() {
    let config = RemoteConfig {
      url: "https://example.co".to_string(),
      timeout_secs: 1,
    };
    let remote = HttpRemote::build(&config, None).unwrap();
    let record = OfflineRecord::new(RecordKind::Goal, json!({}));

    let err = remote.upsert(&record).await.unwrap_err();
    assert!(err.to_string().contains("API key not set"));
  }

  #[test]
  fn test_invalid_url_rejected() {
    let config = RemoteConfig {
      url: "not a url".to_string(),
      timeout_secs: 1,
    };
    assert!(HttpRemote::with_api_key(&config, "k").is_err());
  }

  #[test]
  fn test_body_uses_record_id() {
    let record = OfflineRecord::with_id(
      "rec-1",
      RecordKind::Goal,
      json!({"id": "stale", "title": "Read more"}),
    );
    assert_eq!(
      upsert_body(&record),
      json!({"id": "rec-1", "title": "Read more"})
    );
  }

  #[test]
  fn test_body_wraps_non_object_payload() {
    let record = OfflineRecord::with_id("rec-2", RecordKind::JournalEntry, json!("plain text"));
    assert_eq!(
      upsert_body(&record),
      json!({"id": "rec-2", "data": "plain text"})
    );
  }

  #[tokio::test]
  async fn test_upsert_posts_record_to_table() {
    let (url, server) =
      serve_once("HTTP/1.1 201 Created\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").await;
    let remote = remote(&url);
    let record = OfflineRecord::with_id("rec-1", RecordKind::Goal, json!({"title": "Run"}));

    remote.upsert(&record).await.unwrap();

    let request = server.await.unwrap();
    let (head, body) = request.split_once("\r\n\r\n").unwrap();
    let head = head.to_lowercase();
    assert!(
      request.starts_with("POST /rest/v1/goals?on_conflict=id HTTP/1.1\r\n"),
      "{request}"
    );
    assert!(head.contains("\r\napikey: test-key\r\n"), "{head}");
    assert!(head.contains("\r\nauthorization: bearer test-key\r\n"), "{head}");
    assert!(head.contains("\r\nprefer: resolution=merge-duplicates"), "{head}");
    assert!(head.contains("\r\ncontent-type: application/json\r\n"), "{head}");

    let sent: Value = serde_json::from_str(body).unwrap();
    assert_eq!(sent, json!({"id": "rec-1", "title": "Run"}));
  }

  #[tokio::test]
  async fn test_upsert_rejection_carries_status_and_body() {
    let (url, server) = serve_once(
      "HTTP/1.1 400 Bad Request\r\ncontent-type: application/json\r\ncontent-length: 26\r\nconnection: close\r\n\r\n{\"message\":\"bad goal row\"}",
    )
    .await;
    let remote = remote(&url);
    let record = OfflineRecord::with_id("rec-2", RecordKind::Habit, json!({}));

    let err = remote.upsert(&record).await.unwrap_err().to_string();

    assert!(err.contains("400"), "{err}");
    assert!(err.contains("bad goal row"), "{err}");
    assert!(err.contains("rec-2"), "{err}");
    assert!(server.await.unwrap().starts_with("POST /rest/v1/habits?on_conflict=id "));
  }
}

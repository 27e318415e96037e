//! Network collaborators consumed by the engine, plus the reqwest-backed transport.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;
use url::Url;

use crate::error::NetworkError;
use crate::queue::MutationRecord;

/// A resource request as seen by the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  method: String,
  url: Url,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }
}

/// A response body plus the minimal metadata the cache keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      content_type: content_type.map(String::from),
      body: body.into(),
    }
  }

  /// A 200 response.
  pub fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
    Self::new(200, Some(content_type), body)
  }

  /// Synthetic response served when neither network nor cache can answer.
  pub fn offline_text() -> Self {
    Self::new(503, Some("text/plain"), "Offline")
  }

  /// Synthetic JSON response for API-style requests made while offline.
  pub fn offline_json() -> Self {
    Self::new(503, Some("application/json"), r#"{"error":"Offline"}"#)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Fetches resources for the cache.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Delivers queued mutations to the remote service.
///
/// Delivery is at-least-once; the record id doubles as an idempotency key.
#[async_trait]
pub trait MutationDispatcher: Send + Sync {
  async fn dispatch(&self, record: &MutationRecord) -> Result<(), NetworkError>;
}

/// Run a network future under a deadline, mapping expiry to [`NetworkError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, NetworkError>
where
  F: std::future::Future<Output = Result<T, NetworkError>>,
{
  tokio::time::timeout(limit, fut)
    .await
    .map_err(|_| NetworkError::Timeout(limit))?
}

/// HTTP transport backed by reqwest.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  api_base: Url,
  token: Option<String>,
}

impl HttpTransport {
  pub fn new(
    api_base: Url,
    token: Option<String>,
    timeout: Duration,
  ) -> Result<Self, NetworkError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| NetworkError::Transport(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      api_base,
      token,
    })
  }

  /// Endpoint that accepts mutations of one kind.
  fn sync_endpoint(&self, record: &MutationRecord) -> Result<Url, NetworkError> {
    self
      .api_base
      .join(&format!("api/v1/sync/{}", record.kind.as_str()))
      .map_err(|e| NetworkError::Transport(format!("invalid sync endpoint: {}", e)))
  }
}

#[async_trait]
impl ResourceFetcher for HttpTransport {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let method = reqwest::Method::from_bytes(request.method().as_bytes())
      .map_err(|e| NetworkError::Transport(format!("invalid method: {}", e)))?;

    let response = self
      .client
      .request(method, request.url().clone())
      .send()
      .await?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      content_type,
      body,
    })
  }
}

#[async_trait]
impl MutationDispatcher for HttpTransport {
  async fn dispatch(&self, record: &MutationRecord) -> Result<(), NetworkError> {
    let url = self.sync_endpoint(record)?;
    let body = serde_json::to_vec(&record.payload)
      .map_err(|e| NetworkError::Transport(format!("failed to encode payload: {}", e)))?;

    let mut builder = self
      .client
      .post(url)
      .header(CONTENT_TYPE, "application/json")
      .header("Idempotency-Key", record.id.as_str())
      .body(body);
    if let Some(token) = &self.token {
      builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }

    let response = builder.send().await?;
    if !response.status().is_success() {
      return Err(NetworkError::Status(response.status().as_u16()));
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_method_is_normalized() {
    let request = Request::new("get", Url::parse("https://app.test/").unwrap());
    assert_eq!(request.method(), "GET");
    assert!(request.is_get());
  }

  #[test]
  fn test_offline_responses_are_503() {
    assert_eq!(Response::offline_text().status, 503);
    let json = Response::offline_json();
    assert_eq!(json.content_type.as_deref(), Some("application/json"));
    assert!(!json.is_success());
  }

  #[tokio::test(start_paused = true)]
  async fn test_with_timeout_maps_expiry() {
    let result: Result<(), NetworkError> = with_timeout(Duration::from_secs(2), async {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(())
    })
    .await;

    assert_eq!(result, Err(NetworkError::Timeout(Duration::from_secs(2))));
  }

  #[test]
  fn test_sync_endpoint_per_kind() {
    let transport = HttpTransport::new(
      Url::parse("https://api.reader.test/").unwrap(),
      None,
      Duration::from_secs(1),
    )
    .unwrap();
    let record = MutationRecord {
      id: "sync_1_abc".into(),
      kind: crate::queue::MutationKind::ReadingProgress,
      payload: serde_json::json!({ "bookId": "b1" }),
      enqueued_at: chrono::Utc::now(),
      attempts: 0,
    };

    assert_eq!(
      transport.sync_endpoint(&record).unwrap().as_str(),
      "https://api.reader.test/api/v1/sync/reading_progress"
    );
  }
}

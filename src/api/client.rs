use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{ACCEPT, ETAG};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::ApiConfig;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 300;

/// A decoded JSON response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
  /// Fully resolved request URL
  pub url: String,
  pub data: Value,
  pub etag: Option<String>,
}

/// Anything that can answer a GET for a path relative to the API root.
pub trait JsonSource: Send + Sync {
  fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<ApiResponse>>;
}

/// REST API client for the site's backend.
#[derive(Clone)]
pub struct ApiClient {
  client: reqwest::Client,
  base_url: Url,
}

impl ApiClient {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let base_url = Self::parse_base(&config.base_url)?;

    let client = reqwest::Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  /// Parse the base URL, making sure relative paths join below it rather than
  /// replacing its last segment.
  fn parse_base(raw: &str) -> Result<Url> {
    let normalized = if raw.ends_with('/') {
      raw.to_string()
    } else {
      format!("{}/", raw)
    };
    Url::parse(&normalized).map_err(|e| eyre!("Invalid API base URL {}: {}", raw, e))
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Resolve an endpoint path against the base URL.
  pub fn url_for(&self, path: &str) -> Result<Url> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid endpoint path {}: {}", path, e))
  }

  /// GET `path` and decode the body as JSON.
  pub async fn get_json(&self, path: &str) -> Result<ApiResponse> {
    let url = self.url_for(path)?;
    debug!(url = %url, "GET");

    let response = self
      .client
      .get(url.clone())
      .header(ACCEPT, "application/json")
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

    let status = response.status();
    let etag = response
      .headers()
      .get(ETAG)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

    if !status.is_success() {
      let text = String::from_utf8_lossy(&body);
      return Err(eyre!(
        "{} returned {}: {}",
        url,
        status,
        truncate(&text, MAX_ERROR_BODY_LENGTH)
      ));
    }

    let data: Value = serde_json::from_slice(&body)
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))?;

    Ok(ApiResponse {
      url: url.to_string(),
      data,
      etag,
    })
  }

  /// GET `path` and decode it into `T`.
  pub async fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let response = self.get_json(path).await?;
    serde_json::from_value(response.data)
      .map_err(|e| eyre!("Unexpected response shape from {}: {}", response.url, e))
  }
}

impl JsonSource for ApiClient {
  fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<ApiResponse>> {
    self.get_json(path).boxed()
  }
}

fn truncate(body: &str, max: usize) -> String {
  if body.len() <= max {
    return body.to_string();
  }
  let mut end = max;
  while !body.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn client(base: &str) -> ApiClient {
    ApiClient::new(&ApiConfig {
      base_url: base.to_string(),
      timeout_secs: 5,
    })
    .unwrap()
  }

  #[test]
  fn test_paths_join_below_base() {
    let api = client("https://api.example.com/v1");
    assert_eq!(
      api.url_for("services").unwrap().as_str(),
      "https://api.example.com/v1/services"
    );
    assert_eq!(
      api.url_for("/about/team").unwrap().as_str(),
      "https://api.example.com/v1/about/team"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    let result = ApiClient::new(&ApiConfig {
      base_url: "not a url".to_string(),
      timeout_secs: 5,
    });
    assert!(result.is_err());
  }

  #[test]
  fn test_truncate_long_bodies() {
    let body = "é".repeat(400);
    let short = truncate(&body, 301);
    assert!(short.starts_with("ééé"));
    assert!(short.ends_with("(truncated, 800 total bytes)"));
    assert_eq!(truncate("ok", 10), "ok");
  }
}

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::Config;

use super::RemoteClient;

/// Client for the hosted backend's REST interface
#[derive(Clone)]
pub struct RestClient {
  http: reqwest::Client,
  base: Url,
  api_key: String,
  access_token: Option<String>,
}

impl RestClient {
  pub fn new(config: &Config) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let access_token = Config::get_access_token();
    Self::with_credentials(&config.remote.url, api_key, access_token)
  }

  pub fn with_credentials(
    url: &str,
    api_key: String,
    access_token: Option<String>,
  ) -> Result<Self> {
    // Url::join drops the last path segment unless the base ends in a slash
    let normalized = if url.ends_with('/') {
      url.to_string()
    } else {
      format!("{}/", url)
    };
    let base = Url::parse(&normalized).map_err(|e| eyre!("Invalid remote URL {}: {}", url, e))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      api_key,
      access_token,
    })
  }

  fn table_url(&self, table: &str) -> Result<Url> {
    self
      .base
      .join(&format!("rest/v1/{}", table))
      .map_err(|e| eyre!("Invalid table name {}: {}", table, e))
  }

  fn row_url(&self, table: &str, id: &str) -> Result<Url> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", id));
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
    self
      .http
      .request(method, url)
      .header("apikey", self.api_key.as_str())
      .bearer_auth(bearer)
  }

  /// Send a request and fail with the response body on a non-success status
  async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", what, e))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(eyre!("Failed to {}: {} {}", what, status, body))
  }

  async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response to {}: {}", what, e))
  }

  /// Write endpoints answer with an array of affected rows
  fn first_row(rows: Vec<Value>, what: &str) -> Result<Value> {
    rows
      .into_iter()
      .next()
      .ok_or_else(|| eyre!("Failed to {}: no row returned", what))
  }
}

#[async_trait]
impl RemoteClient for RestClient {
  async fn select_all(&self, table: &str) -> Result<Vec<Value>> {
    let what = format!("fetch {}", table);
    let mut url = self.table_url(table)?;
    url.query_pairs_mut().append_pair("select", "*");

    let response = self.send(self.request(Method::GET, url), &what).await?;
    Self::read_json(response, &what).await
  }

  async fn insert(&self, table: &str, record: &Value) -> Result<Value> {
    let what = format!("insert into {}", table);
    let request = self
      .request(Method::POST, self.table_url(table)?)
      .header("Prefer", "return=representation")
      .json(record);

    let response = self.send(request, &what).await?;
    Self::first_row(Self::read_json(response, &what).await?, &what)
  }

  async fn update(&self, table: &str, id: &str, changes: &Value) -> Result<Value> {
    let what = format!("update {} {}", table, id);
    let request = self
      .request(Method::PATCH, self.row_url(table, id)?)
      .header("Prefer", "return=representation")
      .json(changes);

    let response = self.send(request, &what).await?;
    Self::first_row(Self::read_json(response, &what).await?, &what)
  }

  async fn delete(&self, table: &str, id: &str) -> Result<()> {
    let what = format!("delete {} {}", table, id);
    self
      .send(self.request(Method::DELETE, self.row_url(table, id)?), &what)
      .await?;
    Ok(())
  }

  async fn rpc(&self, function: &str, args: &Value) -> Result<Value> {
    let what = format!("call {}", function);
    let url = self
      .base
      .join(&format!("rest/v1/rpc/{}", function))
      .map_err(|e| eyre!("Invalid function name {}: {}", function, e))?;

    let response = self
      .send(self.request(Method::POST, url).json(args), &what)
      .await?;
    Self::read_json(response, &what).await
  }

  async fn health_check(&self) -> Result<()> {
    let url = self
      .base
      .join("rest/v1/")
      .map_err(|e| eyre!("Invalid remote URL: {}", e))?;
    self
      .send(self.request(Method::HEAD, url), "reach remote")
      .await?;
    Ok(())
  }
}

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{ApiCallRequest, ApiCallResponse, ApiCreatedId};
use super::{Collection, IdPage, Mutation, RemoteError, RemoteRecordSource, RemoteRecordWriter};
use crate::cache::{Record, RecordId};
use crate::config::Config;

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Record API client for Odoo-style JSON call endpoints.
#[derive(Clone)]
pub struct OdooClient {
  http: reqwest::Client,
  endpoint: Url,
  database: String,
  token: String,
  timeout: Duration,
}

impl OdooClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_credentials(
      &config.server.url,
      &config.server.call_path,
      &config.server.database,
      token,
      config.sync.request_timeout(),
    )
  }

  pub fn with_credentials(
    base_url: &str,
    call_path: &str,
    database: &str,
    token: String,
    timeout: Duration,
  ) -> Result<Self> {
    let base = Url::parse(base_url).map_err(|e| eyre!("Invalid server url {}: {}", base_url, e))?;
    let endpoint = base
      .join(call_path)
      .map_err(|e| eyre!("Invalid call path {}: {}", call_path, e))?;

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      endpoint,
      database: database.to_string(),
      token,
      timeout,
    })
  }

  /// Host and port of the API server, for connectivity probing.
  pub fn server_address(&self) -> Option<String> {
    let host = self.endpoint.host_str()?;
    let port = self.endpoint.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
  }

  /// Call a model method and decode its result.
  async fn call<R: DeserializeOwned>(
    &self,
    model: &str,
    method: &str,
    args: Value,
    kwargs: Value,
  ) -> Result<R, RemoteError> {
    debug!(model, method, "remote call");

    let body = ApiCallRequest {
      model,
      method,
      args,
      kwargs,
    };

    let response = self
      .http
      .post(self.endpoint.clone())
      .bearer_auth(&self.token)
      .header("DATABASE", &self.database)
      .json(&body)
      .send()
      .await
      .map_err(|e| self.transport_error(e))?;

    let status = response.status();
    if !status.is_success() {
      let mut body = response.text().await.unwrap_or_default();
      body.truncate(floor_char_boundary(&body, MAX_ERROR_BODY));
      return Err(RemoteError::Status {
        code: status.as_u16(),
        body,
      });
    }

    let envelope: ApiCallResponse = response
      .json()
      .await
      .map_err(|e| RemoteError::Decode(format!("{} {}: {}", model, method, e)))?;

    serde_json::from_value(envelope.into_result()?)
      .map_err(|e| RemoteError::Decode(format!("{} {}: {}", model, method, e)))
  }

  fn transport_error(&self, e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
      RemoteError::Timeout(self.timeout)
    } else {
      RemoteError::Transport(e.to_string())
    }
  }
}

/// Largest index <= `max` that sits on a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
  if s.len() <= max {
    return s.len();
  }
  (0..=max).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

/// The remote side expects a list; a missing filter means "everything".
fn domain_of(collection: &Collection) -> Value {
  if collection.filter.is_null() {
    json!([])
  } else {
    collection.filter.clone()
  }
}

#[async_trait]
impl<T: Record> RemoteRecordSource<T> for OdooClient {
  async fn list_ids(
    &self,
    collection: &Collection,
    limit: usize,
    offset: usize,
  ) -> Result<IdPage, RemoteError> {
    let domain = domain_of(collection);

    let ids: Vec<RecordId> = self
      .call(
        &collection.model,
        "search",
        json!([domain]),
        json!({ "limit": limit, "offset": offset, "order": "id asc" }),
      )
      .await?;

    let page = IdPage::new(ids);

    // Count once per discovery so callers can tell when the cap truncated
    if offset == 0 {
      let total: usize = self
        .call(&collection.model, "search_count", json!([domain]), json!({}))
        .await?;
      return Ok(page.with_total(total));
    }

    Ok(page)
  }

  async fn fetch_by_ids(
    &self,
    collection: &Collection,
    ids: &[RecordId],
    fields: &[String],
  ) -> Result<Vec<T>, RemoteError> {
    self
      .call(
        &collection.model,
        "read",
        json!([ids, fields]),
        json!({}),
      )
      .await
  }
}

#[async_trait]
impl RemoteRecordWriter for OdooClient {
  async fn apply(&self, collection: &Collection, mutation: &Mutation) -> Result<RecordId, RemoteError> {
    let model = &collection.model;
    match mutation {
      Mutation::Create { values } => {
        let created: ApiCreatedId = self.call(model, "create", json!([values]), json!({})).await?;
        created
          .first()
          .ok_or_else(|| RemoteError::Decode("create returned no id".to_string()))
      }
      Mutation::Update { id, values } => {
        let _: Value = self
          .call(model, "write", json!([[id], values]), json!({}))
          .await?;
        Ok(*id)
      }
      Mutation::Delete { id } => {
        let _: Value = self.call(model, "unlink", json!([[id]]), json!({})).await?;
        Ok(*id)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::RemoteRecord;
  use wiremock::matchers::{body_partial_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn client(server: &MockServer) -> OdooClient {
    OdooClient::with_credentials(
      &server.uri(),
      "/api/v2/call",
      "demo",
      "secret".to_string(),
      Duration::from_secs(5),
    )
    .unwrap()
  }

  fn partners() -> Collection {
    Collection::new("partners", "res.partner")
      .with_filter(json!([["is_company", "=", true]]))
      .with_fields(["name", "email"])
  }

  #[tokio::test]
  async fn test_list_ids_first_page_counts_total() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v2/call"))
      .and(header("authorization", "Bearer secret"))
      .and(header("database", "demo"))
      .and(body_partial_json(json!({
        "model": "res.partner",
        "method": "search",
        "args": [[["is_company", "=", true]]],
        "kwargs": {"limit": 2, "offset": 0}
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [7, 9]})))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({"method": "search_count"})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 5})))
      .expect(1)
      .mount(&server)
      .await;

    let page = RemoteRecordSource::<RemoteRecord>::list_ids(&client(&server), &partners(), 2, 0)
      .await
      .unwrap();
    assert_eq!(page.ids, vec![7, 9]);
    assert_eq!(page.returned_count, 2);
    assert_eq!(page.total, Some(5));
  }

  #[tokio::test]
  async fn test_list_ids_later_page_skips_count() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({"method": "search", "kwargs": {"offset": 2}})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success", "data": [11]})))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({"method": "search_count"})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": 3})))
      .expect(0)
      .mount(&server)
      .await;

    let page = RemoteRecordSource::<RemoteRecord>::list_ids(&client(&server), &partners(), 2, 2)
      .await
      .unwrap();
    assert_eq!(page.ids, vec![11]);
    assert_eq!(page.total, None);
  }

  #[tokio::test]
  async fn test_fetch_by_ids_decodes_records() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({
        "method": "read",
        "args": [[7, 9], ["name", "email"]]
      })))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [
        {"id": 7, "name": "Azure Interior", "email": "azure@example.com"},
        {"id": 9, "name": "Deco Addict", "email": false}
      ]})))
      .mount(&server)
      .await;

    let collection = partners();
    let records: Vec<RemoteRecord> = client(&server)
      .fetch_by_ids(&collection, &[7, 9], &collection.fields)
      .await
      .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].id, 9);
    assert_eq!(records[0].field("name"), Some(&json!("Azure Interior")));
  }

  #[tokio::test]
  async fn test_server_error_is_retryable_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
      .mount(&server)
      .await;

    let err = RemoteRecordSource::<RemoteRecord>::list_ids(&client(&server), &partners(), 10, 0)
      .await
      .unwrap_err();
    assert_eq!(
      err,
      RemoteError::Status {
        code: 502,
        body: "bad gateway".to_string()
      }
    );
    assert!(err.is_retryable());
  }

  #[tokio::test]
  async fn test_rpc_error_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({
        "error": {"message": "Odoo Server Error", "data": {"message": "Access Denied"}}
      })))
      .mount(&server)
      .await;

    let err = RemoteRecordSource::<RemoteRecord>::list_ids(&client(&server), &partners(), 10, 0)
      .await
      .unwrap_err();
    assert!(matches!(err, RemoteError::Rejected(ref m) if m == "Access Denied"));
    assert!(!err.is_retryable());
  }

  #[tokio::test]
  async fn test_apply_create_and_delete() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({"method": "create", "args": [{"name": "New"}]})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [42]})))
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .and(body_partial_json(json!({"method": "unlink", "args": [[42]]})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
      .expect(1)
      .mount(&server)
      .await;

    let client = client(&server);
    let mut values = serde_json::Map::new();
    values.insert("name".to_string(), json!("New"));

    let id = client
      .apply(&partners(), &Mutation::Create { values })
      .await
      .unwrap();
    assert_eq!(id, 42);

    let id = client
      .apply(&partners(), &Mutation::Delete { id: 42 })
      .await
      .unwrap();
    assert_eq!(id, 42);
  }

  #[test]
  fn test_server_address() {
    let client = OdooClient::with_credentials(
      "https://erp.example.com",
      "/api/v2/call",
      "prod",
      String::new(),
      Duration::from_secs(1),
    )
    .unwrap();
    assert_eq!(client.server_address().as_deref(), Some("erp.example.com:443"));
  }
}

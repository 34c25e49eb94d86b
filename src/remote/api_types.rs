//! Serde types matching the JSON call endpoint of the record API.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::RemoteError;

/// Body of a model method call.
#[derive(Debug, Serialize)]
pub struct ApiCallRequest<'a> {
  pub model: &'a str,
  pub method: &'a str,
  pub args: Value,
  pub kwargs: Value,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorData {
  pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
  #[serde(default)]
  pub message: String,
  pub data: Option<ApiErrorData>,
}

/// Response of a model method call.
///
/// Servers answer either JSON-RPC style (`{"result": ...}` or
/// `{"error": ...}`) or REST style (`{"status": "success", "data": ...}`).
#[derive(Debug, Deserialize)]
pub struct ApiCallResponse {
  #[serde(default)]
  pub result: Option<Value>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub error: Option<ApiError>,
}

impl ApiCallResponse {
  pub fn into_result(self) -> Result<Value, RemoteError> {
    if let Some(error) = self.error {
      let detail = error
        .data
        .and_then(|d| d.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(error.message);
      return Err(RemoteError::Rejected(detail));
    }

    if let Some(result) = self.result {
      return Ok(result);
    }

    match self.status.as_deref() {
      Some("success") => Ok(self.data.unwrap_or(Value::Null)),
      Some(other) => Err(RemoteError::Rejected(format!(
        "call failed with status {}: {}",
        other,
        self.data.unwrap_or(Value::Null)
      ))),
      // `"result": null` deserializes as None
      None => Ok(Value::Null),
    }
  }
}

/// The create method answers either a single id or a list with one id.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiCreatedId {
  One(i64),
  Many(Vec<i64>),
}

impl ApiCreatedId {
  pub fn first(self) -> Option<i64> {
    match self {
      ApiCreatedId::One(id) => Some(id),
      ApiCreatedId::Many(ids) => ids.into_iter().next(),
    }
  }
}

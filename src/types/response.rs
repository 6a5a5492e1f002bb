//! Response Types
//!
//! Values returned by the executor. A completed asynchronous operation is a
//! distinct variant but exposes the same accessors as a direct response.

use serde::de::DeserializeOwned;
use std::fmt;

use crate::core::HttpResponse;

/// Final result of an accepted asynchronous operation.
#[derive(Clone, PartialEq)]
pub struct AsyncOperationResult {
    data: serde_json::Value,
    status_code: u16,
    content: Vec<u8>,
    original: HttpResponse,
}

impl AsyncOperationResult {
    /// Wrap the final payload. `original` is the triggering 202 response.
    pub fn new(data: serde_json::Value, status_code: u16, original: HttpResponse) -> Self {
        let content = data.to_string().into_bytes();
        Self {
            data,
            status_code,
            content,
            original,
        }
    }

    /// Final payload.
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Deserialize the final payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Whether the status code is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Payload serialized as JSON bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Payload serialized as JSON text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// Status code of the final result.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// The response that accepted the operation.
    pub fn original_response(&self) -> &HttpResponse {
        &self.original
    }
}

impl fmt::Debug for AsyncOperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = match &self.data {
            serde_json::Value::Object(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        };
        f.debug_struct("AsyncOperationResult")
            .field("status_code", &self.status_code)
            .field("data_keys", &keys)
            .finish()
    }
}

/// Result of [`crate::RequestExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamResponse {
    /// The upstream answered synchronously.
    Direct(HttpResponse),
    /// The upstream accepted the request and the operation has completed.
    Completed(AsyncOperationResult),
}

impl UpstreamResponse {
    /// Whether the result came from a polled asynchronous operation.
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Status code.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Direct(response) => response.status,
            Self::Completed(result) => result.status_code(),
        }
    }

    /// Whether the status code is 2xx.
    pub fn ok(&self) -> bool {
        match self {
            Self::Direct(response) => response.is_success(),
            Self::Completed(result) => result.ok(),
        }
    }

    /// Raw body bytes.
    pub fn content(&self) -> &[u8] {
        match self {
            Self::Direct(response) => &response.body,
            Self::Completed(result) => result.content(),
        }
    }

    /// Body as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.content()).into_owned()
    }

    /// Deserialize the body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Direct(response) => response.json(),
            Self::Completed(result) => result.json(),
        }
    }

    /// Header of the direct response, or of the response that accepted the
    /// operation.
    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            Self::Direct(response) => response.header(name),
            Self::Completed(result) => result.original_response().header(name),
        }
    }

    /// The completed operation, if any.
    pub fn as_async(&self) -> Option<&AsyncOperationResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Direct(_) => None,
        }
    }
}

//! Transport layer for JSON-RPC communication

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{RpcError, RpcResult};

/// One call inside a batch
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    /// Method name
    pub method: String,
    /// Positional params
    pub params: Vec<Value>,
}

impl RpcCall {
    /// Create a call
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Transport trait for RPC communication (object-safe)
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an RPC request and get JSON response
    async fn request_json(&self, method: &str, params: Vec<Value>) -> RpcResult<Value>;

    /// Send several calls. The outer error is a failure of the whole batch;
    /// inner results line up with `calls`.
    async fn request_batch(&self, calls: Vec<RpcCall>) -> RpcResult<Vec<RpcResult<Value>>> {
        let mut out = Vec::with_capacity(calls.len());
        for call in calls {
            out.push(self.request_json(&call.method, call.params).await);
        }
        Ok(out)
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn request_json(&self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        (**self).request_json(method, params).await
    }

    async fn request_batch(&self, calls: Vec<RpcCall>) -> RpcResult<Vec<RpcResult<Value>>> {
        (**self).request_batch(calls).await
    }
}

type Handler = dyn Fn(&str, &[Value]) -> RpcResult<Value> + Send + Sync;

/// Scriptable transport for tests
pub struct MockTransport {
    handler: Arc<Handler>,
    calls: parking_lot::Mutex<HashMap<String, usize>>,
}

impl MockTransport {
    /// Answer every request with `handler`
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> RpcResult<Value> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            calls: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// How many times `method` was requested
    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request_json(&self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        *self.calls.lock().entry(method.to_string()).or_insert(0) += 1;
        (self.handler)(method, &params)
    }
}

/// HTTP transport for real RPC communication
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    request_id: std::sync::atomic::AtomicU64,
}

#[cfg(feature = "http")]
impl HttpTransport {
    /// Create a new HTTP transport with a per-request timeout
    pub fn new(url: &str, timeout: std::time::Duration) -> RpcResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(256)
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            request_id: std::sync::atomic::AtomicU64::new(1),
        })
    }

    /// Endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    fn next_id(&self) -> u64 {
        self.request_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    async fn post<R: serde::de::DeserializeOwned>(&self, body: &Value) -> RpcResult<R> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RpcError::Http {
                status: status.as_u16(),
                message,
            });
        }

        response.json().await.map_err(classify)
    }
}

#[cfg(feature = "http")]
fn classify(e: reqwest::Error) -> RpcError {
    if e.is_timeout() {
        RpcError::Timeout(e.to_string())
    } else if e.is_decode() {
        RpcError::InvalidResponse(e.to_string())
    } else {
        RpcError::Transport(e.to_string())
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn request_json(&self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": method,
            "params": params,
        });

        let response: JsonRpcResponse = self.post(&request).await?;
        response.into_result()
    }

    async fn request_batch(&self, calls: Vec<RpcCall>) -> RpcResult<Vec<RpcResult<Value>>> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        let first_id = self
            .request_id
            .fetch_add(calls.len() as u64, std::sync::atomic::Ordering::SeqCst);
        let requests: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": first_id + i as u64,
                    "method": call.method,
                    "params": call.params,
                })
            })
            .collect();

        let mut responses: Vec<JsonRpcResponse> = self.post(&Value::Array(requests)).await?;
        if responses.len() != calls.len() {
            return Err(RpcError::Transport(format!(
                "batch response count mismatch: sent {}, got {}",
                calls.len(),
                responses.len()
            )));
        }
        responses.sort_by_key(|r| r.id);
        for (i, response) in responses.iter().enumerate() {
            if response.id != first_id + i as u64 {
                return Err(RpcError::Transport(format!(
                    "batch response id mismatch at {}: got {}",
                    i, response.id
                )));
            }
        }
        Ok(responses.into_iter().map(JsonRpcResponse::into_result).collect())
    }
}

#[cfg(feature = "http")]
#[derive(serde::Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[cfg(feature = "http")]
impl JsonRpcResponse {
    fn into_result(self) -> RpcResult<Value> {
        if let Some(error) = self.error {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        // a JSON `null` result deserializes to None
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[cfg(feature = "http")]
#[derive(serde::Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

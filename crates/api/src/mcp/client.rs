//! HTTP client for talking to upstream MCP servers: auth-scheme injection,
//! dual timeouts, bounded response size, and a short-lived per-descriptor
//! circuit breaker that shields the request path from hammering an
//! upstream that just started failing (independent of the health
//! checker's longer-horizon `unhealthy` state).
//!
//! Grounded on the teacher's `McpClient` (`get_tools_with_breaker`,
//! `call_tool`, `read_resource`, `get_prompt` call sites referenced from
//! `mcp::handlers::McpProxyHandler`), reshaped around the explicit
//! `McpTransport`/`McpAuth` enums instead of the teacher's JSONB config
//! blob.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use super::types::{
    AggregatedPromptsListResult, AggregatedResourcesListResult, AggregatedToolsListResult,
    InitializeResult, JsonRpcId, JsonRpcRequest, JsonRpcResponse, McpAuth, McpTransport, Prompt,
    Resource, Tool,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to upstream")]
    ConnectFailed,
    #[error("upstream did not respond within the configured timeout")]
    Timeout,
    #[error("upstream response exceeded the configured size limit")]
    ResponseTooLarge,
    #[error("upstream returned a malformed JSON-RPC response: {0}")]
    ProtocolError(String),
    #[error("circuit open for this descriptor, short-circuiting the call")]
    CircuitOpen,
    #[error("stdio transport is not supported by the proxy client")]
    StdioUnsupported,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// Connect-level failures are the only ones the proxy engine retries.
    pub fn is_retryable_connect_failure(&self) -> bool {
        matches!(self, ClientError::ConnectFailed)
    }
}

struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_OPEN_DURATION: Duration = Duration::from_secs(30);

/// Shared across all requests in the process; one HTTP client, one breaker
/// table keyed by descriptor id.
pub struct McpClient {
    http: reqwest::Client,
    max_response_bytes: usize,
    breakers: Mutex<HashMap<Uuid, BreakerState>>,
}

impl McpClient {
    pub fn new(max_response_bytes: usize) -> Self {
        Self {
            http: reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            max_response_bytes,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn breaker_allows(&self, descriptor_id: Uuid) -> bool {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        match breakers.get(&descriptor_id) {
            Some(state) => match state.open_until {
                Some(until) => Instant::now() >= until,
                None => true,
            },
            None => true,
        }
    }

    fn record_success(&self, descriptor_id: Uuid) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.remove(&descriptor_id);
    }

    fn record_failure(&self, descriptor_id: Uuid) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let state = breakers.entry(descriptor_id).or_insert(BreakerState {
            consecutive_failures: 0,
            open_until: None,
        });
        state.consecutive_failures += 1;
        if state.consecutive_failures >= BREAKER_FAILURE_THRESHOLD {
            state.open_until = Some(Instant::now() + BREAKER_OPEN_DURATION);
        }
    }

    fn auth_headers(auth: &McpAuth) -> Vec<(String, String)> {
        match auth {
            McpAuth::None => vec![],
            McpAuth::Bearer { token } => vec![("Authorization".to_string(), format!("Bearer {token}"))],
            McpAuth::ApiKey { header, value } => vec![(header.clone(), value.clone())],
            McpAuth::Basic { username, password } => {
                use base64::{engine::general_purpose::STANDARD, Engine};
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                vec![("Authorization".to_string(), format!("Basic {encoded}"))]
            }
        }
    }

    async fn send(
        &self,
        transport: &McpTransport,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, ClientError> {
        let (endpoint_url, auth) = match transport {
            McpTransport::Http { endpoint_url, auth } | McpTransport::Sse { endpoint_url, auth } => {
                (endpoint_url, auth)
            }
            McpTransport::Stdio { .. } => return Err(ClientError::StdioUnsupported),
        };

        let mut builder = self
            .http
            .post(endpoint_url)
            .timeout(timeout)
            .header("content-type", "application/json")
            .json(request);

        for (name, value) in Self::auth_headers(auth) {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout
            } else if e.is_connect() {
                ClientError::ConnectFailed
            } else {
                ClientError::Http(e)
            }
        })?;

        if let Some(len) = response.content_length() {
            if len as usize > self.max_response_bytes {
                return Err(ClientError::ResponseTooLarge);
            }
        }

        let bytes = response.bytes().await.map_err(ClientError::Http)?;
        if bytes.len() > self.max_response_bytes {
            return Err(ClientError::ResponseTooLarge);
        }

        serde_json::from_slice(&bytes).map_err(|e| ClientError::ProtocolError(e.to_string()))
    }

    async fn send_with_breaker(
        &self,
        descriptor_id: Uuid,
        transport: &McpTransport,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, ClientError> {
        if !self.breaker_allows(descriptor_id) {
            return Err(ClientError::CircuitOpen);
        }
        match self.send(transport, request, timeout).await {
            Ok(resp) => {
                self.record_success(descriptor_id);
                Ok(resp)
            }
            Err(e) => {
                self.record_failure(descriptor_id);
                Err(e)
            }
        }
    }

    /// Single-target calls retry on transient connect failure only, and
    /// only when the caller has asserted the call is idempotent — a read,
    /// or a tool call the caller knows is safe to repeat.
    async fn send_idempotent(
        &self,
        descriptor_id: Uuid,
        transport: &McpTransport,
        request: JsonRpcRequest,
        timeout: Duration,
        idempotent: bool,
    ) -> Result<JsonRpcResponse, ClientError> {
        if !idempotent {
            return self
                .send_with_breaker(descriptor_id, transport, &request, timeout)
                .await;
        }

        let strategy = ExponentialBackoff::from_millis(50).map(jitter).take(3);

        RetryIf::spawn(
            strategy,
            || self.send_with_breaker(descriptor_id, transport, &request, timeout),
            |e: &ClientError| e.is_retryable_connect_failure(),
        )
        .await
    }

    /// Issues the MCP `initialize` handshake used by the health checker
    /// (component C5) to record protocol version, server name, and server
    /// version. Bypasses the breaker: a probe is the thing that decides
    /// whether the breaker should be open, not something gated by it.
    pub async fn initialize(
        &self,
        transport: &McpTransport,
        timeout: Duration,
    ) -> Result<InitializeResult, ClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::Number(1)),
            method: "initialize".to_string(),
            params: Some(serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "PlexMCP", "version": env!("CARGO_PKG_VERSION") },
            })),
        };
        let response = self.send(transport, &request, timeout).await?;
        extract_result::<InitializeResult>(response)
    }

    pub async fn get_tools_with_breaker(
        &self,
        descriptor_id: Uuid,
        transport: &McpTransport,
        timeout: Duration,
    ) -> Result<Vec<Tool>, ClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::Number(1)),
            method: "tools/list".to_string(),
            params: None,
        };
        let response = self
            .send_with_breaker(descriptor_id, transport, &request, timeout)
            .await?;
        extract_result::<AggregatedToolsListResult>(response).map(|r| r.tools)
    }

    pub async fn get_resources_with_breaker(
        &self,
        descriptor_id: Uuid,
        transport: &McpTransport,
        timeout: Duration,
    ) -> Result<Vec<Resource>, ClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::Number(1)),
            method: "resources/list".to_string(),
            params: None,
        };
        let response = self
            .send_with_breaker(descriptor_id, transport, &request, timeout)
            .await?;
        extract_result::<AggregatedResourcesListResult>(response).map(|r| r.resources)
    }

    pub async fn get_prompts_with_breaker(
        &self,
        descriptor_id: Uuid,
        transport: &McpTransport,
        timeout: Duration,
    ) -> Result<Vec<Prompt>, ClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::Number(1)),
            method: "prompts/list".to_string(),
            params: None,
        };
        let response = self
            .send_with_breaker(descriptor_id, transport, &request, timeout)
            .await?;
        extract_result::<AggregatedPromptsListResult>(response).map(|r| r.prompts)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn call_tool(
        &self,
        descriptor_id: Uuid,
        transport: &McpTransport,
        tool_name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Duration,
        idempotent: bool,
    ) -> Result<serde_json::Value, ClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::Number(1)),
            method: "tools/call".to_string(),
            params: Some(serde_json::json!({ "name": tool_name, "arguments": arguments })),
        };
        let response = self
            .send_idempotent(descriptor_id, transport, request, timeout, idempotent)
            .await?;
        raw_result(response)
    }

    pub async fn read_resource(
        &self,
        descriptor_id: Uuid,
        transport: &McpTransport,
        uri: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, ClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::Number(1)),
            method: "resources/read".to_string(),
            params: Some(serde_json::json!({ "uri": uri })),
        };
        let response = self
            .send_idempotent(descriptor_id, transport, request, timeout, true)
            .await?;
        raw_result(response)
    }

    pub async fn get_prompt(
        &self,
        descriptor_id: Uuid,
        transport: &McpTransport,
        name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, ClientError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::Number(1)),
            method: "prompts/get".to_string(),
            params: Some(serde_json::json!({ "name": name, "arguments": arguments })),
        };
        let response = self
            .send_idempotent(descriptor_id, transport, request, timeout, true)
            .await?;
        raw_result(response)
    }
}

fn extract_result<T: serde::de::DeserializeOwned>(response: JsonRpcResponse) -> Result<T, ClientError> {
    if let Some(error) = response.error {
        return Err(ClientError::ProtocolError(error.message));
    }
    let result = response
        .result
        .ok_or_else(|| ClientError::ProtocolError("missing result".to_string()))?;
    serde_json::from_value(result).map_err(|e| ClientError::ProtocolError(e.to_string()))
}

fn raw_result(response: JsonRpcResponse) -> Result<serde_json::Value, ClientError> {
    if let Some(error) = response.error {
        return Err(ClientError::ProtocolError(error.message));
    }
    response
        .result
        .ok_or_else(|| ClientError::ProtocolError("missing result".to_string()))
}

/// Picks a jittered multiplier in `[0.5, 1.5)` — used only in tests here;
/// production jitter is supplied by `tokio_retry::strategy::jitter`.
#[cfg(test)]
fn test_jitter_factor() -> f64 {
    use rand::Rng;
    rand::thread_rng().gen_range(0.5..1.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failed_is_retryable() {
        assert!(ClientError::ConnectFailed.is_retryable_connect_failure());
        assert!(!ClientError::Timeout.is_retryable_connect_failure());
        assert!(!ClientError::ResponseTooLarge.is_retryable_connect_failure());
    }

    #[test]
    fn auth_headers_basic_encodes_user_pass() {
        let headers = McpClient::auth_headers(&McpAuth::Basic {
            username: "alice".to_string(),
            password: "secret".to_string(),
        });
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Authorization");
        assert!(headers[0].1.starts_with("Basic "));
    }

    #[test]
    fn auth_headers_none_is_empty() {
        assert!(McpClient::auth_headers(&McpAuth::None).is_empty());
    }

    #[test]
    fn jitter_factor_stays_in_bounds() {
        for _ in 0..20 {
            let f = test_jitter_factor();
            assert!((0.5..1.5).contains(&f));
        }
    }
}

//! [`InferenceClient`] – OpenAI-compatible chat client with fallback.
//!
//! Talks to any server exposing a `/v1/chat/completions` endpoint.  Two
//! degradation paths are built in, tried in this order before a failure is
//! surfaced:
//!
//! 1. **Structured-output downgrade** – when a request with
//!    `response_format: json_schema` is rejected with a client error (4xx),
//!    the same prompt is retried once without the schema constraint.
//! 2. **Endpoint fallback** – when the primary endpoint fails for any
//!    non-cancellation reason and a fallback endpoint is configured, the
//!    prompt is retried once against the fallback with the fixed fallback
//!    model.

use std::time::Duration;

use pilot_kernel::CancelFlag;
use pilot_types::TaskPlan;
use schemars::schema_for;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// One chat-completions endpoint and its credential.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Base URL, e.g. `"http://localhost:11434"`.
    pub base_url: String,
    /// Bearer token, if the endpoint requires one.
    pub api_key: Option<String>,
}

/// Per-tier model parameters.
#[derive(Debug, Clone)]
pub struct TierConfig {
    /// Model name sent in the request body.
    pub model: String,
    /// HTTP timeout for a single round-trip.
    pub timeout: Duration,
    /// Completion token cap.
    pub max_tokens: u32,
}

/// Full client configuration: primary endpoint plus optional fallback.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub primary: EndpointConfig,
    /// Optional fallback endpoint/credential pair.
    pub fallback: Option<EndpointConfig>,
    /// Fixed model used for every fallback attempt, regardless of tier.
    pub fallback_model: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from a chat completion attempt.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The HTTP request failed (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("HTTP status {code}: {body}")]
    Status { code: u16, body: String },
    /// The response body had an unexpected shape.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl ClientError {
    /// `true` for 4xx rejections, which indicate the *request* was at fault
    /// (e.g. the server does not support structured output).
    pub fn is_client_error(&self) -> bool {
        match self {
            ClientError::Status { code, .. } => (400..500).contains(code),
            ClientError::Http(e) => e
                .status()
                .map(|s| s.is_client_error())
                .unwrap_or(false),
            ClientError::BadResponse(_) => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: Role,
    content: String,
}

/// `response_format` field that enforces structured JSON Schema output.
#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

// ─────────────────────────────────────────────────────────────────────────────
// InferenceClient
// ─────────────────────────────────────────────────────────────────────────────

/// Chat-completions client owned by the bridge worker task.  Construct once
/// and reuse for the life of the process.
pub struct InferenceClient {
    config: ClientConfig,
    client: reqwest::Client,
}

impl InferenceClient {
    /// Create a client from `config`.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Complete `prompt` with the given tier parameters, applying the
    /// structured-output downgrade and endpoint fallback in order.  The
    /// optional `cancel` flag is checked between the primary and fallback
    /// round-trips: a cancelled request never reaches the fallback.
    ///
    /// # Errors
    ///
    /// Returns the *last* attempt's [`ClientError`] once every degradation
    /// path has been exhausted.
    pub async fn complete(
        &self,
        tier: &TierConfig,
        prompt: &str,
        structured: bool,
        cancel: Option<&CancelFlag>,
    ) -> Result<String, ClientError> {
        let primary = self.config.primary.clone();
        match self
            .attempt(&primary, &tier.model, prompt, structured, tier)
            .await
        {
            Ok(text) => Ok(text),
            Err(primary_err) => {
                if cancel.is_some_and(|c| c.is_raised()) {
                    return Err(primary_err);
                }
                let Some(fallback) = self.config.fallback.clone() else {
                    return Err(primary_err);
                };
                warn!(
                    error = %primary_err,
                    "primary inference endpoint failed; retrying against fallback"
                );
                let fallback_model = self.config.fallback_model.clone();
                self.attempt(&fallback, &fallback_model, prompt, structured, tier)
                    .await
            }
        }
    }

    /// One endpoint attempt, with the structured-output downgrade applied
    /// when a schema-constrained request is rejected as a client error.
    async fn attempt(
        &self,
        endpoint: &EndpointConfig,
        model: &str,
        prompt: &str,
        structured: bool,
        tier: &TierConfig,
    ) -> Result<String, ClientError> {
        match self
            .send_once(endpoint, model, prompt, structured, tier)
            .await
        {
            Err(e) if structured && e.is_client_error() => {
                warn!(
                    model,
                    error = %e,
                    "structured output rejected; retrying without schema"
                );
                self.send_once(endpoint, model, prompt, false, tier).await
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        endpoint: &EndpointConfig,
        model: &str,
        prompt: &str,
        structured: bool,
        tier: &TierConfig,
    ) -> Result<String, ClientError> {
        let messages = [ChatMessage {
            role: Role::User,
            content: prompt.to_string(),
        }];
        let response_format = structured.then(|| ResponseFormat {
            kind: "json_schema",
            json_schema: serde_json::to_value(schema_for!(TaskPlan))
                .unwrap_or(serde_json::Value::Null),
        });
        let body = ChatRequest {
            model,
            messages: &messages,
            stream: false,
            max_tokens: tier.max_tokens,
            response_format,
        };

        let url = format!("{}/v1/chat/completions", endpoint.base_url);
        let mut request = self.client.post(&url).timeout(tier.timeout).json(&body);
        if let Some(key) = &endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ClientError::BadResponse("empty choices array".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Minimal chat-completions stand-in bound to an ephemeral local port.
    /// Records every request body; when `reject_structured` is set, bodies
    /// carrying a `response_format` field are refused with a 400.
    struct StubServer {
        base_url: String,
        hits: Arc<AtomicUsize>,
        last_body: Arc<Mutex<String>>,
    }

    async fn spawn_stub(reject_structured: bool) -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let last_body = Arc::new(Mutex::new(String::new()));
        let (hit_count, body_slot) = (Arc::clone(&hits), Arc::clone(&last_body));
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                // Read until headers plus the Content-Length body are in.
                loop {
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&raw);
                    if let Some(header_end) = text.find("\r\n\r\n") {
                        let content_length = text
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                            })
                            .unwrap_or(0);
                        if raw.len() >= header_end + 4 + content_length {
                            break;
                        }
                    }
                }
                let text = String::from_utf8_lossy(&raw).to_string();
                let body = text
                    .split_once("\r\n\r\n")
                    .map(|(_, b)| b.to_string())
                    .unwrap_or_default();
                hit_count.fetch_add(1, Ordering::SeqCst);
                body_slot.lock().unwrap().clone_from(&body);

                let (status, payload) = if reject_structured && body.contains("response_format") {
                    (
                        "400 Bad Request",
                        r#"{"error":"response_format not supported"}"#,
                    )
                } else {
                    (
                        "200 OK",
                        r#"{"choices":[{"message":{"role":"assistant","content":"stub reply"}}]}"#,
                    )
                };
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        StubServer {
            base_url,
            hits,
            last_body,
        }
    }

    fn tier() -> TierConfig {
        TierConfig {
            model: "fast-model".to_string(),
            timeout: Duration::from_millis(200),
            max_tokens: 256,
        }
    }

    fn config_without_fallback() -> ClientConfig {
        ClientConfig {
            // Unroutable port – every request fails fast.
            primary: EndpointConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: None,
            },
            fallback: None,
            fallback_model: "fallback-model".to_string(),
        }
    }

    #[test]
    fn status_4xx_is_client_error() {
        let err = ClientError::Status {
            code: 400,
            body: "response_format not supported".to_string(),
        };
        assert!(err.is_client_error());
    }

    #[test]
    fn status_5xx_is_not_client_error() {
        let err = ClientError::Status {
            code: 503,
            body: "overloaded".to_string(),
        };
        assert!(!err.is_client_error());
    }

    #[test]
    fn bad_response_is_not_client_error() {
        assert!(!ClientError::BadResponse("empty".into()).is_client_error());
    }

    #[test]
    fn chat_request_omits_response_format_when_unstructured() {
        let messages = [ChatMessage {
            role: Role::User,
            content: "hello".into(),
        }];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            stream: false,
            max_tokens: 64,
            response_format: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("response_format"));
    }

    #[test]
    fn chat_request_embeds_plan_schema_when_structured() {
        let messages = [ChatMessage {
            role: Role::User,
            content: "plan".into(),
        }];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            stream: false,
            max_tokens: 64,
            response_format: Some(ResponseFormat {
                kind: "json_schema",
                json_schema: serde_json::to_value(schema_for!(TaskPlan)).unwrap(),
            }),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("json_schema"));
        assert!(json.contains("steps"));
    }

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_http_error() {
        let client = InferenceClient::new(config_without_fallback());
        let result = client.complete(&tier(), "hello", false, None).await;
        assert!(matches!(result, Err(ClientError::Http(_))));
    }

    #[tokio::test]
    async fn structured_rejection_downgrades_and_succeeds() {
        let stub = spawn_stub(true).await;
        let config = ClientConfig {
            primary: EndpointConfig {
                base_url: stub.base_url.clone(),
                api_key: None,
            },
            fallback: None,
            fallback_model: "fallback-model".to_string(),
        };
        let client = InferenceClient::new(config);
        let text = client
            .complete(&tier(), "plan something", true, None)
            .await
            .unwrap();
        assert_eq!(text, "stub reply");
        // First request carries the schema and is rejected; the retry drops it.
        assert_eq!(stub.hits.load(Ordering::SeqCst), 2);
        assert!(!stub.last_body.lock().unwrap().contains("response_format"));
    }

    #[tokio::test]
    async fn fallback_endpoint_serves_reply_after_primary_failure() {
        let stub = spawn_stub(false).await;
        let config = ClientConfig {
            primary: EndpointConfig {
                // Unroutable port – the primary attempt fails fast.
                base_url: "http://127.0.0.1:9".to_string(),
                api_key: None,
            },
            fallback: Some(EndpointConfig {
                base_url: stub.base_url.clone(),
                api_key: Some("key".to_string()),
            }),
            fallback_model: "fallback-model".to_string(),
        };
        let client = InferenceClient::new(config);
        let text = client.complete(&tier(), "hello", false, None).await.unwrap();
        assert_eq!(text, "stub reply");
        // The retry must have swapped in the fixed fallback model.
        assert!(stub.last_body.lock().unwrap().contains("fallback-model"));
    }
}

//! OpenAI-compatible Chat Completions provider (Groq, OpenAI, OpenRouter, ...).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::AiConfig;
use crate::error::LlmError;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

const PROVIDER: &str = "openai_compat";

/// Provider speaking the `/chat/completions` wire format with Bearer auth.
pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatProvider {
    pub fn new(config: AiConfig) -> Result<Self, LlmError> {
        let api_key = config.api_key.ok_or_else(|| LlmError::AuthFailed {
            provider: PROVIDER.to_string(),
        })?;

        // The analyzer enforces the real deadline; this only stops a socket
        // from hanging forever if the analyzer is bypassed.
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.saturating_mul(2).max(1)))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url,
            api_key,
            model: config.model,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn api_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');

        if base.ends_with("/v1") {
            format!("{}/{}", base, path)
        } else {
            format!("{}/v1/{}", base, path)
        }
    }

    async fn send_request(
        &self,
        body: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let url = self.api_url("chat/completions");
        tracing::debug!(url = %url, model = %body.model, "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: format!("Failed to read response body: {}", e),
        })?;

        tracing::debug!("Chat completion response status: {}", status);

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                },
                429 => LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                },
                _ => LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("HTTP {}: {}", status, preview(&response_text, 512)),
                },
            });
        }

        serde_json::from_str(&response_text).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!(
                "JSON parse error: {}. Raw: {}",
                e,
                preview(&response_text, 512)
            ),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = req.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: req.prompt,
        });

        let request = ChatCompletionRequest {
            model: req.model.unwrap_or_else(|| self.model.clone()),
            messages,
            temperature: Some(req.temperature.unwrap_or(self.temperature)),
            max_tokens: Some(req.max_tokens.unwrap_or(self.max_tokens)),
        };

        let response = self.send_request(&request).await?;

        let choice =
            response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| LlmError::InvalidResponse {
                    provider: PROVIDER.to_string(),
                    reason: "No choices in response".to_string(),
                })?;

        let (input_tokens, output_tokens) = parse_usage(response.usage.as_ref());
        let billed_cost = response
            .usage
            .as_ref()
            .and_then(|u| u.cost)
            .and_then(|c| Decimal::try_from(c).ok())
            .filter(|c| !c.is_sign_negative());

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            input_tokens,
            output_tokens,
            billed_cost,
        })
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

// OpenAI-compatible Chat Completions API types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatCompletionUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
    /// USD cost, reported by some gateways (e.g. OpenRouter).
    #[serde(default)]
    cost: Option<f64>,
}

fn saturate_u32(val: u64) -> u32 {
    val.min(u32::MAX as u64) as u32
}

fn parse_usage(usage: Option<&ChatCompletionUsage>) -> (u32, u32) {
    let Some(u) = usage else {
        return (0, 0);
    };
    let input = u.prompt_tokens.map(saturate_u32).unwrap_or(0);
    let output = u.completion_tokens.map(saturate_u32).unwrap_or_else(|| {
        // Fall back to total - prompt if completion is missing.
        match (u.total_tokens, u.prompt_tokens) {
            (Some(total), Some(prompt)) => saturate_u32(total.saturating_sub(prompt)),
            (Some(total), None) => saturate_u32(total),
            _ => 0,
        }
    });
    (input, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the request text.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });
        (format!("http://{}", addr), handle)
    }

    fn provider(base_url: &str) -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(AiConfig {
            api_key: Some(SecretString::from("test-key".to_string())),
            base_url: base_url.to_string(),
            ..AiConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_api_url_with_and_without_v1() {
        let p = provider("https://api.groq.com/openai/v1/");
        assert_eq!(
            p.api_url("chat/completions"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        let p = provider("http://localhost:8080");
        assert_eq!(
            p.api_url("/chat/completions"),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn test_missing_api_key_is_auth_failure() {
        let err = OpenAiCompatProvider::new(AiConfig::default()).err().unwrap();
        assert!(matches!(err, LlmError::AuthFailed { .. }));
    }

    #[test]
    fn test_parse_usage_falls_back_to_total() {
        let usage = ChatCompletionUsage {
            prompt_tokens: Some(100),
            completion_tokens: None,
            total_tokens: Some(150),
            cost: None,
        };
        assert_eq!(parse_usage(Some(&usage)), (100, 50));
        assert_eq!(parse_usage(None), (0, 0));
    }

    #[tokio::test]
    async fn test_complete_success_with_usage_and_cost() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"message":{"role":"assistant","content":"{\"ok\":true}"}}],
               "usage":{"prompt_tokens":120,"completion_tokens":30,"cost":0.0015}}"#,
        )
        .await;

        let response = provider(&url)
            .complete(CompletionRequest::new("analyze this").with_system("be terse"))
            .await
            .unwrap();

        assert_eq!(response.content, r#"{"ok":true}"#);
        assert_eq!(response.input_tokens, 120);
        assert_eq!(response.output_tokens, 30);
        assert_eq!(response.billed_cost, Some(dec!(0.0015)));

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer test-key"));
        assert!(request.contains(r#""role":"system""#));
        assert!(request.contains("analyze this"));
    }

    #[tokio::test]
    async fn test_complete_maps_status_codes() {
        let (url, _server) = serve_once("401 Unauthorized", r#"{"error":"bad key"}"#).await;
        let err = provider(&url)
            .complete(CompletionRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::AuthFailed { .. }));

        let (url, _server) = serve_once("429 Too Many Requests", "{}").await;
        let err = provider(&url)
            .complete(CompletionRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));

        let (url, _server) = serve_once("500 Internal Server Error", "boom").await;
        let err = provider(&url)
            .complete(CompletionRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RequestFailed { .. }));
    }

    #[tokio::test]
    async fn test_complete_rejects_empty_choices() {
        let (url, _server) = serve_once("200 OK", r#"{"choices":[]}"#).await;
        let err = provider(&url)
            .complete(CompletionRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse { .. }));
    }
}

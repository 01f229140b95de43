//! Adapter for OpenAI-compatible chat-completions backends.
//!
//! Covers every backend speaking the `/chat/completions` wire shape,
//! including SiliconFlow-class aggregators and self-hosted gateways. One
//! request carries the system and user prompt as two messages; the reply's
//! first choice is fed through the recovery parser.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::parser::AnnotationUnit;
use crate::service::{AnnotationService, ContentStream, PromptPair, ServiceDescriptor};

const DEFAULT_BASE_URL: &str = "https://api.siliconflow.cn/v1";

pub struct OpenAiCompatService {
    client: Client,
    descriptor: ServiceDescriptor,
    base_url: String,
}

impl OpenAiCompatService {
    pub fn new(descriptor: ServiceDescriptor) -> Result<Self, ServiceError> {
        descriptor.require_api_key()?;
        let client = Client::builder()
            .timeout(descriptor.timeout)
            .build()
            .map_err(|e| ServiceError::Config(format!("failed to build HTTP client: {e}")))?;
        let base_url = descriptor
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        debug!(
            backend = %descriptor.backend_id,
            base_url = %base_url,
            api_key = %descriptor.api_key_masked(),
            "OpenAI-compatible adapter ready"
        );
        Ok(Self {
            client,
            descriptor,
            base_url,
        })
    }

    fn request_body(&self, prompt: &PromptPair, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.descriptor.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: prompt.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.user.clone(),
                },
            ],
            temperature: self.descriptor.temperature,
            max_tokens: self.descriptor.max_tokens,
            stream,
        }
    }

    async fn execute(&self, request: &ChatRequest) -> Result<String, ServiceError> {
        let url = format!("{}/chat/completions", self.base_url);
        let _permit = self.descriptor.throttle().await;

        if self.descriptor.verbose_wire_log {
            debug!(
                backend = %self.descriptor.backend_id,
                url = %url,
                body = %serde_json::to_string(request).unwrap_or_default(),
                "Sending chat request"
            );
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.descriptor.require_api_key()?))
            .json(request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            let message = match serde_json::from_str::<ApiErrorBody>(&body) {
                Ok(parsed) => parsed.error.message,
                Err(_) => body,
            };
            if code == 429 {
                return Err(ServiceError::RateLimited(message));
            }
            return Err(ServiceError::Api { code, message });
        }

        let reply: ChatResponse = response.json().await.map_err(|e| {
            ServiceError::RequestFailed(format!("failed to decode response body: {e}"))
        })?;

        if let Some(usage) = &reply.usage {
            debug!(
                backend = %self.descriptor.backend_id,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "Token usage"
            );
        }

        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if self.descriptor.verbose_wire_log {
            debug!(
                backend = %self.descriptor.backend_id,
                content_len = content.len(),
                "Received chat response"
            );
        }
        Ok(content)
    }
}

#[async_trait]
impl AnnotationService for OpenAiCompatService {
    async fn annotate(&self, prompt: &PromptPair) -> Result<Vec<AnnotationUnit>, ServiceError> {
        let request = self.request_body(prompt, false);
        let content = self.execute(&request).await?;
        self.descriptor.recover_units(&content)
    }

    async fn health_check(&self) -> (bool, String) {
        let probe = ChatRequest {
            model: self.descriptor.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "reply with the single word: ok".to_string(),
            }],
            temperature: 0.0,
            max_tokens: 8,
            stream: false,
        };
        match self.execute(&probe).await {
            Ok(_) => (true, format!("backend '{}' reachable", self.descriptor.backend_id)),
            Err(e) => {
                warn!(backend = %self.descriptor.backend_id, error = %e, "Health check failed");
                (false, e.to_string())
            }
        }
    }

    /// Streams content fragments using server-sent events, reassembling
    /// `data:` lines that arrive split across network chunks.
    async fn annotate_stream(&self, prompt: &PromptPair) -> Result<ContentStream, ServiceError> {
        let request = self.request_body(prompt, true);
        let url = format!("{}/chat/completions", self.base_url);
        let _permit = self.descriptor.throttle().await;

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.descriptor.require_api_key()?))
            .json(&request)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read error body".to_string());
            if code == 429 {
                return Err(ServiceError::RateLimited(message));
            }
            return Err(ServiceError::Api { code, message });
        }

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut pending = String::new();
            let mut done = false;
            while !done {
                let chunk = match bytes.next().await {
                    Some(chunk) => chunk,
                    None => break,
                };
                let chunk = chunk.map_err(|e| {
                    ServiceError::RequestFailed(format!("stream interrupted: {e}"))
                })?;
                pending.push_str(&String::from_utf8_lossy(&chunk));

                // Only complete lines are events; a trailing partial line
                // stays buffered until the next chunk completes it.
                while let Some(newline) = pending.find('\n') {
                    let line = pending[..newline].trim().to_string();
                    pending.drain(..=newline);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        done = true;
                        break;
                    }
                    if let Ok(event) = serde_json::from_str::<StreamEvent>(payload) {
                        for choice in event.choices {
                            if let Some(content) = choice.delta.content {
                                if !content.is_empty() {
                                    yield content;
                                }
                            }
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }
}

fn classify_send_error(e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout(e.to_string())
    } else {
        ServiceError::RequestFailed(e.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

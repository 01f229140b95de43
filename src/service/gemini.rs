//! Adapter for Google Gemini generateContent backends.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::parser::AnnotationUnit;
use crate::service::{AnnotationService, PromptPair, ServiceDescriptor};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiService {
    client: Client,
    descriptor: ServiceDescriptor,
    base_url: String,
}

impl GeminiService {
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
            "Gemini adapter ready"
        );
        Ok(Self {
            client,
            descriptor,
            base_url,
        })
    }

    async fn execute(&self, request: &GenerateRequest) -> Result<String, ServiceError> {
        // The key travels in a header rather than the query string so it
        // never shows up in request logs.
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.descriptor.model
        );
        let _permit = self.descriptor.throttle().await;

        if self.descriptor.verbose_wire_log {
            debug!(
                backend = %self.descriptor.backend_id,
                url = %url,
                body = %serde_json::to_string(request).unwrap_or_default(),
                "Sending generateContent request"
            );
        }

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", self.descriptor.require_api_key()?)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ServiceError::Timeout(e.to_string())
                } else {
                    ServiceError::RequestFailed(e.to_string())
                }
            })?;

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

        let reply: GenerateResponse = response.json().await.map_err(|e| {
            ServiceError::RequestFailed(format!("failed to decode response body: {e}"))
        })?;

        if let Some(usage) = &reply.usage_metadata {
            debug!(
                backend = %self.descriptor.backend_id,
                prompt_tokens = usage.prompt_token_count,
                completion_tokens = usage.candidates_token_count,
                total_tokens = usage.total_token_count,
                "Token usage"
            );
        }

        let content = reply
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        Ok(content)
    }
}

#[async_trait]
impl AnnotationService for GeminiService {
    async fn annotate(&self, prompt: &PromptPair) -> Result<Vec<AnnotationUnit>, ServiceError> {
        let request = GenerateRequest {
            system_instruction: Some(ContentBlock {
                role: None,
                parts: vec![Part {
                    text: prompt.system.clone(),
                }],
            }),
            contents: vec![ContentBlock {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: prompt.user.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.descriptor.temperature,
                max_output_tokens: self.descriptor.max_tokens,
            },
        };
        let content = self.execute(&request).await?;
        self.descriptor.recover_units(&content)
    }

    async fn health_check(&self) -> (bool, String) {
        let probe = GenerateRequest {
            system_instruction: None,
            contents: vec![ContentBlock {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: "reply with the single word: ok".to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.0,
                max_output_tokens: 8,
            },
        };
        match self.execute(&probe).await {
            Ok(_) => (true, format!("backend '{}' reachable", self.descriptor.backend_id)),
            Err(e) => {
                warn!(backend = %self.descriptor.backend_id, error = %e, "Health check failed");
                (false, e.to_string())
            }
        }
    }

    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ContentBlock>,
    contents: Vec<ContentBlock>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct ContentBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

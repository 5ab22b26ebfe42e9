//! LLM capability: chat completions against an OpenAI-compatible
//! endpoint (OpenRouter by default).
//!
//! The oracle dispatcher is the only consumer; it hands over a fully
//! assembled prompt and gets back plain text or a typed error.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OracleConfig;
use crate::types::{Capability, CoreError, CoreResult};

/// LLM completion capability.
#[async_trait]
pub trait Llm: Send + Sync {
    async fn complete(&self, prompt: &str, timeout: Duration) -> CoreResult<String>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// OpenAI-compatible chat completions client.
pub struct HttpLlm {
    client: reqwest::Client,
    config: OracleConfig,
    api_key: String,
}

impl HttpLlm {
    pub fn new(config: OracleConfig, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm_timeout_secs.max(1)))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            config,
            api_key,
        }
    }
}

#[async_trait]
impl Llm for HttpLlm {
    async fn complete(&self, prompt: &str, timeout: Duration) -> CoreResult<String> {
        let request = ChatRequest {
            model: self.config.llm_model.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_string(),
            }],
        };

        debug!(model = %self.config.llm_model, prompt_chars = prompt.len(), "llm request");

        let send = self
            .client
            .post(&self.config.llm_endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send();

        let response = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(if e.is_timeout() {
                    CoreError::CapabilityTimeout {
                        capability: Capability::Llm,
                        waited_secs: timeout.as_secs(),
                    }
                } else {
                    CoreError::CapabilityFailure {
                        capability: Capability::Llm,
                        message: e.to_string(),
                    }
                })
            }
            Err(_) => {
                return Err(CoreError::CapabilityTimeout {
                    capability: Capability::Llm,
                    waited_secs: timeout.as_secs(),
                })
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::CapabilityFailure {
                capability: Capability::Llm,
                message: format!("endpoint returned {status}: {body}"),
            });
        }

        let parsed: ChatResponse =
            response.json().await.map_err(|e| CoreError::CapabilityFailure {
                capability: Capability::Llm,
                message: format!("malformed completion response: {e}"),
            })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CoreError::CapabilityFailure {
                capability: Capability::Llm,
                message: "no choices in response".into(),
            })?;

        if text.trim().is_empty() {
            return Err(CoreError::CapabilityFailure {
                capability: Capability::Llm,
                message: "empty completion".into(),
            });
        }
        Ok(text)
    }

    fn model_name(&self) -> &str {
        &self.config.llm_model
    }
}

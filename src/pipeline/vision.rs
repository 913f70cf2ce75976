//! Vision service collaborators: send a page image plus an instruction,
//! get the model's text reply back.
//!
//! The locator only needs "image + prompt in, text out", so that is the whole
//! [`VisionService`] trait. Two implementations ship with the crate:
//!
//! * [`AnthropicVision`] — direct call to the Anthropic Messages API over
//!   `reqwest`, driven by an API key and model name.
//! * [`ProviderVision`] — any vision-capable `edgequake-llm` provider
//!   (OpenAI, Gemini, Ollama, …), resolved by name through
//!   [`ProviderFactory`].
//!
//! Tests and embedders can inject their own implementation through
//! [`crate::config::LabelConfigBuilder::vision`].

use crate::config::LabelConfig;
use crate::pipeline::encode::VisionImage;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Anthropic Messages API endpoint.
pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// `anthropic-version` header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Why a vision call produced no usable reply.
#[derive(Debug, Error)]
pub enum VisionError {
    /// Connection, TLS or body-read failure.
    #[error("vision request failed: {0}")]
    Transport(String),

    /// The service answered with a non-success HTTP status.
    #[error("vision service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// An `edgequake-llm` provider reported an error.
    #[error("vision provider error: {0}")]
    Provider(String),

    /// The reply envelope did not contain any text.
    #[error("unexpected vision response: {0}")]
    Response(String),

    /// A named provider could not be constructed.
    #[error("vision provider '{provider}' is not configured: {hint}")]
    NotConfigured { provider: String, hint: String },
}

/// Image + instruction in, model text out.
#[async_trait]
pub trait VisionService: Send + Sync {
    /// Short name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Send `image` with `prompt` and return the raw text reply.
    async fn complete(&self, image: &VisionImage, prompt: &str) -> Result<String, VisionError>;
}

// ── Anthropic ────────────────────────────────────────────────────────────

/// Direct Anthropic Messages API client.
pub struct AnthropicVision {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: usize,
    endpoint: String,
}

impl std::fmt::Debug for AnthropicVision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicVision")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl AnthropicVision {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 256,
            endpoint: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Point the client at a different Messages endpoint (proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// JSON body of a Messages request: image block first, then the text.
    fn request_body(&self, image: &VisionImage, prompt: &str) -> serde_json::Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": "image/png",
                            "data": image.base64,
                        }
                    },
                    { "type": "text", "text": prompt }
                ]
            }]
        })
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// First text block of a Messages API response.
fn first_text_block(body: &str) -> Result<String, VisionError> {
    let parsed: MessagesResponse =
        serde_json::from_str(body).map_err(|e| VisionError::Response(e.to_string()))?;
    parsed
        .content
        .into_iter()
        .find(|b| b.kind == "text")
        .and_then(|b| b.text)
        .ok_or_else(|| VisionError::Response("no text block in reply".into()))
}

#[async_trait]
impl VisionService for AnthropicVision {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, image: &VisionImage, prompt: &str) -> Result<String, VisionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&self.request_body(image, prompt))
            .send()
            .await
            .map_err(|e| VisionError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VisionError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(VisionError::Status {
                status: status.as_u16(),
                body: truncate(&body, 300),
            });
        }
        debug!("Anthropic vision reply: {} bytes", body.len());
        first_text_block(&body)
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s.to_string(),
    }
}

// ── edgequake-llm providers ──────────────────────────────────────────────

/// Any vision-capable `edgequake-llm` provider.
pub struct ProviderVision {
    provider: Arc<dyn LLMProvider>,
    name: String,
    max_tokens: usize,
}

impl ProviderVision {
    pub fn new(provider: Arc<dyn LLMProvider>, name: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            provider,
            name: name.into(),
            max_tokens,
        }
    }

    /// Build a provider by name ("openai", "gemini", "ollama", …).
    ///
    /// Credentials come from the provider's own environment variables.
    pub fn from_name(name: &str, model: &str, max_tokens: usize) -> Result<Self, VisionError> {
        let provider = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
            VisionError::NotConfigured {
                provider: name.to_string(),
                hint: format!("{e}"),
            }
        })?;
        Ok(Self::new(provider, name, max_tokens))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl VisionService for ProviderVision {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, image: &VisionImage, prompt: &str) -> Result<String, VisionError> {
        let messages = vec![ChatMessage::user_with_images(
            prompt,
            vec![image.to_image_data()],
        )];
        let response = self
            .provider
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(|e| VisionError::Provider(e.to_string()))?;
        Ok(response.content)
    }
}

/// Pick the vision service for `config`, most specific first.
///
/// 1. A pre-built service (`config.vision`).
/// 2. A named `edgequake-llm` provider (`config.vision_provider`).
/// 3. The built-in Anthropic client when an API key is set.
/// 4. None: the locator runs in its documented no-service mode.
pub fn resolve_vision(config: &LabelConfig) -> Result<Option<Arc<dyn VisionService>>, VisionError> {
    if let Some(ref service) = config.vision {
        return Ok(Some(Arc::clone(service)));
    }
    if let Some(ref name) = config.vision_provider {
        let service = ProviderVision::from_name(name, &config.model, config.vision_max_tokens)?;
        return Ok(Some(Arc::new(service)));
    }
    if let Some(ref key) = config.api_key {
        let service = AnthropicVision::new(key.clone(), config.model.clone())
            .with_max_tokens(config.vision_max_tokens);
        return Ok(Some(Arc::new(service)));
    }
    Ok(None)
}

use crate::config::LlmConfig;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

/// Categorized failures from the generation backend. Terminal variants are
/// never retried; everything else goes through backoff inside the client.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Cannot connect to model server at {0}")]
    CannotConnect(String),
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("Model server temporarily overloaded")]
    Overloaded,
    #[error("Invalid structured output: {0}")]
    InvalidStructuredOutput(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Empty response from model")]
    Empty,
}

impl LlmError {
    /// Connectivity and schema-shape failures will not improve on retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LlmError::CannotConnect(_) | LlmError::InvalidStructuredOutput(_)
        )
    }
}

/// One generation request: prompt, optional system instruction, optional
/// JSON output schema, and sampling parameters.
#[derive(Debug, Clone)]
pub struct GenRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub schema: Option<serde_json::Value>,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
}

impl GenRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            schema: None,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 8000,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn sampling(mut self, temperature: f32, top_p: f32, top_k: u32) -> Self {
        self.temperature = temperature;
        self.top_p = top_p;
        self.top_k = top_k;
        self
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn generate(&self, req: &GenRequest) -> Result<String, LlmError>;

    /// Streaming variant: chunks are delivered through the callback and the
    /// concatenated text is returned. Default falls back to non-streaming.
    async fn generate_stream(
        &self,
        req: &GenRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
    ) -> Result<String, LlmError> {
        let text = self.generate(req).await?;
        on_chunk(&text);
        Ok(text)
    }
}

pub fn create_llm(config: &LlmConfig) -> Box<dyn LlmClient> {
    Box::new(LmStudioClient::new(config))
}

// --- LM Studio (OpenAI-compatible chat completions) ---

#[derive(Debug)]
pub struct LmStudioClient {
    base_url: String,
    model: String,
    retry_count: usize,
    schema_retry_count: usize,
    base_delay_ms: u64,
    schema_base_delay_ms: u64,
    request_timeout_secs: u64,
    stream_timeout_secs: u64,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    top_p: f32,
    // Not part of the OpenAI schema, but LM Studio honors it.
    top_k: u32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

impl LmStudioClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            retry_count: config.retry_count,
            schema_retry_count: config.schema_retry_count,
            base_delay_ms: config.base_delay_ms,
            schema_base_delay_ms: config.schema_base_delay_ms,
            request_timeout_secs: config.request_timeout_secs,
            stream_timeout_secs: config.stream_timeout_secs,
            client: reqwest::Client::new(),
        }
    }

    fn build_messages(req: &GenRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if let Some(system) = &req.system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: req.prompt.clone(),
        });
        messages
    }

    fn classify_error(&self, err: reqwest::Error, timeout_secs: u64) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout(timeout_secs)
        } else if err.is_connect() {
            LlmError::CannotConnect(self.base_url.clone())
        } else {
            LlmError::Http {
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                body: err.to_string(),
            }
        }
    }

    fn classify_status(status: u16, body: String) -> LlmError {
        match status {
            429 => LlmError::RateLimited,
            503 => LlmError::Overloaded,
            _ => LlmError::Http { status, body },
        }
    }

    async fn send_once(&self, req: &GenRequest) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: Self::build_messages(req),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_tokens: req.max_tokens,
            stream: false,
            response_format: req.schema.as_ref().map(|schema| ResponseFormat {
                kind: "json_object".to_string(),
                schema: Some(schema.clone()),
            }),
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify_error(e, self.request_timeout_secs))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status.as_u16(), text));
        }

        let data: ChatResponse = resp.json().await.map_err(|e| LlmError::Http {
            status: 0,
            body: format!("Failed to parse completion response: {}", e),
        })?;

        let text = data
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(LlmError::Empty)?;

        // When structured output was requested, a non-JSON body is a contract
        // violation the caller cannot default around.
        if req.schema.is_some() {
            if serde_json::from_str::<serde_json::Value>(text.trim()).is_err() {
                return Err(LlmError::InvalidStructuredOutput(
                    text.chars().take(200).collect(),
                ));
            }
        }

        Ok(text)
    }

    async fn send_stream_once(
        &self,
        req: &GenRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
    ) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: Self::build_messages(req),
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_tokens: req.max_tokens,
            stream: true,
            response_format: None,
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(Duration::from_secs(self.stream_timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify_error(e, self.stream_timeout_secs))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status.as_u16(), text));
        }

        let mut resp = resp;
        let mut full_text = String::new();
        let mut buffer = String::new();

        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| self.classify_error(e, self.stream_timeout_secs))?
        {
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].to_string();
                buffer.drain(..=pos);
                if let Some(content) = parse_sse_line(&line) {
                    full_text.push_str(&content);
                    on_chunk(&content);
                }
            }
        }

        Ok(full_text)
    }

    async fn with_retries<F, Fut>(&self, max_attempts: usize, base_delay_ms: u64, f: F) -> Result<String, LlmError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<String, LlmError>>,
    {
        let mut last_err = None;
        for attempt in 0..max_attempts {
            match f().await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    if e.is_terminal() {
                        return Err(e);
                    }
                    if attempt + 1 == max_attempts {
                        log::error!("Generation failed after {} attempts: {}", max_attempts, e);
                        return Err(e);
                    }

                    let mut delay = base_delay_ms.saturating_mul(1 << attempt);
                    // Rate-limit and overload signatures warrant longer waits.
                    match &e {
                        LlmError::Overloaded => {
                            delay = delay.max(5000 + attempt as u64 * 3000);
                        }
                        LlmError::RateLimited => {
                            delay = delay.max(10000 + attempt as u64 * 5000);
                        }
                        _ => {}
                    }
                    let jitter: u64 = rand::rng().random_range(0..1000);
                    delay += jitter;

                    log::warn!(
                        "Attempt {}/{} failed: {}. Waiting {}ms before retry...",
                        attempt + 1,
                        max_attempts,
                        e,
                        delay
                    );
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
        Err(last_err.unwrap_or(LlmError::Empty))
    }

    /// Non-fatal model discovery; an unreachable server yields an empty list.
    pub async fn list_models(&self) -> Vec<String> {
        let resp = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status().is_success() => resp
                .json::<ModelsResponse>()
                .await
                .map(|m| m.data.into_iter().map(|e| e.id).collect())
                .unwrap_or_default(),
            Ok(resp) => {
                log::warn!("Model listing returned HTTP {}", resp.status());
                Vec::new()
            }
            Err(e) => {
                log::warn!("Failed to fetch model list: {}", e);
                Vec::new()
            }
        }
    }
}

fn parse_sse_line(line: &str) -> Option<String> {
    let data = line.trim().strip_prefix("data: ")?.trim();
    if data == "[DONE]" {
        return None;
    }
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;
    chunk.choices.into_iter().next()?.delta.content
}

#[async_trait]
impl LlmClient for LmStudioClient {
    async fn generate(&self, req: &GenRequest) -> Result<String, LlmError> {
        // Schema requests get a larger retry budget; structured output is the
        // flakiest thing local models do.
        let (attempts, base_delay) = if req.schema.is_some() {
            (self.schema_retry_count, self.schema_base_delay_ms)
        } else {
            (self.retry_count, self.base_delay_ms)
        };

        self.with_retries(attempts, base_delay, || self.send_once(req))
            .await
    }

    async fn generate_stream(
        &self,
        req: &GenRequest,
        on_chunk: &(dyn for<'c> Fn(&'c str) + Send + Sync),
    ) -> Result<String, LlmError> {
        self.with_retries(self.retry_count, self.base_delay_ms, || {
            self.send_stream_once(req, on_chunk)
        })
        .await
    }
}

pub mod error;
pub mod mock;
pub mod prompt;
pub mod types;

pub use error::{LLMError, RateLimitInfo};
pub use mock::MockLLMClient;
pub use prompt::{Classification, ClassificationPrompt, PromptError, TEMPLATE_MARKER};
pub use types::{ChatMessage, ChatRole, CompletionRequest, CompletionResponse};

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genai::{
    Client as GenaiClient, Error as GenaiError,
    chat::{
        ChatMessage as GenaiChatMessage, ChatOptions, ChatRequest, ChatResponse,
        ChatResponseFormat, MessageContent,
    },
    webc,
};
use reqwest::{
    StatusCode,
    header::{HeaderMap, HeaderValue, RETRY_AFTER},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::mailbox::Uid;

/// What a completion call is for; carried into logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCallContext {
    /// High-level feature name, e.g. "classification".
    pub feature: String,
    pub uid: Option<Uid>,
}

impl LlmCallContext {
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            uid: None,
        }
    }

    pub fn for_message(feature: impl Into<String>, uid: Uid) -> Self {
        Self {
            feature: feature.into(),
            uid: Some(uid),
        }
    }
}

/// Minimal async interface for LLM clients used throughout the crate.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError>;
}

#[async_trait]
pub trait ChatExecutor: Send + Sync {
    async fn exec_chat(
        &self,
        model: &str,
        request: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<ChatResponse, GenaiError>;
}

#[async_trait]
impl ChatExecutor for GenaiClient {
    async fn exec_chat(
        &self,
        model: &str,
        request: ChatRequest,
        options: Option<&ChatOptions>,
    ) -> Result<ChatResponse, GenaiError> {
        GenaiClient::exec_chat(self, model, request, options).await
    }
}

/// Default LLM client backed by the genai crate. Provider keys come from the
/// environment the way genai resolves them (`OPENAI_API_KEY`, ...).
pub struct GenaiLLMClient {
    chat: Arc<dyn ChatExecutor>,
    model: String,
}

impl GenaiLLMClient {
    pub fn new(model_config: &ModelConfig) -> Self {
        let chat: Arc<dyn ChatExecutor> = Arc::new(GenaiClient::default());
        Self::with_executor(model_config, chat)
    }

    pub fn with_executor(model_config: &ModelConfig, chat: Arc<dyn ChatExecutor>) -> Self {
        Self {
            chat,
            model: namespaced_model(model_config),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_chat_request(&self, request: &CompletionRequest) -> ChatRequest {
        let messages = request
            .messages
            .iter()
            .map(to_genai_message)
            .collect::<Vec<_>>();
        ChatRequest::from_messages(messages)
    }

    fn build_chat_options(&self, request: &CompletionRequest) -> ChatOptions {
        let mut options = ChatOptions::default()
            .with_temperature(request.temperature as f64)
            .with_max_tokens(request.max_tokens);

        if request.json_mode {
            options = options.with_response_format(ChatResponseFormat::JsonMode);
        }

        options
    }
}

#[async_trait]
impl LLMClient for GenaiLLMClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        context: LlmCallContext,
    ) -> Result<CompletionResponse, LLMError> {
        let chat_request = self.build_chat_request(&request);
        let options = self.build_chat_options(&request);

        let start = Instant::now();
        let result = self
            .chat
            .exec_chat(&self.model, chat_request, Some(&options))
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let content = response.first_text().unwrap_or("").to_string();
                let provider_model = response.provider_model_iden.to_string();
                let (input_tokens, output_tokens) = usage_tokens(&response.usage);
                debug!(
                    feature = %context.feature,
                    uid = ?context.uid,
                    model = %provider_model,
                    input_tokens,
                    output_tokens,
                    latency_ms,
                    "llm call completed"
                );

                Ok(CompletionResponse {
                    content,
                    model: provider_model,
                    input_tokens,
                    output_tokens,
                    latency_ms,
                })
            }
            Err(err) => {
                let mapped = map_genai_error(err);
                warn!(
                    feature = %context.feature,
                    uid = ?context.uid,
                    model = %self.model,
                    latency_ms,
                    error = %mapped,
                    "llm call failed"
                );
                Err(mapped)
            }
        }
    }
}

fn to_genai_message(message: &ChatMessage) -> GenaiChatMessage {
    match message.role {
        ChatRole::System => GenaiChatMessage::system(text_content(&message.content)),
        ChatRole::User => GenaiChatMessage::user(text_content(&message.content)),
        ChatRole::Assistant => GenaiChatMessage::assistant(text_content(&message.content)),
    }
}

fn text_content(content: &str) -> MessageContent {
    MessageContent::from_text(content.to_string())
}

fn namespaced_model(cfg: &ModelConfig) -> String {
    if cfg.provider.is_empty() {
        cfg.model.clone()
    } else {
        format!("{}::{}", cfg.provider.to_lowercase(), cfg.model)
    }
}

fn usage_tokens(usage: &genai::chat::Usage) -> (u32, u32) {
    let input = usage.prompt_tokens.unwrap_or_default().max(0) as u32;
    let output = usage.completion_tokens.unwrap_or_default().max(0) as u32;
    (input, output)
}

fn map_genai_error(err: GenaiError) -> LLMError {
    match err {
        GenaiError::RequiresApiKey { .. }
        | GenaiError::NoAuthResolver { .. }
        | GenaiError::NoAuthData { .. } => LLMError::AuthenticationFailed,
        GenaiError::ChatReqHasNoMessages { .. }
        | GenaiError::LastChatMessageIsNotUser { .. }
        | GenaiError::MessageRoleNotSupported { .. }
        | GenaiError::MessageContentTypeNotSupported { .. }
        | GenaiError::JsonModeWithoutInstruction
        | GenaiError::VerbosityParsing { .. }
        | GenaiError::ReasoningParsingError { .. }
        | GenaiError::ServiceTierParsing { .. }
        | GenaiError::ModelMapperFailed { .. }
        | GenaiError::AdapterNotSupported { .. }
        | GenaiError::Resolver { .. } => LLMError::InvalidRequest(err.to_string()),
        GenaiError::InvalidJsonResponseElement { .. } | GenaiError::StreamParse { .. } => {
            LLMError::ParseError(err.to_string())
        }
        GenaiError::NoChatResponse { .. } => LLMError::ServerError(err.to_string()),
        GenaiError::WebAdapterCall { webc_error, .. }
        | GenaiError::WebModelCall { webc_error, .. } => map_webc_error(webc_error),
        GenaiError::ChatResponse { .. } | GenaiError::WebStream { .. } => {
            LLMError::ProviderError(err.to_string())
        }
        GenaiError::Internal(msg) => LLMError::ProviderError(msg),
        GenaiError::EventSourceClone(e) => LLMError::ProviderError(e.to_string()),
        GenaiError::JsonValueExt(e) => LLMError::ParseError(e.to_string()),
        GenaiError::ReqwestEventSource(err) => LLMError::ProviderError(err.to_string()),
        GenaiError::SerdeJson(err) => LLMError::ParseError(err.to_string()),
    }
}

fn map_webc_error(err: webc::Error) -> LLMError {
    match &err {
        webc::Error::ResponseFailedStatus {
            status, headers, ..
        } => {
            let retry_after_ms = retry_after_ms_from_headers(headers);
            match *status {
                StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => {
                    LLMError::RateLimited(RateLimitInfo::new(retry_after_ms))
                }
                StatusCode::UNAUTHORIZED => LLMError::AuthenticationFailed,
                status if status.is_client_error() => LLMError::InvalidRequest(status.to_string()),
                status if status.is_server_error() => LLMError::ServerError(status.to_string()),
                status => LLMError::ProviderError(status.to_string()),
            }
        }
        webc::Error::Reqwest(req_err) => {
            if req_err.is_timeout() {
                LLMError::Timeout
            } else {
                LLMError::ProviderError(req_err.to_string())
            }
        }
        webc::Error::ResponseFailedNotJson { .. } => LLMError::ParseError(err.to_string()),
        webc::Error::JsonValueExt(parse_err) => LLMError::ParseError(parse_err.to_string()),
        webc::Error::EventSourceClone(clone_err) => LLMError::ProviderError(clone_err.to_string()),
    }
}

fn retry_after_ms_from_headers(headers: &HeaderMap) -> Option<u64> {
    if let Some(ms) = headers.get(RETRY_AFTER).and_then(parse_retry_after) {
        return Some(ms);
    }

    headers.get("x-ratelimit-reset").and_then(parse_epoch_reset)
}

fn parse_retry_after(value: &HeaderValue) -> Option<u64> {
    let raw = value.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs.saturating_mul(1000));
    }

    // HTTP-date form
    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta_ms = (at.with_timezone(&Utc) - Utc::now()).num_milliseconds();
    (delta_ms > 0).then_some(delta_ms as u64)
}

fn parse_epoch_reset(value: &HeaderValue) -> Option<u64> {
    let reset_epoch = value.to_str().ok()?.trim().parse::<i64>().ok()?;
    let delta_ms = (reset_epoch - Utc::now().timestamp()).saturating_mul(1000);
    (delta_ms > 0).then_some(delta_ms as u64)
}

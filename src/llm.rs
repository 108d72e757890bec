use crate::http::build_client;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Duration, timeout};

/// Abort budget for a single generation call. Timeouts surface as
/// `LlmError::TimedOut`, distinct from transport failures.
pub const GENERATION_TIMEOUT_SECS: u64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
    OpenAi,
    Gemini,
}

impl LlmProvider {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(LlmProvider::Anthropic),
            "openai" => Some(LlmProvider::OpenAi),
            "gemini" | "google" => Some(LlmProvider::Gemini),
            _ => None,
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-sonnet-4-20250514",
            LlmProvider::OpenAi => "gpt-4o",
            LlmProvider::Gemini => "gemini-2.0-flash",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        let provider = std::env::var("LLM_PROVIDER")
            .ok()
            .and_then(|value| LlmProvider::parse(&value))
            .unwrap_or(LlmProvider::Anthropic);
        let api_key = match provider {
            LlmProvider::Anthropic => std::env::var("ANTHROPIC_API_KEY").ok(),
            LlmProvider::OpenAi => std::env::var("OPENAI_API_KEY").ok(),
            LlmProvider::Gemini => std::env::var("GEMINI_API_KEY").ok(),
        };
        let model = std::env::var("LLM_MODEL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| provider.default_model().to_string());
        let timeout_secs = std::env::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(GENERATION_TIMEOUT_SECS);
        Self {
            provider,
            api_key,
            model,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing api key for configured provider")]
    MissingApiKey,
    #[error("generation timed out")]
    TimedOut,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        // Generation calls run longer than the shared client's request
        // timeout allows; the per-call budget in `chat` is the real cap.
        let http = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| build_client());
        Self { http, config }
    }

    pub async fn chat(&self, messages: &[LlmMessage]) -> Result<LlmResponse, LlmError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(LlmError::MissingApiKey)?;

        let call = async {
            match self.config.provider {
                LlmProvider::Anthropic => self.chat_anthropic(key, messages).await,
                LlmProvider::OpenAi => self.chat_openai(key, messages).await,
                LlmProvider::Gemini => self.chat_gemini(key, messages).await,
            }
        };

        match timeout(self.config.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::TimedOut),
        }
    }

    async fn chat_anthropic(
        &self,
        key: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, LlmError> {
        let (system, turns) = split_system(messages);
        let body = AnthropicRequest {
            model: &self.config.model,
            max_tokens: 4096,
            system,
            messages: turns
                .iter()
                .map(|message| AnthropicMessage {
                    role: &message.role,
                    content: &message.content,
                })
                .collect(),
        };
        let response = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }
        let payload: AnthropicResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let text = payload
            .content
            .into_iter()
            .filter_map(|block| match block {
                AnthropicBlock::Text { text } => Some(text),
                AnthropicBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        if text.is_empty() {
            return Err(LlmError::InvalidResponse("missing text content".into()));
        }
        Ok(LlmResponse {
            text,
            model: payload.model.unwrap_or_else(|| self.config.model.clone()),
            input_tokens: payload.usage.as_ref().map(|u| u.input_tokens).unwrap_or(0),
            output_tokens: payload.usage.as_ref().map(|u| u.output_tokens).unwrap_or(0),
        })
    }

    async fn chat_openai(
        &self,
        key: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, LlmError> {
        let body = OpenAiRequest {
            model: &self.config.model,
            messages: messages
                .iter()
                .map(|message| OpenAiMessage {
                    role: &message.role,
                    content: &message.content,
                })
                .collect(),
        };
        let response = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }
        let payload: OpenAiResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let text = payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("no choices".into()))?;
        Ok(LlmResponse {
            text,
            model: self.config.model.clone(),
            input_tokens: payload.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: payload
                .usage
                .as_ref()
                .map(|u| u.completion_tokens)
                .unwrap_or(0),
        })
    }

    async fn chat_gemini(
        &self,
        key: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, LlmError> {
        let (system, turns) = split_system(messages);
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent?key={key}",
            model = self.config.model,
        );
        let body = GeminiRequest {
            system_instruction: system.map(|text| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text }],
            }),
            contents: turns
                .iter()
                .map(|message| GeminiContent {
                    role: Some(if message.role == "assistant" {
                        "model".into()
                    } else {
                        "user".into()
                    }),
                    parts: vec![GeminiPart {
                        text: message.content.clone(),
                    }],
                })
                .collect(),
        };
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }
        let payload: GeminiResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;
        let text = payload
            .candidates
            .into_iter()
            .next()
            .map(|candidate| {
                candidate
                    .content
                    .parts
                    .into_iter()
                    .map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|text| !text.is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("no candidates".into()))?;
        Ok(LlmResponse {
            text,
            model: self.config.model.clone(),
            input_tokens: payload
                .usage_metadata
                .as_ref()
                .and_then(|u| u.prompt_token_count)
                .unwrap_or(0),
            output_tokens: payload
                .usage_metadata
                .as_ref()
                .and_then(|u| u.candidates_token_count)
                .unwrap_or(0),
        })
    }
}

fn split_system(messages: &[LlmMessage]) -> (Option<String>, Vec<LlmMessage>) {
    let mut system_lines = Vec::new();
    let mut turns = Vec::new();
    for message in messages {
        if message.role == "system" {
            system_lines.push(message.content.clone());
        } else {
            turns.push(message.clone());
        }
    }
    let system = if system_lines.is_empty() {
        None
    } else {
        Some(system_lines.join("\n"))
    };
    (system, turns)
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiAssistantMessage,
}

#[derive(Deserialize)]
struct OpenAiAssistantMessage {
    content: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Serialize)]
struct GeminiRequest {
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
}

#[derive(Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
}

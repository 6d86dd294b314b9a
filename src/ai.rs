//! The AI collaborator: chat completions for AI steps and speech-to-text for
//! voice notes.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Map, Value};

use crate::error::AiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[async_trait]
pub trait AiClient: Send + Sync {
    /// Returns the raw assistant text.
    async fn complete(&self, system: &str, history: &[ChatTurn]) -> Result<String, AiError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        mimetype: &str,
        file_name: &str,
    ) -> Result<String, AiError>;
}

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    chat_model: String,
    transcribe_model: String,
}

impl OpenAiClient {
    pub fn new(
        http: reqwest::Client,
        api_key: String,
        base_url: String,
        chat_model: String,
        transcribe_model: String,
    ) -> Self {
        Self {
            http,
            api_key,
            base_url,
            chat_model,
            transcribe_model,
        }
    }

    async fn checked_json(response: reqwest::Response) -> Result<Value, AiError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AiError::Status { status, body });
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn complete(&self, system: &str, history: &[ChatTurn]) -> Result<String, AiError> {
        let mut messages = vec![json!({ "role": "system", "content": system })];
        messages.extend(history.iter().map(|turn| {
            json!({ "role": turn.role.as_str(), "content": turn.content })
        }));

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.chat_model,
                "messages": messages,
                "temperature": 0.2,
                "response_format": { "type": "json_object" }
            }))
            .send()
            .await?;
        let payload = Self::checked_json(response).await?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(AiError::Empty);
        }
        Ok(text)
    }
}

#[async_trait]
impl Transcriber for OpenAiClient {
    async fn transcribe(
        &self,
        audio: Vec<u8>,
        mimetype: &str,
        file_name: &str,
    ) -> Result<String, AiError> {
        let part = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str(mimetype)?;
        let form = Form::new()
            .text("model", self.transcribe_model.clone())
            .part("file", part);
        let response = self
            .http
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let payload = Self::checked_json(response).await?;
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(AiError::Empty);
        }
        Ok(text)
    }
}

/// Structured outcome of an AI step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDecision {
    pub reply: String,
    pub next_step_id: Option<String>,
    pub collected_data: Map<String, Value>,
    pub handoff: bool,
}

/// Tolerates code fences and prose around the JSON object.
pub fn parse_step_decision(raw: &str) -> Result<StepDecision, AiError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AiError::Empty);
    }

    let mut candidates = vec![trimmed.to_string()];
    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    for candidate in candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        let reply = parsed
            .get("reply")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .unwrap_or_default();
        if reply.is_empty() {
            continue;
        }
        let next_step_id = parsed
            .get("nextStepId")
            .or_else(|| parsed.get("next_step_id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty() && *id != "null")
            .map(str::to_string);
        let collected_data = parsed
            .get("collectedData")
            .or_else(|| parsed.get("collected_data"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let handoff = parsed
            .get("handoff")
            .or_else(|| parsed.get("handover"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        return Ok(StepDecision {
            reply,
            next_step_id,
            collected_data,
            handoff,
        });
    }

    Err(AiError::Malformed(
        trimmed.chars().take(200).collect::<String>(),
    ))
}

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::validation::MediaRef;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentMessage {
    /// Id the gateway assigned to the outbound message, when it reports one.
    pub gateway_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutboundFile {
    pub file_name: String,
    pub mime_type: String,
    pub url: Option<String>,
    pub base64: Option<String>,
    pub caption: Option<String>,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_text(&self, instance: &str, phone: &str, text: &str)
        -> Result<SentMessage, GatewayError>;

    async fn send_file(
        &self,
        instance: &str,
        phone: &str,
        file: &OutboundFile,
    ) -> Result<SentMessage, GatewayError>;

    async fn fetch_media(&self, media: &MediaRef) -> Result<Vec<u8>, GatewayError>;
}

pub fn chat_id_for(phone: &str) -> String {
    format!("{phone}@c.us")
}

/// REST client for the WhatsApp HTTP gateway.
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpGateway {
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url,
            api_key,
        }
    }

    fn authorised(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }

    async fn post(&self, path: &str, payload: Value) -> Result<SentMessage, GatewayError> {
        let response = self
            .authorised(self.http.post(format!("{}{path}", self.base_url)))
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body: raw_body,
            });
        }
        let body = serde_json::from_str::<Value>(&raw_body).unwrap_or(Value::Null);
        Ok(SentMessage {
            gateway_message_id: extract_message_id(&body),
        })
    }
}

/// The gateway reports ids as `id`, `id._serialized` or `key.id` depending on version.
fn extract_message_id(body: &Value) -> Option<String> {
    let id = body.get("id");
    id.and_then(Value::as_str)
        .or_else(|| id.and_then(|id| id.get("_serialized")).and_then(Value::as_str))
        .or_else(|| body.pointer("/key/id").and_then(Value::as_str))
        .map(str::to_string)
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn send_text(
        &self,
        instance: &str,
        phone: &str,
        text: &str,
    ) -> Result<SentMessage, GatewayError> {
        self.post(
            "/api/sendText",
            json!({
                "session": instance,
                "chatId": chat_id_for(phone),
                "text": text,
            }),
        )
        .await
    }

    async fn send_file(
        &self,
        instance: &str,
        phone: &str,
        file: &OutboundFile,
    ) -> Result<SentMessage, GatewayError> {
        let mut descriptor = json!({
            "mimetype": file.mime_type,
            "filename": file.file_name,
        });
        match (&file.url, &file.base64) {
            (Some(url), _) => descriptor["url"] = json!(url),
            (None, Some(data)) => descriptor["data"] = json!(data),
            (None, None) => {
                return Err(GatewayError::Payload(
                    "file needs either a url or base64 data".to_string(),
                ))
            }
        }
        let mut payload = json!({
            "session": instance,
            "chatId": chat_id_for(phone),
            "file": descriptor,
        });
        if let Some(caption) = file.caption.as_deref().filter(|c| !c.trim().is_empty()) {
            payload["caption"] = json!(caption);
        }
        self.post("/api/sendFile", payload).await
    }

    async fn fetch_media(&self, media: &MediaRef) -> Result<Vec<u8>, GatewayError> {
        let url = media
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| GatewayError::Payload("media has no download url".to_string()))?;
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        };
        let response = self.authorised(self.http.get(url)).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status { status, body });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_shapes() {
        assert_eq!(extract_message_id(&json!({ "id": "abc" })).as_deref(), Some("abc"));
        assert_eq!(
            extract_message_id(&json!({ "id": { "_serialized": "true_55@c.us_X" } })).as_deref(),
            Some("true_55@c.us_X")
        );
        assert_eq!(
            extract_message_id(&json!({ "key": { "id": "K1" } })).as_deref(),
            Some("K1")
        );
        assert_eq!(extract_message_id(&Value::Null), None);
    }

    #[test]
    fn chat_id_uses_contact_suffix() {
        assert_eq!(chat_id_for("5511999"), "5511999@c.us");
    }
}

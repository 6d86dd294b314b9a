//! Inbound webhook validation and sanitisation.
//!
//! The gateway has shipped two payload shapes over time and neither carries a
//! reliable discriminator, so the dialect is picked from the structure alone:
//! an object `payload` is the current shape, `data.key` the legacy one.

use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::MessageType;

/// A structural rejection, pointing at the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {message}")]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

const POLLUTION_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid regex"));
static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<\s*/?\s*[a-zA-Z!][^>]*>").expect("valid regex"));
static SQL_META: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--|/\*|\*/|;|\\|`").expect("valid regex"));

/// Strips control characters, script blocks, markup and SQL metacharacters.
pub fn sanitize_text(raw: &str) -> String {
    let without_control = raw
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect::<String>();
    let without_scripts = SCRIPT_BLOCK.replace_all(&without_control, "");
    let without_tags = HTML_TAG.replace_all(&without_scripts, "");
    SQL_META.replace_all(&without_tags, "").trim().to_string()
}

/// Recursively sanitises every string leaf and drops prototype-pollution keys.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(sanitize_text(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !POLLUTION_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key, sanitize_value(value)))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayDialect {
    Legacy,
    Current,
}

/// Who produced an own-device (`fromMe`) event, when the gateway says so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Api,
    Human(String),
}

impl Origin {
    fn parse(raw: Option<&str>) -> Option<Self> {
        let value = raw?.trim().to_ascii_lowercase();
        match value.as_str() {
            "" | "unknown" => None,
            "api" => Some(Self::Api),
            _ => Some(Self::Human(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: Option<String>,
    pub mimetype: String,
    pub filename: Option<String>,
}

/// A sanitised, typed inbound message event.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub dialect: GatewayDialect,
    pub event: String,
    pub instance: String,
    pub message_id: String,
    /// Customer-side chat id as the gateway spells it (`5511...@c.us`).
    pub chat_id: String,
    /// Digits-only phone of the customer side.
    pub phone: String,
    pub from_me: bool,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub is_group: bool,
    pub origin: Option<Origin>,
    pub message_type: MessageType,
    pub media: Option<MediaRef>,
    pub push_name: Option<String>,
    pub raw: Value,
}

impl InboundEvent {
    pub fn is_audio(&self) -> bool {
        self.message_type == MessageType::Audio
    }
}

#[derive(Debug, Clone)]
pub enum WebhookEnvelope {
    Message(Box<InboundEvent>),
    /// Recognised envelope carrying an event the engine does not act on.
    Other {
        dialect: GatewayDialect,
        event: String,
        instance: String,
    },
}

impl WebhookEnvelope {
    pub fn instance(&self) -> &str {
        match self {
            Self::Message(event) => &event.instance,
            Self::Other { instance, .. } => instance,
        }
    }
}

const CURRENT_MESSAGE_EVENTS: [&str; 2] = ["message", "message.any"];
const LEGACY_MESSAGE_EVENTS: [&str; 2] = ["messages.upsert", "messages_upsert"];

/// Validates and sanitises a raw webhook body into a typed envelope.
pub fn parse_webhook(raw: Value) -> Result<WebhookEnvelope, ValidationError> {
    let Value::Object(_) = raw else {
        return Err(ValidationError::new("$", "body must be a JSON object"));
    };
    let clean = sanitize_value(raw);

    if clean.get("payload").is_some_and(Value::is_object) {
        return parse_current(clean);
    }
    if clean
        .get("data")
        .and_then(|data| data.get("key"))
        .is_some_and(Value::is_object)
    {
        return parse_legacy(clean);
    }
    Err(ValidationError::new(
        "$",
        "unrecognised gateway payload shape (expected `payload` or `data.key`)",
    ))
}

/// Digits of the user part of a chat id (`5511999@c.us`, `5511999:3@s.whatsapp.net`).
pub fn normalize_phone(raw: &str) -> Option<String> {
    let user = raw.split('@').next().unwrap_or("");
    let user = user.split(':').next().unwrap_or("");
    let digits = user
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn is_group_jid(jid: &str) -> bool {
    jid.trim().ends_with("@g.us")
}

fn required_str(obj: &Value, path: &str) -> Result<String, ValidationError> {
    let value = lookup(obj, path);
    match value {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        Some(Value::String(_)) => Err(ValidationError::new(path, "must not be empty")),
        Some(_) => Err(ValidationError::new(path, "must be a string")),
        None => Err(ValidationError::new(path, "is required")),
    }
}

fn optional_str(obj: &Value, path: &str) -> Result<Option<String>, ValidationError> {
    match lookup(obj, path) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(_) => Err(ValidationError::new(path, "must be a string")),
    }
}

fn optional_bool(obj: &Value, path: &str) -> Result<Option<bool>, ValidationError> {
    match lookup(obj, path) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(_) => Err(ValidationError::new(path, "must be a boolean")),
    }
}

fn lookup<'a>(obj: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(obj, |node, key| node.get(key))
}

fn parse_timestamp(value: Option<&Value>, path: &str) -> Result<DateTime<Utc>, ValidationError> {
    let seconds = match value {
        None | Some(Value::Null) => return Ok(Utc::now()),
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64))
            .ok_or_else(|| ValidationError::new(path, "must be a unix timestamp"))?,
        Some(Value::String(text)) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| ValidationError::new(path, "must be a unix timestamp"))?,
        Some(_) => return Err(ValidationError::new(path, "must be a unix timestamp")),
    };
    let millis = if seconds > 10_000_000_000 {
        seconds
    } else {
        seconds.saturating_mul(1000)
    };
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ValidationError::new(path, "timestamp out of range"))
}

fn parse_current(clean: Value) -> Result<WebhookEnvelope, ValidationError> {
    let event = required_str(&clean, "event")?;
    let instance = required_str(&clean, "session")?;
    if !CURRENT_MESSAGE_EVENTS.contains(&event.as_str()) {
        return Ok(WebhookEnvelope::Other {
            dialect: GatewayDialect::Current,
            event,
            instance,
        });
    }

    let message_id = required_str(&clean, "payload.id")?;
    let from = required_str(&clean, "payload.from")?;
    let from_me = optional_bool(&clean, "payload.fromMe")?
        .or(optional_bool(&clean, "payload._data.Info.IsFromMe")?)
        .unwrap_or(false);
    let to = optional_str(&clean, "payload.to")?;
    let info_chat = optional_str(&clean, "payload._data.Info.Chat")?;
    let chat_id = if from_me {
        to.or(info_chat).unwrap_or_else(|| from.clone())
    } else {
        from
    };
    let phone = normalize_phone(&chat_id)
        .ok_or_else(|| ValidationError::new("payload.from", "does not contain a phone number"))?;

    let is_group = optional_bool(&clean, "payload._data.Info.IsGroup")?.unwrap_or(false)
        || is_group_jid(&chat_id);
    let body = optional_str(&clean, "payload.body")?.unwrap_or_default();
    let timestamp = parse_timestamp(lookup(&clean, "payload.timestamp"), "payload.timestamp")?;
    let origin = Origin::parse(
        optional_str(&clean, "payload.source")?
            .or(optional_str(&clean, "payload._data.source")?)
            .as_deref(),
    );
    let push_name = optional_str(&clean, "payload._data.Info.PushName")?
        .or(optional_str(&clean, "payload._data.notifyName")?)
        .filter(|name| !name.trim().is_empty());

    let has_media = optional_bool(&clean, "payload.hasMedia")?.unwrap_or(false);
    let (message_type, media) = if has_media {
        let media_type = optional_str(&clean, "payload._data.Info.MediaType")?.unwrap_or_default();
        let mimetype = optional_str(&clean, "payload.media.mimetype")?
            .or(optional_str(&clean, "payload.mimetype")?)
            .unwrap_or_else(|| match media_type.as_str() {
                "ptt" | "audio" => "audio/ogg".to_string(),
                "image" => "image/jpeg".to_string(),
                _ => "application/octet-stream".to_string(),
            });
        let media = MediaRef {
            url: optional_str(&clean, "payload.media.url")?,
            filename: optional_str(&clean, "payload.media.filename")?,
            mimetype: mimetype.clone(),
        };
        (MessageType::from_mimetype(&mimetype), Some(media))
    } else {
        (MessageType::Text, None)
    };

    Ok(WebhookEnvelope::Message(Box::new(InboundEvent {
        dialect: GatewayDialect::Current,
        event,
        instance,
        message_id,
        chat_id,
        phone,
        from_me,
        body,
        timestamp,
        is_group,
        origin,
        message_type,
        media,
        push_name,
        raw: clean,
    })))
}

const LEGACY_MEDIA_KINDS: [(&str, MessageType); 5] = [
    ("audioMessage", MessageType::Audio),
    ("imageMessage", MessageType::Image),
    ("videoMessage", MessageType::Document),
    ("documentMessage", MessageType::Document),
    ("stickerMessage", MessageType::Image),
];

fn parse_legacy(clean: Value) -> Result<WebhookEnvelope, ValidationError> {
    let event = required_str(&clean, "event")?;
    let instance = required_str(&clean, "instance")?;
    if !LEGACY_MESSAGE_EVENTS.contains(&event.to_ascii_lowercase().as_str()) {
        return Ok(WebhookEnvelope::Other {
            dialect: GatewayDialect::Legacy,
            event,
            instance,
        });
    }

    let message_id = required_str(&clean, "data.key.id")?;
    let chat_id = required_str(&clean, "data.key.remoteJid")?;
    let from_me = optional_bool(&clean, "data.key.fromMe")?.unwrap_or(false);
    let phone = normalize_phone(&chat_id).ok_or_else(|| {
        ValidationError::new("data.key.remoteJid", "does not contain a phone number")
    })?;
    let is_group = is_group_jid(&chat_id);
    let timestamp = parse_timestamp(lookup(&clean, "data.messageTimestamp"), "data.messageTimestamp")?;
    let origin = Origin::parse(optional_str(&clean, "data.source")?.as_deref());
    let push_name = optional_str(&clean, "data.pushName")?.filter(|name| !name.trim().is_empty());

    let message = lookup(&clean, "data.message").cloned().unwrap_or(Value::Null);
    let mut body = optional_str(&message, "conversation")?
        .or(optional_str(&message, "extendedTextMessage.text")?)
        .unwrap_or_default();

    let mut message_type = MessageType::Text;
    let mut media = None;
    for (kind, kind_type) in LEGACY_MEDIA_KINDS {
        let Some(node) = message.get(kind).filter(|node| node.is_object()) else {
            continue;
        };
        let mimetype = optional_str(node, "mimetype")?.unwrap_or_else(|| match kind_type {
            MessageType::Audio => "audio/ogg".to_string(),
            MessageType::Image => "image/jpeg".to_string(),
            _ => "application/octet-stream".to_string(),
        });
        if body.is_empty() {
            body = optional_str(node, "caption")?.unwrap_or_default();
        }
        message_type = kind_type;
        media = Some(MediaRef {
            url: optional_str(node, "url")?,
            mimetype,
            filename: optional_str(node, "fileName")?,
        });
        break;
    }

    Ok(WebhookEnvelope::Message(Box::new(InboundEvent {
        dialect: GatewayDialect::Legacy,
        event,
        instance,
        message_id,
        chat_id,
        phone,
        from_me,
        body,
        timestamp,
        is_group,
        origin,
        message_type,
        media,
        push_name,
        raw: clean,
    })))
}

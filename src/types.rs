use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeadStatus {
    New,
    InProgress,
    AwaitingDocuments,
    Forwarded,
    TransferredToHuman,
    Completed,
    Cancelled,
}

impl LeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::InProgress => "in-progress",
            Self::AwaitingDocuments => "awaiting-documents",
            Self::Forwarded => "forwarded",
            Self::TransferredToHuman => "transferred-to-human",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "new" => Ok(Self::New),
            "in-progress" => Ok(Self::InProgress),
            "awaiting-documents" => Ok(Self::AwaitingDocuments),
            "forwarded" => Ok(Self::Forwarded),
            "transferred-to-human" => Ok(Self::TransferredToHuman),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown lead status '{other}'")),
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer record. Created on the first inbound message from an unknown phone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
    pub cpf: Option<String>,
    pub protocol: String,
    pub status: LeadStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Closed,
    Transferred,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Transferred => "transferred",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            "transferred" => Ok(Self::Transferred),
            other => Err(format!("unknown conversation status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub lead_id: String,
    pub instance: String,
    pub status: ConversationStatus,
    pub current_step_id: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_open(&self) -> bool {
        self.status != ConversationStatus::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Document,
    Audio,
    System,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::System => "system",
        }
    }

    /// Classifies an attachment by its mimetype.
    pub fn from_mimetype(mimetype: &str) -> Self {
        let mime = mimetype.trim().to_ascii_lowercase();
        if mime.starts_with("audio/") {
            Self::Audio
        } else if mime.starts_with("image/") {
            Self::Image
        } else {
            Self::Document
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "document" => Ok(Self::Document),
            "audio" => Ok(Self::Audio),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub is_bot: bool,
    pub message_type: MessageType,
    #[serde(default)]
    pub metadata: Value,
    /// Gateway message id for inbound events; unique per store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: &str,
        content: &str,
        is_bot: bool,
        message_type: MessageType,
        metadata: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            is_bot,
            message_type,
            metadata,
            external_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(conversation_id: &str, content: &str, metadata: Value) -> Self {
        Self::new(conversation_id, content, true, MessageType::System, metadata)
    }
}

/// Messages a customer is allowed to see; internal annotations are dropped.
pub fn customer_transcript(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|message| message.message_type != MessageType::System)
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotState {
    pub conversation_id: String,
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub collected_data: Map<String, Value>,
    pub is_permanent_handoff: bool,
    pub handoff_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ChatbotState {
    pub fn new(conversation_id: &str, current_step_id: Option<String>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            current_step_id,
            collected_data: Map::new(),
            is_permanent_handoff: false,
            handoff_until: None,
            updated_at: Utc::now(),
        }
    }
}

/// A step-authored tag mutation.
///
/// `Unset` means the author never touched the directive, `NoChange` means the
/// author explicitly chose "no change". Both leave the lead untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TagChange<T> {
    #[default]
    Unset,
    NoChange,
    Set(T),
}

pub const NO_CHANGE_SENTINEL: &str = "no-change";

impl<T: Copy> TagChange<T> {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    pub fn value(&self) -> Option<T> {
        match self {
            Self::Set(value) => Some(*value),
            _ => None,
        }
    }
}

impl<T: FromStr<Err = String> + Copy> TagChange<T> {
    /// Decodes the persisted column form: NULL, the sentinel, or a value.
    pub fn from_column(raw: Option<&str>) -> Result<Self, String> {
        match raw.map(str::trim) {
            None => Ok(Self::Unset),
            Some("") | Some(NO_CHANGE_SENTINEL) => Ok(Self::NoChange),
            Some(value) => value.parse::<T>().map(Self::Set),
        }
    }
}

impl<T: fmt::Display + Copy> TagChange<T> {
    pub fn to_column(&self) -> Option<String> {
        match self {
            Self::Unset => None,
            Self::NoChange => Some(NO_CHANGE_SENTINEL.to_string()),
            Self::Set(value) => Some(value.to_string()),
        }
    }
}

impl<T: Serialize> Serialize for TagChange<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unset | Self::NoChange => serializer.serialize_none(),
            Self::Set(value) => value.serialize(serializer),
        }
    }
}

impl<'de, T: serde::de::DeserializeOwned> Deserialize<'de> for TagChange<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        match &raw {
            Value::Null => Ok(Self::NoChange),
            Value::String(text) if text.trim().is_empty() || text.trim() == NO_CHANGE_SENTINEL => {
                Ok(Self::NoChange)
            }
            _ => serde_json::from_value::<T>(raw)
                .map(Self::Set)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Fixed,
    Ai,
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Ai => "ai",
        }
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "ai" => Ok(Self::Ai),
            other => Err(format!("unknown step type '{other}'")),
        }
    }
}

/// What a step says. Fixed steps are an ordered script, AI steps a free prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepBody {
    Fixed(Vec<String>),
    Ai(String),
}

impl StepBody {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Fixed(_) => StepType::Fixed,
            Self::Ai(_) => StepType::Ai,
        }
    }

    /// Builds a body from editor input. A fixed step may arrive as an array of
    /// lines, a JSON-encoded array, or a single plain line.
    pub fn from_input(step_type: StepType, prompt: &Value) -> Result<Self, String> {
        match step_type {
            StepType::Ai => match prompt {
                Value::String(text) => Ok(Self::Ai(text.clone())),
                Value::Null => Ok(Self::Ai(String::new())),
                other => Err(format!("ai step prompt must be text, got {other}")),
            },
            StepType::Fixed => {
                let lines = match prompt {
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::String(text) => Ok(text.clone()),
                            other => Err(format!("fixed step lines must be text, got {other}")),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    Value::String(text) => Self::decode_fixed(text),
                    Value::Null => Vec::new(),
                    other => return Err(format!("fixed step prompt must be a list, got {other}")),
                };
                Ok(Self::Fixed(
                    lines
                        .into_iter()
                        .map(|line| line.trim().to_string())
                        .filter(|line| !line.is_empty())
                        .collect(),
                ))
            }
        }
    }

    /// Decodes the persisted prompt column.
    pub fn from_column(step_type: StepType, raw: &str) -> Self {
        match step_type {
            StepType::Ai => Self::Ai(raw.to_string()),
            StepType::Fixed => Self::Fixed(Self::decode_fixed(raw)),
        }
    }

    /// Encodes the persisted prompt column. Fixed steps always become a JSON array.
    pub fn to_column(&self) -> String {
        match self {
            Self::Ai(text) => text.clone(),
            Self::Fixed(lines) => serde_json::to_string(lines).unwrap_or_else(|_| "[]".to_string()),
        }
    }

    fn decode_fixed(raw: &str) -> Vec<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Vec<String>>(trimmed) {
            Ok(lines) => lines,
            Err(_) => vec![trimmed.to_string()],
        }
    }

    fn prompt_value(&self) -> Value {
        match self {
            Self::Ai(text) => Value::String(text.clone()),
            Self::Fixed(lines) => Value::from(lines.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub label: String,
    pub target_step_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasPosition {
    pub x: f64,
    pub y: f64,
}

impl Default for CanvasPosition {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "FlowStepWire", into = "FlowStepWire")]
pub struct FlowStep {
    pub id: String,
    pub name: String,
    pub objective: String,
    pub body: StepBody,
    pub routing_instructions: String,
    pub transitions: Vec<Transition>,
    pub buffer_seconds: Option<u32>,
    pub change_status_to: TagChange<LeadStatus>,
    pub change_priority_to: TagChange<Priority>,
    pub position: CanvasPosition,
}

/// Editor/API shape of a step: the body travels as `stepType` + `prompt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlowStepWire {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    objective: String,
    step_type: StepType,
    #[serde(default)]
    prompt: Value,
    #[serde(default)]
    routing_instructions: String,
    #[serde(default)]
    transitions: Vec<Transition>,
    #[serde(default)]
    buffer_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "TagChange::is_unset")]
    change_status_to: TagChange<LeadStatus>,
    #[serde(default, skip_serializing_if = "TagChange::is_unset")]
    change_priority_to: TagChange<Priority>,
    #[serde(default)]
    position: CanvasPosition,
}

impl TryFrom<FlowStepWire> for FlowStep {
    type Error = String;

    fn try_from(wire: FlowStepWire) -> Result<Self, Self::Error> {
        let body = StepBody::from_input(wire.step_type, &wire.prompt)?;
        Ok(Self {
            id: wire.id,
            name: wire.name,
            objective: wire.objective,
            body,
            routing_instructions: wire.routing_instructions,
            transitions: wire.transitions,
            buffer_seconds: wire.buffer_seconds,
            change_status_to: wire.change_status_to,
            change_priority_to: wire.change_priority_to,
            position: wire.position,
        })
    }
}

impl From<FlowStep> for FlowStepWire {
    fn from(step: FlowStep) -> Self {
        Self {
            step_type: step.body.step_type(),
            prompt: step.body.prompt_value(),
            id: step.id,
            name: step.name,
            objective: step.objective,
            routing_instructions: step.routing_instructions,
            transitions: step.transitions,
            buffer_seconds: step.buffer_seconds,
            change_status_to: step.change_status_to,
            change_priority_to: step.change_priority_to,
            position: step.position,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordRule {
    #[serde(default)]
    pub id: String,
    /// Restricts the rule to one step; `None` applies it everywhere.
    #[serde(default)]
    pub step_id: Option<String>,
    pub keyword: String,
    pub target_step_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfig {
    pub id: String,
    pub name: String,
    pub version: i32,
    #[serde(default)]
    pub global_prompt: String,
    pub active: bool,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
    #[serde(default)]
    pub keywords: Vec<KeywordRule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowConfig {
    pub fn step(&self, step_id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    pub fn has_step(&self, step_id: &str) -> bool {
        self.step(step_id).is_some()
    }

    pub fn start_step(&self) -> Option<&FlowStep> {
        self.steps.first()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendTextBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFileBody {
    pub file_name: String,
    pub mime_type: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub base64: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffBody {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchLeadBody {
    pub status: Option<LeadStatus>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearLeadsBody {
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlowBody {
    pub name: String,
    #[serde(default)]
    pub global_prompt: String,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
    #[serde(default)]
    pub keywords: Vec<KeywordRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFlowBody {
    pub name: Option<String>,
    pub global_prompt: Option<String>,
}

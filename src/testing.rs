//! Test doubles shared by the engine and HTTP tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::ai::{AiClient, ChatTurn, Transcriber};
use crate::config::Config;
use crate::error::{AiError, GatewayError, StoreError};
use crate::gateway::{Gateway, OutboundFile, SentMessage};
use crate::memory_store::MemoryStore;
use crate::store::{Store, StoreResult};
use crate::types::{
    CanvasPosition, ChatbotState, Conversation, ConversationStatus, FlowConfig, FlowStep,
    KeywordRule, Lead, LeadStatus, Message, Priority, StepBody, TagChange, Transition,
};
use crate::validation::MediaRef;

pub const TEST_SECRET: &str = "test-secret";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub instance: String,
    pub phone: String,
    pub text: String,
}

/// Records every outbound call. Can be switched to fail.
#[derive(Default)]
pub struct RecordingGateway {
    texts: Mutex<Vec<SentText>>,
    files: Mutex<Vec<(String, String)>>,
    failing: Mutex<bool>,
    counter: Mutex<u64>,
}

impl RecordingGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_sends(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn texts(&self) -> Vec<SentText> {
        self.texts.lock().unwrap().clone()
    }

    pub fn sent_bodies(&self) -> Vec<String> {
        self.texts().into_iter().map(|sent| sent.text).collect()
    }

    pub fn files(&self) -> Vec<(String, String)> {
        self.files.lock().unwrap().clone()
    }

    fn next_id(&self) -> String {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        format!("out-{counter}")
    }

    fn check(&self) -> Result<(), GatewayError> {
        if *self.failing.lock().unwrap() {
            return Err(GatewayError::Status {
                status: 503,
                body: "gateway down".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn send_text(
        &self,
        instance: &str,
        phone: &str,
        text: &str,
    ) -> Result<SentMessage, GatewayError> {
        self.check()?;
        self.texts.lock().unwrap().push(SentText {
            instance: instance.into(),
            phone: phone.into(),
            text: text.into(),
        });
        Ok(SentMessage {
            gateway_message_id: Some(self.next_id()),
        })
    }

    async fn send_file(
        &self,
        _instance: &str,
        phone: &str,
        file: &OutboundFile,
    ) -> Result<SentMessage, GatewayError> {
        self.check()?;
        self.files
            .lock()
            .unwrap()
            .push((phone.to_string(), file.file_name.clone()));
        Ok(SentMessage {
            gateway_message_id: Some(self.next_id()),
        })
    }

    async fn fetch_media(&self, _media: &MediaRef) -> Result<Vec<u8>, GatewayError> {
        self.check()?;
        Ok(vec![0u8; 16])
    }
}

/// Replays queued completions in order; an exhausted queue is an error.
#[derive(Default)]
pub struct ScriptedAi {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<(String, Vec<ChatTurn>)>>,
}

impl ScriptedAi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_reply(&self, raw: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(raw.into()));
    }

    pub fn push_decision(&self, decision: Value) {
        self.push_reply(decision.to_string());
    }

    pub fn push_failure(&self) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err("upstream unavailable".into()));
    }

    pub fn calls(&self) -> Vec<(String, Vec<ChatTurn>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiClient for ScriptedAi {
    async fn complete(&self, system: &str, history: &[ChatTurn]) -> Result<String, AiError> {
        self.calls
            .lock()
            .unwrap()
            .push((system.to_string(), history.to_vec()));
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(raw)) => Ok(raw),
            Some(Err(body)) => Err(AiError::Status { status: 503, body }),
            None => Err(AiError::Empty),
        }
    }
}

/// A [`MemoryStore`] whose next customer message inserts fail like a dropped
/// database connection.
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    inbound_failures: Mutex<usize>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            inbound_failures: Mutex::new(0),
        })
    }

    pub fn fail_inbound_inserts(&self, count: usize) {
        *self.inbound_failures.lock().unwrap() = count;
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn find_lead_by_phone(&self, phone: &str) -> StoreResult<Option<Lead>> {
        self.inner.find_lead_by_phone(phone).await
    }

    async fn get_lead(&self, lead_id: &str) -> StoreResult<Option<Lead>> {
        self.inner.get_lead(lead_id).await
    }

    async fn max_protocol_suffix(&self, year: i32) -> StoreResult<u32> {
        self.inner.max_protocol_suffix(year).await
    }

    async fn insert_lead(&self, lead: &Lead) -> StoreResult<()> {
        self.inner.insert_lead(lead).await
    }

    async fn update_lead_tags(
        &self,
        lead_id: &str,
        status: Option<LeadStatus>,
        priority: Option<Priority>,
    ) -> StoreResult<Lead> {
        self.inner.update_lead_tags(lead_id, status, priority).await
    }

    async fn update_lead_name(&self, lead_id: &str, name: &str) -> StoreResult<()> {
        self.inner.update_lead_name(lead_id, name).await
    }

    async fn clear_leads(&self) -> StoreResult<u64> {
        self.inner.clear_leads().await
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        self.inner.get_conversation(conversation_id).await
    }

    async fn find_open_conversation(&self, lead_id: &str) -> StoreResult<Option<Conversation>> {
        self.inner.find_open_conversation(lead_id).await
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        self.inner.insert_conversation(conversation).await
    }

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.touch_conversation(conversation_id, at).await
    }

    async fn advance_conversation(
        &self,
        conversation_id: &str,
        step_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        self.inner.advance_conversation(conversation_id, step_id, at).await
    }

    async fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        self.inner.set_conversation_status(conversation_id, status, at).await
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        if !message.is_bot {
            let mut remaining = self.inbound_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
        }
        self.inner.insert_message(message).await
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        self.inner.list_messages(conversation_id).await
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> StoreResult<Vec<Message>> {
        self.inner.recent_messages(conversation_id, limit).await
    }

    async fn get_state(&self, conversation_id: &str) -> StoreResult<Option<ChatbotState>> {
        self.inner.get_state(conversation_id).await
    }

    async fn save_progress(
        &self,
        conversation_id: &str,
        step_id: Option<&str>,
        collected_data: &Map<String, Value>,
    ) -> StoreResult<()> {
        self.inner.save_progress(conversation_id, step_id, collected_data).await
    }

    async fn upsert_handoff(
        &self,
        conversation_id: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        self.inner.upsert_handoff(conversation_id, permanent, until).await
    }

    async fn set_handoff(
        &self,
        conversation_id: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        self.inner.set_handoff(conversation_id, permanent, until).await
    }

    async fn suspended_states(&self) -> StoreResult<Vec<ChatbotState>> {
        self.inner.suspended_states().await
    }

    async fn list_flows(&self) -> StoreResult<Vec<FlowConfig>> {
        self.inner.list_flows().await
    }

    async fn get_flow(&self, flow_id: &str) -> StoreResult<Option<FlowConfig>> {
        self.inner.get_flow(flow_id).await
    }

    async fn active_flow(&self) -> StoreResult<Option<FlowConfig>> {
        self.inner.active_flow().await
    }

    async fn save_flow(&self, flow: &FlowConfig) -> StoreResult<()> {
        self.inner.save_flow(flow).await
    }

    async fn activate_flow(&self, flow_id: &str) -> StoreResult<FlowConfig> {
        self.inner.activate_flow(flow_id).await
    }
}

pub struct StubTranscriber {
    result: Mutex<Option<String>>,
}

impl StubTranscriber {
    pub fn returning(text: &str) -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(Some(text.to_string())),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
        })
    }

    pub fn set(&self, text: Option<&str>) {
        *self.result.lock().unwrap() = text.map(str::to_string);
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(
        &self,
        _audio: Vec<u8>,
        _mimetype: &str,
        _file_name: &str,
    ) -> Result<String, AiError> {
        self.result.lock().unwrap().clone().ok_or(AiError::Empty)
    }
}

/// Memory-store config with instant pacing and a 5s default buffer.
pub fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut pairs = vec![
        ("WEBHOOK_SECRET", TEST_SECRET),
        ("GATEWAY_BASE_URL", "http://gateway.test"),
        ("OPENAI_API_KEY", "sk-test"),
        ("DATABASE_URL", "memory://"),
        ("GATEWAY_INSTANCES", "default"),
        ("DISABLED_INSTANCES", "paused"),
        ("FIXED_PACING_MIN_MS", "0"),
        ("FIXED_PACING_MAX_MS", "0"),
    ];
    pairs.extend_from_slice(extra);
    let pairs = pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<Vec<_>>();
    Config::from_lookup(move |name| {
        pairs
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    })
    .expect("test config")
}

pub fn fixed_step(id: &str, lines: &[&str], targets: &[&str]) -> FlowStep {
    step(
        id,
        StepBody::Fixed(lines.iter().map(|line| line.to_string()).collect()),
        targets,
    )
}

pub fn ai_step(id: &str, prompt: &str, targets: &[&str]) -> FlowStep {
    step(id, StepBody::Ai(prompt.to_string()), targets)
}

fn step(id: &str, body: StepBody, targets: &[&str]) -> FlowStep {
    FlowStep {
        id: id.to_string(),
        name: id.to_string(),
        objective: String::new(),
        body,
        routing_instructions: String::new(),
        transitions: targets
            .iter()
            .map(|target| Transition {
                label: format!("to {target}"),
                target_step_id: target.to_string(),
            })
            .collect(),
        buffer_seconds: None,
        change_status_to: TagChange::Unset,
        change_priority_to: TagChange::Unset,
        position: CanvasPosition::default(),
    }
}

pub fn keyword(step_id: Option<&str>, keyword: &str, target: &str) -> KeywordRule {
    KeywordRule {
        id: format!("kw-{keyword}"),
        step_id: step_id.map(str::to_string),
        keyword: keyword.to_string(),
        target_step_id: target.to_string(),
    }
}

pub fn flow(id: &str, steps: Vec<FlowStep>, keywords: Vec<KeywordRule>) -> FlowConfig {
    let now = Utc::now();
    FlowConfig {
        id: id.to_string(),
        name: format!("Flow {id}"),
        version: 1,
        global_prompt: "Você é a assistente virtual da corretora.".to_string(),
        active: true,
        steps,
        keywords,
        created_at: now,
        updated_at: now,
    }
}

/// Current-dialect message event from a customer.
pub fn customer_payload(id: &str, phone: &str, body: &str) -> Value {
    json!({
        "event": "message",
        "session": "default",
        "payload": {
            "id": id,
            "from": format!("{phone}@c.us"),
            "fromMe": false,
            "body": body,
            "timestamp": Utc::now().timestamp(),
            "hasMedia": false,
            "_data": { "Info": { "IsGroup": false, "PushName": "Maria" } }
        }
    })
}

/// Own-device event; `source` mirrors the gateway's origin tag.
pub fn own_device_payload(id: &str, phone: &str, body: &str, source: Option<&str>) -> Value {
    let mut value = json!({
        "event": "message.any",
        "session": "default",
        "payload": {
            "id": id,
            "from": "5511000000000@c.us",
            "to": format!("{phone}@c.us"),
            "fromMe": true,
            "body": body,
            "timestamp": Utc::now().timestamp(),
            "hasMedia": false,
            "_data": { "Info": { "IsGroup": false, "IsFromMe": true } }
        }
    });
    if let Some(source) = source {
        value["payload"]["source"] = json!(source);
    }
    value
}

pub fn audio_payload(id: &str, phone: &str) -> Value {
    json!({
        "event": "message",
        "session": "default",
        "payload": {
            "id": id,
            "from": format!("{phone}@c.us"),
            "fromMe": false,
            "body": "",
            "timestamp": Utc::now().timestamp(),
            "hasMedia": true,
            "media": { "url": "/files/voice.ogg", "mimetype": "audio/ogg; codecs=opus" },
            "_data": { "Info": { "IsGroup": false } }
        }
    })
}

pub fn group_payload(id: &str) -> Value {
    json!({
        "event": "message",
        "session": "default",
        "payload": {
            "id": id,
            "from": "120363025@g.us",
            "fromMe": false,
            "body": "bom dia grupo",
            "timestamp": Utc::now().timestamp(),
            "_data": { "Info": { "IsGroup": true } }
        }
    })
}

//! Ingestion pipeline and agent-side actions.
//!
//! Webhook events pass instance check, classification, rate limiting and
//! dedup before touching the store. Customer text then waits in the
//! per-conversation buffer; the flush re-checks the hand-off guard and runs
//! the flow engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::ai::{AiClient, Transcriber};
use crate::buffer::{FlushHandler, MessageBuffer};
use crate::classifier::{
    Classification, ContentWindowEcho, EchoStrategy, OutboundLog, RequireOrigin, SenderClassifier,
};
use crate::config::{Config, EchoStrategyKind};
use crate::dedup::{DedupCache, DedupVerdict};
use crate::error::{AppError, StoreError};
use crate::flow::{BufferWindow, FlowEngine, FlowSettings};
use crate::gateway::{Gateway, OutboundFile};
use crate::handoff::HandoffGuard;
use crate::ratelimit::RateLimiter;
use crate::realtime::{self, Realtime};
use crate::resolver::{ConversationResolver, Resolved};
use crate::store::Store;
use crate::types::{
    Conversation, ConversationStatus, Lead, LeadStatus, Message, MessageType, Priority,
    SendFileBody,
};
use crate::validation::{normalize_phone, InboundEvent, WebhookEnvelope};

pub const AUDIO_APOLOGY: &str =
    "Desculpe, não consegui entender o seu áudio. Pode me enviar a mensagem por texto?";
const HUMAN_TAKEOVER_NOTE: &str = "Human agent took over the conversation";
const MANUAL_HANDOFF_NOTE: &str = "Automated replies suspended from the dashboard";
const RELEASE_NOTE: &str = "Automated replies resumed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Processed,
    Ignored,
}

/// Body of every 200 webhook response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub status: IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl IngestOutcome {
    pub fn processed() -> Self {
        Self {
            status: IngestStatus::Processed,
            reason: None,
        }
    }

    pub fn processed_because(reason: &'static str) -> Self {
        Self {
            status: IngestStatus::Processed,
            reason: Some(reason),
        }
    }

    pub fn ignored(reason: &'static str) -> Self {
        Self {
            status: IngestStatus::Ignored,
            reason: Some(reason),
        }
    }
}

/// External services the orchestrator talks to.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub gateway: Arc<dyn Gateway>,
    pub ai: Arc<dyn AiClient>,
    pub transcriber: Arc<dyn Transcriber>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    gateway: Arc<dyn Gateway>,
    transcriber: Arc<dyn Transcriber>,
    dedup: DedupCache,
    classifier: SenderClassifier,
    outbound: Arc<OutboundLog>,
    rate_limiter: RateLimiter,
    handoff: Arc<HandoffGuard>,
    resolver: ConversationResolver,
    buffer: MessageBuffer,
    flow: FlowEngine,
    realtime: Arc<Realtime>,
}

pub fn echo_strategy(config: &Config) -> Arc<dyn EchoStrategy> {
    match config.echo_strategy {
        EchoStrategyKind::Heuristic => Arc::new(ContentWindowEcho {
            window: config.echo_window,
            history: config.echo_history,
        }),
        EchoStrategyKind::RequireOrigin => Arc::new(RequireOrigin),
    }
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, deps: Collaborators, realtime: Arc<Realtime>) -> Arc<Self> {
        let handoff = Arc::new(HandoffGuard::new(deps.store.clone()));
        let outbound = Arc::new(OutboundLog::new(config.echo_window, config.echo_history));
        let flow = FlowEngine::new(
            deps.store.clone(),
            deps.gateway.clone(),
            deps.ai,
            handoff.clone(),
            outbound.clone(),
            realtime.clone(),
            FlowSettings {
                pacing_min: Duration::from_millis(config.pacing_min_ms),
                pacing_max: Duration::from_millis(config.pacing_max_ms),
                history_limit: config.history_limit,
                default_buffer_seconds: config.default_buffer_seconds,
            },
        );
        Arc::new(Self {
            dedup: DedupCache::new(config.dedup_capacity),
            classifier: SenderClassifier::new(echo_strategy(&config)),
            outbound,
            rate_limiter: RateLimiter::per_minute(config.rate_limit_per_minute),
            resolver: ConversationResolver::new(deps.store.clone()),
            buffer: MessageBuffer::new(),
            store: deps.store,
            gateway: deps.gateway,
            transcriber: deps.transcriber,
            handoff,
            flow,
            realtime,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn handoff(&self) -> &Arc<HandoffGuard> {
        &self.handoff
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn realtime(&self) -> &Arc<Realtime> {
        &self.realtime
    }

    pub fn outbound(&self) -> &Arc<OutboundLog> {
        &self.outbound
    }

    pub async fn ingest(self: &Arc<Self>, envelope: WebhookEnvelope) -> Result<IngestOutcome, AppError> {
        let instance = envelope.instance().to_string();
        if !self.config.is_known_instance(&instance) {
            return Err(AppError::UnknownInstance(instance));
        }
        if self.config.is_disabled_instance(&instance) {
            tracing::debug!(%instance, "event for disabled instance ignored");
            return Ok(IngestOutcome::ignored("instance-disabled"));
        }
        let event = match envelope {
            WebhookEnvelope::Message(event) => event,
            WebhookEnvelope::Other { event, dialect, .. } => {
                tracing::debug!(%instance, %event, ?dialect, "unsupported event acknowledged");
                return Ok(IngestOutcome::ignored("unsupported-event"));
            }
        };

        let first_pass = self.classifier.classify(&event);
        if first_pass == Classification::Group {
            tracing::debug!(message_id = %event.message_id, "group message ignored");
            return Ok(IngestOutcome::ignored("group-message-not-supported"));
        }
        if !event.from_me && !self.rate_limiter.check(&event.phone) {
            tracing::warn!(phone = %event.phone, "customer rate limit exceeded");
            return Err(AppError::RateLimited);
        }

        let verdict = self.dedup.admit(&event.message_id, event.is_audio());
        if !verdict.should_process() {
            tracing::debug!(message_id = %event.message_id, "duplicate delivery ignored");
            return Ok(IngestOutcome::ignored("duplicate-message"));
        }
        if verdict == DedupVerdict::AudioRetry {
            tracing::info!(message_id = %event.message_id, "audio redelivery retrying transcription");
        }

        let outcome = self.process(&event, first_pass).await;
        if let Err(error) = &outcome {
            // Processing is idempotent per message id, so the gateway retry is let through.
            self.dedup.forget(&event.message_id);
            tracing::warn!(message_id = %event.message_id, %error, "event failed; redelivery will be accepted");
        }
        outcome
    }

    async fn process(
        self: &Arc<Self>,
        event: &InboundEvent,
        first_pass: Classification,
    ) -> Result<IngestOutcome, AppError> {
        let classification = match first_pass {
            Classification::Ambiguous => self.settle_ambiguous(event).await?,
            other => other,
        };
        tracing::debug!(
            message_id = %event.message_id,
            ?classification,
            strategy = self.classifier.strategy_name(),
            "sender classified"
        );
        match classification {
            Classification::HumanAgent => self.record_human_intervention(event).await,
            Classification::Customer => self.accept_customer_message(event).await,
            other => Ok(IngestOutcome::ignored(
                other.ignore_reason().unwrap_or("unsupported-event"),
            )),
        }
    }

    async fn settle_ambiguous(&self, event: &InboundEvent) -> Result<Classification, AppError> {
        let window = self.classifier.history_window();
        if window == 0 {
            return Ok(self.classifier.settle(event, &[]));
        }
        let (conversation_id, mut recent) = match self.resolver.lookup(&event.phone).await? {
            Some((_, conversation)) => {
                let recent = self.store.recent_messages(&conversation.id, window).await?;
                (conversation.id, recent)
            }
            None => (String::new(), Vec::new()),
        };
        // Sends still awaiting their gateway reply have no row yet.
        recent.extend(self.outbound.recent(&event.phone, &conversation_id));
        Ok(self.classifier.settle(event, &recent))
    }

    async fn record_human_intervention(&self, event: &InboundEvent) -> Result<IngestOutcome, AppError> {
        let Resolved { conversation, .. } =
            self.resolver.resolve(&event.phone, &event.instance, None).await?;
        let conversation_id = conversation.id.clone();

        self.handoff.set_permanent(&conversation_id).await?;
        self.buffer.cancel(&conversation_id);

        let mut message = Message::new(
            &conversation_id,
            &event.body,
            true,
            event.message_type,
            json!({
                "humanAgent": true,
                "origin": origin_label(event),
                "dialect": event.dialect,
            }),
        );
        message.external_id = Some(event.message_id.clone());
        message.created_at = event.timestamp;
        match self.store.insert_message(&message).await {
            Ok(()) => {
                self.realtime
                    .emit(realtime::MESSAGE_NEW, Some(&conversation_id), &message)
                    .await;
            }
            Err(StoreError::Conflict(_)) => {
                tracing::debug!(message_id = %event.message_id, "human message already recorded");
            }
            Err(error) => return Err(error.into()),
        }

        let note = Message::system(
            &conversation_id,
            HUMAN_TAKEOVER_NOTE,
            json!({ "handoff": "permanent", "reason": "human-intervention" }),
        );
        self.store.insert_message(&note).await?;

        let conversation = self
            .store
            .set_conversation_status(&conversation_id, ConversationStatus::Transferred, Utc::now())
            .await?;

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %event.message_id,
            "human intervention detected"
        );
        self.emit_handoff(&conversation, true, None).await;
        Ok(IngestOutcome::processed_because("human-intervention"))
    }

    async fn accept_customer_message(
        self: &Arc<Self>,
        event: &InboundEvent,
    ) -> Result<IngestOutcome, AppError> {
        let Resolved {
            lead, conversation, ..
        } = self
            .resolver
            .resolve(&event.phone, &event.instance, event.push_name.as_deref())
            .await?;
        let conversation_id = conversation.id.clone();

        let mut metadata = Map::new();
        metadata.insert("dialect".into(), json!(event.dialect));
        if let Some(name) = &event.push_name {
            metadata.insert("pushName".into(), json!(name));
        }
        if let Some(media) = &event.media {
            metadata.insert("media".into(), json!(media));
        }

        let text = if event.is_audio() {
            match self.transcribe(event).await {
                Some(transcript) => {
                    self.dedup.transcribed(&event.message_id);
                    metadata.insert("transcribed".into(), Value::Bool(true));
                    transcript
                }
                None => {
                    self.apologise_for_audio(&conversation, &lead).await?;
                    return Ok(IngestOutcome::processed_because("transcription-failed"));
                }
            }
        } else {
            event.body.trim().to_string()
        };

        let mut message = Message::new(
            &conversation_id,
            &text,
            false,
            event.message_type,
            Value::Object(metadata),
        );
        message.external_id = Some(event.message_id.clone());
        message.created_at = event.timestamp;
        match self.store.insert_message(&message).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                tracing::debug!(message_id = %event.message_id, "message id already stored");
                return Ok(IngestOutcome::ignored("duplicate-message"));
            }
            Err(error) => return Err(error.into()),
        }
        self.store.touch_conversation(&conversation_id, Utc::now()).await?;
        self.realtime
            .emit(realtime::MESSAGE_NEW, Some(&conversation_id), &message)
            .await;

        if self.handoff.is_suspended(&conversation_id).await {
            tracing::info!(conversation_id = %conversation_id, "hand-off active; reply suppressed");
            return Ok(IngestOutcome::ignored("handoff-active"));
        }
        if text.is_empty() {
            return Ok(IngestOutcome::processed());
        }

        let handler: Arc<dyn FlushHandler> = self.clone();
        self.buffer.push(&conversation_id, text, handler);
        Ok(IngestOutcome::processed())
    }

    async fn transcribe(&self, event: &InboundEvent) -> Option<String> {
        let media = event.media.as_ref()?;
        let audio = match self.gateway.fetch_media(media).await {
            Ok(audio) => audio,
            Err(error) => {
                tracing::warn!(message_id = %event.message_id, %error, "voice note download failed");
                return None;
            }
        };
        let file_name = media
            .filename
            .clone()
            .unwrap_or_else(|| format!("{}.ogg", event.message_id));
        let mimetype = media
            .mimetype
            .split_whitespace()
            .next()
            .unwrap_or("audio/ogg");
        match self.transcriber.transcribe(audio, mimetype, &file_name).await {
            Ok(text) => Some(text),
            Err(error) => {
                tracing::warn!(message_id = %event.message_id, %error, "transcription failed");
                None
            }
        }
    }

    async fn apologise_for_audio(&self, conversation: &Conversation, lead: &Lead) -> Result<(), AppError> {
        self.outbound.note(&lead.phone, AUDIO_APOLOGY);
        let metadata = match self
            .gateway
            .send_text(&conversation.instance, &lead.phone, AUDIO_APOLOGY)
            .await
        {
            Ok(sent) => json!({ "audioFallback": true, "gatewayMessageId": sent.gateway_message_id }),
            Err(error) => {
                tracing::warn!(conversation_id = %conversation.id, %error, "apology send failed");
                json!({ "audioFallback": true, "deliveryFailed": true })
            }
        };
        let message = Message::new(&conversation.id, AUDIO_APOLOGY, true, MessageType::Text, metadata);
        self.store.insert_message(&message).await?;
        self.realtime
            .emit(realtime::MESSAGE_NEW, Some(&conversation.id), &message)
            .await;
        Ok(())
    }

    async fn emit_handoff(
        &self,
        conversation: &Conversation,
        permanent: bool,
        until: Option<chrono::DateTime<Utc>>,
    ) {
        self.realtime
            .emit(
                realtime::HANDOFF_CHANGED,
                Some(&conversation.id),
                json!({
                    "conversationId": conversation.id,
                    "permanent": permanent,
                    "until": until,
                }),
            )
            .await;
        self.realtime
            .emit(realtime::CONVERSATION_UPDATED, Some(&conversation.id), conversation)
            .await;
    }

    async fn conversation_with_lead(&self, conversation_id: &str) -> Result<(Conversation, Lead), AppError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;
        let lead = self
            .store
            .get_lead(&conversation.lead_id)
            .await?
            .ok_or(AppError::NotFound("lead"))?;
        Ok((conversation, lead))
    }

    /// Agent text from the dashboard. Always a permanent hand-off.
    pub async fn send_manual_text(&self, conversation_id: &str, text: &str) -> Result<Message, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::BadRequest("text must not be empty".into()));
        }
        let (conversation, lead) = self.conversation_with_lead(conversation_id).await?;

        self.handoff.set_permanent(conversation_id).await?;
        self.buffer.cancel(conversation_id);

        self.outbound.note(&lead.phone, text);
        let sent = self
            .gateway
            .send_text(&conversation.instance, &lead.phone, text)
            .await?;
        let message = Message::new(
            conversation_id,
            text,
            true,
            MessageType::Text,
            json!({ "agent": true, "gatewayMessageId": sent.gateway_message_id }),
        );
        self.store.insert_message(&message).await?;

        let conversation = self
            .store
            .set_conversation_status(conversation_id, ConversationStatus::Transferred, Utc::now())
            .await?;

        self.realtime
            .emit(realtime::MESSAGE_NEW, Some(conversation_id), &message)
            .await;
        self.emit_handoff(&conversation, true, None).await;
        tracing::info!(conversation_id, "agent message sent");
        Ok(message)
    }

    /// Agent file from the dashboard. Pauses automation instead of handing off,
    /// and only when the conversation already has chatbot state.
    pub async fn send_manual_file(
        &self,
        conversation_id: &str,
        body: SendFileBody,
    ) -> Result<(Message, bool), AppError> {
        if body.file_name.trim().is_empty() {
            return Err(AppError::BadRequest("fileName must not be empty".into()));
        }
        if body.url.is_none() && body.base64.is_none() {
            return Err(AppError::BadRequest("either url or base64 is required".into()));
        }
        let (conversation, lead) = self.conversation_with_lead(conversation_id).await?;

        let file = OutboundFile {
            file_name: body.file_name,
            mime_type: body.mime_type,
            url: body.url,
            base64: body.base64,
            caption: body.caption,
        };
        let sent = self
            .gateway
            .send_file(&conversation.instance, &lead.phone, &file)
            .await?;
        // Only a delivered file pauses automation.
        let paused = self
            .handoff
            .pause_for(
                conversation_id,
                chrono::Duration::hours(self.config.file_pause_hours),
            )
            .await?;

        let content = file
            .caption
            .as_deref()
            .filter(|caption| !caption.trim().is_empty())
            .unwrap_or(file.file_name.as_str())
            .to_string();
        let message = Message::new(
            conversation_id,
            &content,
            true,
            MessageType::from_mimetype(&file.mime_type),
            json!({
                "agent": true,
                "fileName": file.file_name,
                "mimeType": file.mime_type,
                "url": file.url,
                "gatewayMessageId": sent.gateway_message_id,
                "pausedAutomation": paused,
            }),
        );
        self.store.insert_message(&message).await?;
        self.store.touch_conversation(conversation_id, Utc::now()).await?;

        self.realtime
            .emit(realtime::MESSAGE_NEW, Some(conversation_id), &message)
            .await;
        if paused {
            let until = Utc::now() + chrono::Duration::hours(self.config.file_pause_hours);
            self.emit_handoff(&conversation, false, Some(until)).await;
        }
        tracing::info!(conversation_id, paused, "agent file sent");
        Ok((message, paused))
    }

    /// Manual hand-off toggle. Releasing clears both suspension kinds.
    pub async fn set_handoff(&self, conversation_id: &str, active: bool) -> Result<Conversation, AppError> {
        self.conversation_with_lead(conversation_id).await?;
        let (status, note, marker) = if active {
            self.handoff.set_permanent(conversation_id).await?;
            self.buffer.cancel(conversation_id);
            (ConversationStatus::Transferred, MANUAL_HANDOFF_NOTE, "permanent")
        } else {
            self.handoff.release(conversation_id).await?;
            (ConversationStatus::Active, RELEASE_NOTE, "released")
        };
        let conversation = self
            .store
            .set_conversation_status(conversation_id, status, Utc::now())
            .await?;
        self.store
            .insert_message(&Message::system(
                conversation_id,
                note,
                json!({ "handoff": marker, "reason": "dashboard" }),
            ))
            .await?;
        self.emit_handoff(&conversation, active, None).await;
        Ok(conversation)
    }

    pub async fn close_conversation(&self, conversation_id: &str) -> Result<Conversation, AppError> {
        self.conversation_with_lead(conversation_id).await?;
        self.buffer.cancel(conversation_id);
        let conversation = self
            .store
            .set_conversation_status(conversation_id, ConversationStatus::Closed, Utc::now())
            .await?;
        self.realtime
            .emit(realtime::CONVERSATION_UPDATED, Some(conversation_id), &conversation)
            .await;
        tracing::info!(conversation_id, "conversation closed");
        Ok(conversation)
    }

    pub async fn update_lead_tags(
        &self,
        lead_id: &str,
        status: Option<LeadStatus>,
        priority: Option<Priority>,
    ) -> Result<Lead, AppError> {
        let lead = self.store.update_lead_tags(lead_id, status, priority).await?;
        self.realtime.emit(realtime::LEAD_UPDATED, None, &lead).await;
        Ok(lead)
    }

    /// Password-gated wipe of every lead and its dependents.
    pub async fn clear_leads(&self, password: &str) -> Result<u64, AppError> {
        let Some(hash) = self.config.admin_clear_password_hash.as_deref() else {
            return Err(AppError::BadRequest("bulk clear is not enabled".into()));
        };
        let valid = bcrypt::verify(password, hash)
            .map_err(|err| AppError::Internal(format!("password hash check failed: {err}")))?;
        if !valid {
            tracing::warn!("bulk clear rejected: wrong password");
            return Err(AppError::Unauthorized);
        }
        let removed = self.store.clear_leads().await?;
        self.handoff.forget_all();
        tracing::warn!(removed, "all leads cleared");
        Ok(removed)
    }

    /// Buffer diagnostics for a phone; read-only.
    pub async fn buffer_debug(&self, phone: &str) -> Result<(String, String, BufferWindow), AppError> {
        let phone = normalize_phone(phone).ok_or_else(|| AppError::BadRequest("invalid phone".into()))?;
        let (_, conversation) = self
            .resolver
            .lookup(&phone)
            .await?
            .ok_or(AppError::NotFound("conversation"))?;
        let window = self.flow.buffer_window(&conversation).await?;
        Ok((phone, conversation.id, window))
    }
}

#[async_trait]
impl FlushHandler for Orchestrator {
    async fn window_for(&self, conversation_id: &str) -> Duration {
        let default = Duration::from_secs(u64::from(self.config.default_buffer_seconds));
        let conversation = match self.store.get_conversation(conversation_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => return default,
            Err(error) => {
                tracing::warn!(conversation_id, %error, "buffer window lookup failed");
                return default;
            }
        };
        match self.flow.buffer_window(&conversation).await {
            Ok(window) => Duration::from_secs(u64::from(window.buffer_seconds)),
            Err(error) => {
                tracing::warn!(conversation_id, %error, "buffer window lookup failed");
                default
            }
        }
    }

    async fn flush(&self, conversation_id: &str, batch: String) {
        // A hand-off may have happened while the window was open.
        if self.handoff.is_suspended(conversation_id).await {
            tracing::info!(conversation_id, "hand-off engaged during buffer window; batch dropped");
            return;
        }
        match self.flow.run(conversation_id, &batch).await {
            Ok(outcome) => tracing::debug!(conversation_id, ?outcome, "flush complete"),
            Err(error) => tracing::error!(conversation_id, %error, "flow run failed"),
        }
    }
}

fn origin_label(event: &InboundEvent) -> &str {
    match &event.origin {
        Some(crate::validation::Origin::Api) => "api",
        Some(crate::validation::Origin::Human(origin)) => origin.as_str(),
        None => "unknown",
    }
}

//! Runs one buffered batch of customer input through the active flow.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::ai::{parse_step_decision, AiClient, ChatRole, ChatTurn, StepDecision};
use crate::classifier::OutboundLog;
use crate::error::StoreError;
use crate::gateway::Gateway;
use crate::handoff::HandoffGuard;
use crate::prompting::{render_flow_step_prompt, FlowStepPromptContext, TransitionOption};
use crate::realtime::{self, Realtime};
use crate::routing::{select_ai_next, select_fixed_next, transitionable_ids, Route};
use crate::store::Store;
use crate::types::{
    customer_transcript, ChatbotState, Conversation, ConversationStatus, FlowConfig, FlowStep,
    Lead, Message, MessageType, StepBody,
};

pub const HANDOFF_NOTE: &str = "Conversation transferred to a human agent";

#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub pacing_min: Duration,
    pub pacing_max: Duration,
    pub history_limit: usize,
    pub default_buffer_seconds: u32,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            pacing_min: Duration::from_millis(2000),
            pacing_max: Duration::from_millis(4000),
            history_limit: 20,
            default_buffer_seconds: 5,
        }
    }
}

impl FlowSettings {
    /// Delay before the line following `previous`.
    pub fn pacing_after(&self, previous: &str) -> Duration {
        let scaled = self.pacing_min + Duration::from_millis(previous.chars().count() as u64 * 20);
        scaled.clamp(self.pacing_min, self.pacing_max.max(self.pacing_min))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferSource {
    Step,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferWindow {
    pub current_step: Option<String>,
    pub buffer_seconds: u32,
    pub source: BufferSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    NoActiveFlow,
    Advanced { from: String, to: String },
    Stayed { step: String },
    /// The AI collaborator failed; nothing was sent and the step is retried next time.
    AiFailed { step: String },
    HandedOff { step: String },
}

pub struct FlowEngine {
    store: Arc<dyn Store>,
    gateway: Arc<dyn Gateway>,
    ai: Arc<dyn AiClient>,
    handoff: Arc<HandoffGuard>,
    outbound: Arc<OutboundLog>,
    realtime: Arc<Realtime>,
    settings: FlowSettings,
}

/// Picks the step to run: state pointer, then conversation pointer, then the
/// start step. A pointer to a removed step falls back to the start step.
pub fn resolve_current_step<'a>(
    flow: &'a FlowConfig,
    state: Option<&ChatbotState>,
    conversation: &Conversation,
) -> Option<&'a FlowStep> {
    let pointer = state
        .and_then(|state| state.current_step_id.as_deref())
        .or(conversation.current_step_id.as_deref());
    match pointer {
        Some(step_id) => match flow.step(step_id) {
            Some(step) => Some(step),
            None => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    step_id,
                    "current step no longer exists; restarting at the first step"
                );
                flow.start_step()
            }
        },
        None => flow.start_step(),
    }
}

impl FlowEngine {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn Gateway>,
        ai: Arc<dyn AiClient>,
        handoff: Arc<HandoffGuard>,
        outbound: Arc<OutboundLog>,
        realtime: Arc<Realtime>,
        settings: FlowSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            ai,
            handoff,
            outbound,
            realtime,
            settings,
        }
    }

    /// Debounce window for a conversation's current step.
    pub async fn buffer_window(&self, conversation: &Conversation) -> Result<BufferWindow, StoreError> {
        let default = BufferWindow {
            current_step: conversation.current_step_id.clone(),
            buffer_seconds: self.settings.default_buffer_seconds,
            source: BufferSource::Default,
        };
        let Some(flow) = self.store.active_flow().await? else {
            return Ok(default);
        };
        let state = self.store.get_state(&conversation.id).await?;
        let Some(step) = resolve_current_step(&flow, state.as_ref(), conversation) else {
            return Ok(default);
        };
        Ok(match step.buffer_seconds {
            Some(seconds) => BufferWindow {
                current_step: Some(step.id.clone()),
                buffer_seconds: seconds,
                source: BufferSource::Step,
            },
            None => BufferWindow {
                current_step: Some(step.id.clone()),
                ..default
            },
        })
    }

    pub async fn run(&self, conversation_id: &str, input: &str) -> Result<FlowOutcome, StoreError> {
        let Some(conversation) = self.store.get_conversation(conversation_id).await? else {
            tracing::warn!(conversation_id, "flush for unknown conversation dropped");
            return Ok(FlowOutcome::NoActiveFlow);
        };
        let lead = self
            .store
            .get_lead(&conversation.lead_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("lead {}", conversation.lead_id)))?;
        let Some(flow) = self.store.active_flow().await? else {
            tracing::info!(conversation_id, "no active flow; message recorded only");
            return Ok(FlowOutcome::NoActiveFlow);
        };

        let existing_state = self.store.get_state(conversation_id).await?;
        let Some(step) = resolve_current_step(&flow, existing_state.as_ref(), &conversation) else {
            tracing::info!(conversation_id, flow_id = %flow.id, "active flow has no steps");
            return Ok(FlowOutcome::NoActiveFlow);
        };
        let mut state = existing_state
            .unwrap_or_else(|| ChatbotState::new(conversation_id, Some(step.id.clone())));

        let (route, decision) = match &step.body {
            StepBody::Fixed(lines) => {
                self.send_script(&conversation, &lead, step, lines).await?;
                (select_fixed_next(&flow, step, input), None)
            }
            StepBody::Ai(prompt) => {
                match self.ask_ai(&flow, step, prompt, &state, conversation_id, input).await {
                    Ok(decision) => {
                        self.send_line(&conversation, &lead, step, &decision.reply).await?;
                        let route =
                            select_ai_next(&flow, step, input, decision.next_step_id.as_deref());
                        (route, Some(decision))
                    }
                    Err(error) => {
                        tracing::warn!(
                            conversation_id,
                            step_id = %step.id,
                            %error,
                            "ai step failed; step will repeat on next input"
                        );
                        self.store
                            .save_progress(conversation_id, Some(&step.id), &state.collected_data)
                            .await?;
                        return Ok(FlowOutcome::AiFailed {
                            step: step.id.clone(),
                        });
                    }
                }
            }
        };

        let completed = route.target().is_some() || step.transitions.is_empty();
        if completed {
            self.apply_tags(&lead, step).await?;
        }

        let next_step_id = route.target().unwrap_or(step.id.as_str()).to_string();
        if let Some(decision) = &decision {
            for (key, value) in &decision.collected_data {
                state.collected_data.insert(key.clone(), value.clone());
            }
        }
        self.store
            .save_progress(conversation_id, Some(&next_step_id), &state.collected_data)
            .await?;

        let handed_off = decision.as_ref().is_some_and(|decision| decision.handoff);
        let mut conversation = self
            .store
            .advance_conversation(conversation_id, &next_step_id, Utc::now())
            .await?;

        if handed_off {
            self.handoff.set_permanent(conversation_id).await?;
            conversation = self
                .store
                .set_conversation_status(conversation_id, ConversationStatus::Transferred, Utc::now())
                .await?;
            let note = Message::system(
                conversation_id,
                HANDOFF_NOTE,
                json!({ "handoff": "permanent", "reason": "ai-requested", "stepId": step.id }),
            );
            self.store.insert_message(&note).await?;
            self.realtime
                .emit(realtime::HANDOFF_CHANGED, Some(conversation_id), json!({
                    "conversationId": conversation_id,
                    "permanent": true,
                }))
                .await;
        }
        self.realtime
            .emit(realtime::CONVERSATION_UPDATED, Some(conversation_id), &conversation)
            .await;

        tracing::info!(
            conversation_id,
            step_id = %step.id,
            next_step_id = %next_step_id,
            route = ?route,
            "flow step processed"
        );
        Ok(if handed_off {
            FlowOutcome::HandedOff {
                step: step.id.clone(),
            }
        } else if matches!(route, Route::Stay) {
            FlowOutcome::Stayed {
                step: step.id.clone(),
            }
        } else {
            FlowOutcome::Advanced {
                from: step.id.clone(),
                to: next_step_id,
            }
        })
    }

    async fn ask_ai(
        &self,
        flow: &FlowConfig,
        step: &FlowStep,
        prompt: &str,
        state: &ChatbotState,
        conversation_id: &str,
        input: &str,
    ) -> Result<StepDecision, crate::error::AiError> {
        let transitions = transitionable_ids(flow, step)
            .into_iter()
            .map(|id| TransitionOption {
                label: step
                    .transitions
                    .iter()
                    .find(|transition| transition.target_step_id == id)
                    .map(|transition| transition.label.clone())
                    .unwrap_or_default(),
                id,
            })
            .collect::<Vec<_>>();
        let system = render_flow_step_prompt(&FlowStepPromptContext {
            global_prompt: &flow.global_prompt,
            step_name: &step.name,
            objective: &step.objective,
            step_prompt: prompt,
            routing_instructions: &step.routing_instructions,
            transitions: &transitions,
            collected_data: &state.collected_data,
        });

        let history = match self
            .store
            .recent_messages(conversation_id, self.settings.history_limit)
            .await
        {
            Ok(messages) => history_turns(&messages, input),
            Err(error) => {
                tracing::warn!(conversation_id, %error, "history unavailable; using input only");
                history_turns(&[], input)
            }
        };

        let raw = self.ai.complete(&system, &history).await?;
        parse_step_decision(&raw)
    }

    async fn send_script(
        &self,
        conversation: &Conversation,
        lead: &Lead,
        step: &FlowStep,
        lines: &[String],
    ) -> Result<(), StoreError> {
        let mut previous: Option<&str> = None;
        for line in lines {
            if let Some(previous) = previous {
                tokio::time::sleep(self.settings.pacing_after(previous)).await;
            }
            self.send_line(conversation, lead, step, line).await?;
            previous = Some(line.as_str());
        }
        Ok(())
    }

    /// Sends one outbound line and records it. Delivery failures are recorded, not raised.
    async fn send_line(
        &self,
        conversation: &Conversation,
        lead: &Lead,
        step: &FlowStep,
        text: &str,
    ) -> Result<(), StoreError> {
        self.outbound.note(&lead.phone, text);
        let metadata = match self
            .gateway
            .send_text(&conversation.instance, &lead.phone, text)
            .await
        {
            Ok(sent) => json!({
                "stepId": step.id,
                "gatewayMessageId": sent.gateway_message_id,
            }),
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    step_id = %step.id,
                    %error,
                    "outbound send failed"
                );
                json!({
                    "stepId": step.id,
                    "deliveryFailed": true,
                    "error": error.to_string(),
                })
            }
        };
        let message = Message::new(&conversation.id, text, true, MessageType::Text, metadata);
        self.store.insert_message(&message).await?;
        self.realtime
            .emit(realtime::MESSAGE_NEW, Some(&conversation.id), &message)
            .await;
        Ok(())
    }

    async fn apply_tags(&self, lead: &Lead, step: &FlowStep) -> Result<(), StoreError> {
        let status = step.change_status_to.value();
        let priority = step.change_priority_to.value();
        if status.is_none() && priority.is_none() {
            return Ok(());
        }
        let updated = self.store.update_lead_tags(&lead.id, status, priority).await?;
        tracing::info!(
            lead_id = %lead.id,
            step_id = %step.id,
            status = %updated.status,
            priority = %updated.priority,
            "lead tags updated by step"
        );
        self.realtime
            .emit(realtime::LEAD_UPDATED, None, &updated)
            .await;
        Ok(())
    }
}

/// Transcript as chat turns. Trailing customer messages are the batch being
/// answered, so they are replaced by the joined input.
fn history_turns(messages: &[Message], input: &str) -> Vec<ChatTurn> {
    let visible = customer_transcript(messages);
    let answered = visible
        .iter()
        .rposition(|message| message.is_bot)
        .map_or(0, |index| index + 1);
    let mut turns = visible[..answered]
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| ChatTurn {
            role: if message.is_bot {
                ChatRole::Assistant
            } else {
                ChatRole::User
            },
            content: message.content.clone(),
        })
        .collect::<Vec<_>>();
    turns.push(ChatTurn {
        role: ChatRole::User,
        content: input.to_string(),
    });
    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::resolver::ConversationResolver;
    use crate::testing::{ai_step, fixed_step, flow, keyword, RecordingGateway, ScriptedAi};
    use crate::types::{LeadStatus, Priority, TagChange};
    use serde_json::json;

    struct Rig {
        engine: FlowEngine,
        store: Arc<MemoryStore>,
        gateway: Arc<RecordingGateway>,
        ai: Arc<ScriptedAi>,
        handoff: Arc<HandoffGuard>,
        conversation: Conversation,
    }

    async fn rig(config: FlowConfig) -> Rig {
        let store = Arc::new(MemoryStore::new());
        store.save_flow(&config).await.unwrap();
        let gateway = RecordingGateway::new();
        let ai = ScriptedAi::new();
        let handoff = Arc::new(HandoffGuard::new(store.clone()));
        let resolved = ConversationResolver::new(store.clone())
            .resolve("5511988887777", "default", Some("Maria"))
            .await
            .unwrap();
        let engine = FlowEngine::new(
            store.clone(),
            gateway.clone(),
            ai.clone(),
            handoff.clone(),
            Arc::new(OutboundLog::new(Duration::from_secs(30), 10)),
            Arc::new(Realtime::new()),
            FlowSettings {
                pacing_min: Duration::ZERO,
                pacing_max: Duration::ZERO,
                ..FlowSettings::default()
            },
        );
        Rig {
            engine,
            store,
            gateway,
            ai,
            handoff,
            conversation: resolved.conversation,
        }
    }

    async fn current_step(rig: &Rig) -> Option<String> {
        rig.store
            .get_state(&rig.conversation.id)
            .await
            .unwrap()
            .and_then(|state| state.current_step_id)
    }

    #[tokio::test]
    async fn fixed_step_sends_every_line_and_follows_single_transition() {
        let mut welcome = fixed_step("welcome", &["Olá!", "Sou a assistente virtual."], &["triage"]);
        welcome.change_status_to = TagChange::Set(LeadStatus::InProgress);
        let rig = rig(flow("f1", vec![welcome, ai_step("triage", "Descubra o seguro", &[])], vec![])).await;

        let outcome = rig.engine.run(&rig.conversation.id, "oi").await.unwrap();

        assert_eq!(
            outcome,
            FlowOutcome::Advanced {
                from: "welcome".into(),
                to: "triage".into()
            }
        );
        assert_eq!(rig.gateway.sent_bodies(), vec!["Olá!", "Sou a assistente virtual."]);
        assert_eq!(current_step(&rig).await.as_deref(), Some("triage"));
        let lead = rig.store.get_lead(&rig.conversation.lead_id).await.unwrap().unwrap();
        assert_eq!(lead.status, LeadStatus::InProgress);
        let conversation = rig.store.get_conversation(&rig.conversation.id).await.unwrap().unwrap();
        assert_eq!(conversation.current_step_id.as_deref(), Some("triage"));
    }

    #[tokio::test]
    async fn ai_candidate_outside_transitions_stays_put() {
        let mut triage = ai_step("triage", "Descubra o seguro", &["auto", "life"]);
        triage.change_priority_to = TagChange::Set(Priority::High);
        let rig = rig(flow(
            "f1",
            vec![triage, ai_step("auto", "", &[]), ai_step("life", "", &[])],
            vec![],
        ))
        .await;
        rig.ai.push_decision(json!({ "reply": "Qual seguro?", "nextStepId": "boat" }));

        let outcome = rig.engine.run(&rig.conversation.id, "quero seguro").await.unwrap();

        assert_eq!(outcome, FlowOutcome::Stayed { step: "triage".into() });
        assert_eq!(rig.gateway.sent_bodies(), vec!["Qual seguro?"]);
        assert_eq!(current_step(&rig).await.as_deref(), Some("triage"));
        // Step did not complete, so its directive is not applied.
        let lead = rig.store.get_lead(&rig.conversation.lead_id).await.unwrap().unwrap();
        assert_eq!(lead.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn ai_failure_sends_nothing_and_does_not_advance() {
        let rig = rig(flow(
            "f1",
            vec![ai_step("triage", "", &["auto"]), ai_step("auto", "", &[])],
            vec![],
        ))
        .await;
        rig.ai.push_failure();

        let outcome = rig.engine.run(&rig.conversation.id, "oi").await.unwrap();

        assert_eq!(outcome, FlowOutcome::AiFailed { step: "triage".into() });
        assert!(rig.gateway.sent_bodies().is_empty());
        assert_eq!(current_step(&rig).await.as_deref(), Some("triage"));
    }

    #[tokio::test]
    async fn keyword_rule_overrides_ai_candidate() {
        let rig = rig(flow(
            "f1",
            vec![
                ai_step("triage", "", &["auto", "human"]),
                ai_step("auto", "", &[]),
                ai_step("human", "", &[]),
            ],
            vec![keyword(None, "falar com atendente", "human")],
        ))
        .await;
        rig.ai.push_decision(json!({ "reply": "Certo!", "nextStepId": "auto" }));

        let outcome = rig
            .engine
            .run(&rig.conversation.id, "Quero FALAR com   atendente por favor")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            FlowOutcome::Advanced {
                from: "triage".into(),
                to: "human".into()
            }
        );
        assert_eq!(rig.gateway.sent_bodies(), vec!["Certo!"]);
    }

    #[tokio::test]
    async fn ai_handoff_suspends_and_marks_transferred() {
        let rig = rig(flow("f1", vec![ai_step("triage", "", &[])], vec![])).await;
        rig.ai.push_decision(json!({
            "reply": "Vou chamar um especialista.",
            "collectedData": { "vehicle": "Onix" },
            "handoff": true
        }));

        let outcome = rig.engine.run(&rig.conversation.id, "reclamação").await.unwrap();

        assert_eq!(outcome, FlowOutcome::HandedOff { step: "triage".into() });
        assert!(rig.handoff.is_suspended(&rig.conversation.id).await);
        let conversation = rig.store.get_conversation(&rig.conversation.id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Transferred);
        let state = rig.store.get_state(&rig.conversation.id).await.unwrap().unwrap();
        assert!(state.is_permanent_handoff);
        assert_eq!(state.collected_data["vehicle"], "Onix");
        let messages = rig.store.list_messages(&rig.conversation.id).await.unwrap();
        assert!(messages
            .iter()
            .any(|message| message.message_type == MessageType::System && message.content == HANDOFF_NOTE));
    }

    #[tokio::test]
    async fn agent_takeover_during_a_step_survives_the_step_write() {
        let rig = rig(flow("f1", vec![ai_step("triage", "", &["quote"]), ai_step("quote", "", &[])], vec![])).await;
        rig.ai.push_decision(json!({
            "reply": "Qual o modelo do carro?",
            "nextStepId": "quote",
            "collectedData": { "vehicle": "Onix" }
        }));
        // Lands between the run's reads and its writes.
        rig.handoff.set_permanent(&rig.conversation.id).await.unwrap();
        rig.store
            .set_conversation_status(&rig.conversation.id, ConversationStatus::Transferred, Utc::now())
            .await
            .unwrap();

        let outcome = rig.engine.run(&rig.conversation.id, "seguro auto").await.unwrap();

        assert_eq!(
            outcome,
            FlowOutcome::Advanced {
                from: "triage".into(),
                to: "quote".into()
            }
        );
        let conversation = rig.store.get_conversation(&rig.conversation.id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Transferred);
        assert_eq!(conversation.current_step_id.as_deref(), Some("quote"));
        let state = rig.store.get_state(&rig.conversation.id).await.unwrap().unwrap();
        assert!(state.is_permanent_handoff);
        assert_eq!(state.collected_data["vehicle"], "Onix");
        assert!(rig.handoff.is_suspended(&rig.conversation.id).await);
    }

    #[tokio::test]
    async fn removed_step_pointer_restarts_at_first_step() {
        let rig = rig(flow("f1", vec![fixed_step("welcome", &["Olá!"], &[])], vec![])).await;
        let mut data = serde_json::Map::new();
        data.insert("k".into(), json!(1));
        rig.store
            .save_progress(&rig.conversation.id, Some("deleted"), &data)
            .await
            .unwrap();

        rig.engine.run(&rig.conversation.id, "oi").await.unwrap();

        assert_eq!(rig.gateway.sent_bodies(), vec!["Olá!"]);
        assert_eq!(current_step(&rig).await.as_deref(), Some("welcome"));
    }

    #[tokio::test]
    async fn delivery_failure_is_recorded_and_flow_continues() {
        let rig = rig(flow(
            "f1",
            vec![fixed_step("welcome", &["Olá!"], &["next"]), ai_step("next", "", &[])],
            vec![],
        ))
        .await;
        rig.gateway.fail_sends(true);

        rig.engine.run(&rig.conversation.id, "oi").await.unwrap();

        let messages = rig.store.list_messages(&rig.conversation.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].metadata["deliveryFailed"], true);
        assert_eq!(current_step(&rig).await.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn buffer_window_prefers_step_override() {
        let mut welcome = fixed_step("welcome", &["Olá!"], &[]);
        welcome.buffer_seconds = Some(12);
        let rig = rig(flow("f1", vec![welcome], vec![])).await;

        let window = rig.engine.buffer_window(&rig.conversation).await.unwrap();
        assert_eq!(window.buffer_seconds, 12);
        assert_eq!(window.source, BufferSource::Step);
        assert_eq!(window.current_step.as_deref(), Some("welcome"));
    }

    #[test]
    fn history_replaces_the_pending_batch_with_joined_input() {
        let bot = Message::new("c1", "Como posso ajudar?", true, MessageType::Text, json!({}));
        let note = Message::system("c1", "internal", json!({}));
        let first = Message::new("c1", "Olá", false, MessageType::Text, json!({}));
        let second = Message::new("c1", "quero um seguro", false, MessageType::Text, json!({}));

        let turns = history_turns(&[bot, note, first, second], "Olá\nquero um seguro");

        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, ChatRole::Assistant);
        assert_eq!(turns[1].role, ChatRole::User);
        assert_eq!(turns[1].content, "Olá\nquero um seguro");
    }

    #[test]
    fn pacing_scales_with_previous_line_and_clamps() {
        let settings = FlowSettings::default();
        assert_eq!(settings.pacing_after(""), Duration::from_millis(2000));
        assert_eq!(settings.pacing_after(&"a".repeat(50)), Duration::from_millis(3000));
        assert_eq!(settings.pacing_after(&"a".repeat(500)), Duration::from_millis(4000));
    }
}

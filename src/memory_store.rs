use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{Store, StoreResult};
use crate::types::{
    ChatbotState, Conversation, ConversationStatus, FlowConfig, Lead, LeadStatus, Message,
    Priority,
};

#[derive(Debug, Default)]
struct Tables {
    leads: HashMap<String, Lead>,
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
    states: HashMap<String, ChatbotState>,
    flows: Vec<FlowConfig>,
}

/// In-process store for tests and `DATABASE_URL=memory://` runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn protocol_suffix(protocol: &str, year: i32) -> Option<u32> {
    let (prefix, suffix) = protocol.split_once('-')?;
    if prefix.parse::<i32>().ok()? != year {
        return None;
    }
    suffix.parse::<u32>().ok()
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_lead_by_phone(&self, phone: &str) -> StoreResult<Option<Lead>> {
        let tables = self.tables.read().await;
        Ok(tables.leads.values().find(|lead| lead.phone == phone).cloned())
    }

    async fn get_lead(&self, lead_id: &str) -> StoreResult<Option<Lead>> {
        Ok(self.tables.read().await.leads.get(lead_id).cloned())
    }

    async fn max_protocol_suffix(&self, year: i32) -> StoreResult<u32> {
        let tables = self.tables.read().await;
        Ok(tables
            .leads
            .values()
            .filter_map(|lead| protocol_suffix(&lead.protocol, year))
            .max()
            .unwrap_or(0))
    }

    async fn insert_lead(&self, lead: &Lead) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.leads.values().any(|existing| existing.phone == lead.phone) {
            return Err(StoreError::Conflict(format!("lead phone {}", lead.phone)));
        }
        if tables
            .leads
            .values()
            .any(|existing| existing.protocol == lead.protocol)
        {
            return Err(StoreError::Conflict(format!("protocol {}", lead.protocol)));
        }
        tables.leads.insert(lead.id.clone(), lead.clone());
        Ok(())
    }

    async fn update_lead_tags(
        &self,
        lead_id: &str,
        status: Option<LeadStatus>,
        priority: Option<Priority>,
    ) -> StoreResult<Lead> {
        let mut tables = self.tables.write().await;
        let lead = tables
            .leads
            .get_mut(lead_id)
            .ok_or_else(|| StoreError::NotFound(format!("lead {lead_id}")))?;
        if let Some(status) = status {
            lead.status = status;
        }
        if let Some(priority) = priority {
            lead.priority = priority;
        }
        lead.updated_at = Utc::now();
        Ok(lead.clone())
    }

    async fn update_lead_name(&self, lead_id: &str, name: &str) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(lead) = tables.leads.get_mut(lead_id) {
            lead.name = name.to_string();
            lead.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn clear_leads(&self) -> StoreResult<u64> {
        let mut tables = self.tables.write().await;
        let removed = tables.leads.len() as u64;
        tables.leads.clear();
        tables.conversations.clear();
        tables.messages.clear();
        tables.states.clear();
        Ok(removed)
    }

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>> {
        Ok(self
            .tables
            .read()
            .await
            .conversations
            .get(conversation_id)
            .cloned())
    }

    async fn find_open_conversation(&self, lead_id: &str) -> StoreResult<Option<Conversation>> {
        let tables = self.tables.read().await;
        Ok(tables
            .conversations
            .values()
            .filter(|conversation| conversation.lead_id == lead_id && conversation.is_open())
            .max_by_key(|conversation| conversation.created_at)
            .cloned())
    }

    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.leads.contains_key(&conversation.lead_id) {
            return Err(StoreError::NotFound(format!("lead {}", conversation.lead_id)));
        }
        let open_exists = tables
            .conversations
            .values()
            .any(|existing| existing.lead_id == conversation.lead_id && existing.is_open());
        if conversation.is_open() && open_exists {
            return Err(StoreError::Conflict(format!(
                "lead {} already has an open conversation",
                conversation.lead_id
            )));
        }
        tables
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let conversation = tables
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        conversation.last_activity_at = at;
        Ok(())
    }

    async fn advance_conversation(
        &self,
        conversation_id: &str,
        step_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        let mut tables = self.tables.write().await;
        let conversation = tables
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        conversation.current_step_id = Some(step_id.to_string());
        conversation.last_activity_at = at;
        Ok(conversation.clone())
    }

    async fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Conversation> {
        let mut tables = self.tables.write().await;
        let lead_id = tables
            .conversations
            .get(conversation_id)
            .map(|conversation| conversation.lead_id.clone())
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        let clash = status != ConversationStatus::Closed
            && tables.conversations.values().any(|existing| {
                existing.id != conversation_id && existing.lead_id == lead_id && existing.is_open()
            });
        if clash {
            return Err(StoreError::Conflict(format!(
                "lead {lead_id} already has an open conversation"
            )));
        }
        let conversation = tables
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {conversation_id}")))?;
        conversation.status = status;
        conversation.last_activity_at = at;
        Ok(conversation.clone())
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(&message.conversation_id) {
            return Err(StoreError::NotFound(format!(
                "conversation {}",
                message.conversation_id
            )));
        }
        if let Some(external_id) = &message.external_id {
            let duplicate = tables
                .messages
                .iter()
                .any(|existing| existing.external_id.as_deref() == Some(external_id.as_str()));
            if duplicate {
                return Err(StoreError::Conflict(format!("message {external_id}")));
            }
        }
        tables.messages.push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        let tables = self.tables.read().await;
        let mut messages = tables
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by_key(|message| message.created_at);
        Ok(messages)
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let mut messages = self.list_messages(conversation_id).await?;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.split_off(skip))
    }

    async fn get_state(&self, conversation_id: &str) -> StoreResult<Option<ChatbotState>> {
        Ok(self.tables.read().await.states.get(conversation_id).cloned())
    }

    async fn save_progress(
        &self,
        conversation_id: &str,
        step_id: Option<&str>,
        collected_data: &Map<String, Value>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(conversation_id) {
            return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
        }
        let state = tables
            .states
            .entry(conversation_id.to_string())
            .or_insert_with(|| ChatbotState::new(conversation_id, None));
        state.current_step_id = step_id.map(str::to_string);
        state.collected_data = collected_data.clone();
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn upsert_handoff(
        &self,
        conversation_id: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.conversations.contains_key(conversation_id) {
            return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
        }
        let state = tables
            .states
            .entry(conversation_id.to_string())
            .or_insert_with(|| ChatbotState::new(conversation_id, None));
        state.is_permanent_handoff = permanent;
        state.handoff_until = until;
        state.updated_at = Utc::now();
        Ok(())
    }

    async fn set_handoff(
        &self,
        conversation_id: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.states.get_mut(conversation_id) {
            Some(state) => {
                state.is_permanent_handoff = permanent;
                state.handoff_until = until;
                state.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn suspended_states(&self) -> StoreResult<Vec<ChatbotState>> {
        let tables = self.tables.read().await;
        Ok(tables
            .states
            .values()
            .filter(|state| state.is_permanent_handoff || state.handoff_until.is_some())
            .cloned()
            .collect())
    }

    async fn list_flows(&self) -> StoreResult<Vec<FlowConfig>> {
        let mut flows = self.tables.read().await.flows.clone();
        flows.sort_by_key(|flow| flow.created_at);
        Ok(flows)
    }

    async fn get_flow(&self, flow_id: &str) -> StoreResult<Option<FlowConfig>> {
        let tables = self.tables.read().await;
        Ok(tables.flows.iter().find(|flow| flow.id == flow_id).cloned())
    }

    async fn active_flow(&self) -> StoreResult<Option<FlowConfig>> {
        let tables = self.tables.read().await;
        Ok(tables.flows.iter().find(|flow| flow.active).cloned())
    }

    async fn save_flow(&self, flow: &FlowConfig) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if flow.active
            && tables
                .flows
                .iter()
                .any(|existing| existing.active && existing.id != flow.id)
        {
            return Err(StoreError::Conflict("another flow is already active".into()));
        }
        match tables.flows.iter_mut().find(|existing| existing.id == flow.id) {
            Some(existing) => *existing = flow.clone(),
            None => tables.flows.push(flow.clone()),
        }
        Ok(())
    }

    async fn activate_flow(&self, flow_id: &str) -> StoreResult<FlowConfig> {
        let mut tables = self.tables.write().await;
        if !tables.flows.iter().any(|flow| flow.id == flow_id) {
            return Err(StoreError::NotFound(format!("flow {flow_id}")));
        }
        let now = Utc::now();
        let mut activated = None;
        for flow in tables.flows.iter_mut() {
            let target = flow.id == flow_id;
            if flow.active != target {
                flow.active = target;
                flow.updated_at = now;
            }
            if target {
                activated = Some(flow.clone());
            }
        }
        activated.ok_or_else(|| StoreError::NotFound(format!("flow {flow_id}")))
    }
}

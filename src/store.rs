//! Persistence seam. Both implementations enforce the same uniqueness rules and
//! report violations as [`StoreError::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::types::{
    ChatbotState, Conversation, ConversationStatus, FlowConfig, Lead, LeadStatus, Message,
    Priority,
};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_lead_by_phone(&self, phone: &str) -> StoreResult<Option<Lead>>;
    async fn get_lead(&self, lead_id: &str) -> StoreResult<Option<Lead>>;
    /// Highest protocol suffix already issued for `year`, 0 when none.
    async fn max_protocol_suffix(&self, year: i32) -> StoreResult<u32>;
    /// Conflict on a duplicate phone or protocol.
    async fn insert_lead(&self, lead: &Lead) -> StoreResult<()>;
    async fn update_lead_tags(
        &self,
        lead_id: &str,
        status: Option<LeadStatus>,
        priority: Option<Priority>,
    ) -> StoreResult<Lead>;
    async fn update_lead_name(&self, lead_id: &str, name: &str) -> StoreResult<()>;
    /// Deletes every lead and everything hanging off them. Returns the lead count.
    async fn clear_leads(&self) -> StoreResult<u64>;

    async fn get_conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>>;
    async fn find_open_conversation(&self, lead_id: &str) -> StoreResult<Option<Conversation>>;
    /// Conflict if the lead already has a non-closed conversation.
    async fn insert_conversation(&self, conversation: &Conversation) -> StoreResult<()>;
    /// Bumps `last_activity_at` only.
    async fn touch_conversation(&self, conversation_id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    /// Moves the step pointer; status is left alone.
    async fn advance_conversation(
        &self,
        conversation_id: &str,
        step_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Conversation>;
    /// Conflict when reopening would give the lead a second open conversation.
    async fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Conversation>;

    /// Conflict on a repeated gateway message id.
    async fn insert_message(&self, message: &Message) -> StoreResult<()>;
    /// Oldest first.
    async fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>>;
    /// The last `limit` messages, oldest first.
    async fn recent_messages(&self, conversation_id: &str, limit: usize)
        -> StoreResult<Vec<Message>>;

    async fn get_state(&self, conversation_id: &str) -> StoreResult<Option<ChatbotState>>;
    /// Writes step pointer and collected data, creating the state if needed.
    /// Hand-off columns of an existing state are never touched.
    async fn save_progress(
        &self,
        conversation_id: &str,
        step_id: Option<&str>,
        collected_data: &Map<String, Value>,
    ) -> StoreResult<()>;
    /// Writes hand-off columns only, creating the state if needed.
    async fn upsert_handoff(
        &self,
        conversation_id: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;
    /// Updates hand-off fields of an existing state. Returns false when no state exists.
    async fn set_handoff(
        &self,
        conversation_id: &str,
        permanent: bool,
        until: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;
    /// States carrying any suspension, used to warm the hand-off guard.
    async fn suspended_states(&self) -> StoreResult<Vec<ChatbotState>>;

    async fn list_flows(&self) -> StoreResult<Vec<FlowConfig>>;
    async fn get_flow(&self, flow_id: &str) -> StoreResult<Option<FlowConfig>>;
    async fn active_flow(&self) -> StoreResult<Option<FlowConfig>>;
    /// Inserts or replaces a flow together with its steps and keyword rules.
    async fn save_flow(&self, flow: &FlowConfig) -> StoreResult<()>;
    /// Marks one flow active and every other inactive in a single step.
    async fn activate_flow(&self, flow_id: &str) -> StoreResult<FlowConfig>;
}

//! Phone to lead and open conversation, with yearly protocol codes.

use std::sync::Arc;

use chrono::{Datelike, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Conversation, ConversationStatus, Lead, LeadStatus, Priority};

const MAX_CONFLICT_RETRIES: usize = 5;

/// `2025-007`. The suffix widens past 999 rather than wrapping.
pub fn format_protocol(year: i32, sequence: u32) -> String {
    format!("{year}-{sequence:03}")
}

#[derive(Debug, Clone)]
pub struct Resolved {
    pub lead: Lead,
    pub conversation: Conversation,
    pub created_lead: bool,
    pub created_conversation: bool,
}

/// Maps a phone to its lead and open conversation, creating them on demand.
pub struct ConversationResolver {
    store: Arc<dyn Store>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ConversationResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Idempotent per phone. Concurrent callers for the same phone serialise on
    /// a per-phone lock, and the store's unique indexes catch anything that
    /// slips past it (another process, for instance).
    pub async fn resolve(
        &self,
        phone: &str,
        instance: &str,
        push_name: Option<&str>,
    ) -> Result<Resolved, StoreError> {
        let lock = self
            .locks
            .entry(phone.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let resolved = {
            let _guard = lock.lock().await;
            self.resolve_locked(phone, instance, push_name).await
        };
        drop(lock);
        // Only the map holds it now; nobody is waiting on this phone.
        self.locks
            .remove_if(phone, |_, lock| Arc::strong_count(lock) == 1);
        resolved
    }

    async fn resolve_locked(
        &self,
        phone: &str,
        instance: &str,
        push_name: Option<&str>,
    ) -> Result<Resolved, StoreError> {
        let (lead, created_lead) = self.find_or_create_lead(phone, push_name).await?;
        let (conversation, created_conversation) =
            self.find_or_create_conversation(&lead, instance).await?;
        Ok(Resolved {
            lead,
            conversation,
            created_lead,
            created_conversation,
        })
    }

    /// Lookup only; never creates anything.
    pub async fn lookup(&self, phone: &str) -> Result<Option<(Lead, Conversation)>, StoreError> {
        let Some(lead) = self.store.find_lead_by_phone(phone).await? else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_open_conversation(&lead.id)
            .await?
            .map(|conversation| (lead, conversation)))
    }

    async fn find_or_create_lead(
        &self,
        phone: &str,
        push_name: Option<&str>,
    ) -> Result<(Lead, bool), StoreError> {
        if let Some(lead) = self.store.find_lead_by_phone(phone).await? {
            if lead.name.is_empty() {
                if let Some(name) = push_name {
                    self.store.update_lead_name(&lead.id, name).await?;
                    return Ok((Lead { name: name.to_string(), ..lead }, false));
                }
            }
            return Ok((lead, false));
        }

        let mut attempt = 0;
        loop {
            let now = Utc::now();
            let year = now.year();
            let next = self.store.max_protocol_suffix(year).await? + 1;
            let lead = Lead {
                id: Uuid::new_v4().to_string(),
                phone: phone.to_string(),
                name: push_name.unwrap_or_default().to_string(),
                email: None,
                cpf: None,
                protocol: format_protocol(year, next),
                status: LeadStatus::New,
                priority: Priority::Normal,
                created_at: now,
                updated_at: now,
            };
            match self.store.insert_lead(&lead).await {
                Ok(()) => {
                    tracing::info!(lead_id = %lead.id, protocol = %lead.protocol, "lead created");
                    return Ok((lead, true));
                }
                Err(StoreError::Conflict(reason)) if attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    tracing::debug!(%reason, attempt, "lead insert conflicted, retrying");
                    if let Some(existing) = self.store.find_lead_by_phone(phone).await? {
                        return Ok((existing, false));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn find_or_create_conversation(
        &self,
        lead: &Lead,
        instance: &str,
    ) -> Result<(Conversation, bool), StoreError> {
        if let Some(existing) = self.store.find_open_conversation(&lead.id).await? {
            return Ok((existing, false));
        }

        let start_step = self
            .store
            .active_flow()
            .await?
            .and_then(|flow| flow.start_step().map(|step| step.id.clone()));
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            lead_id: lead.id.clone(),
            instance: instance.to_string(),
            status: ConversationStatus::Active,
            current_step_id: start_step,
            last_activity_at: now,
            created_at: now,
        };
        match self.store.insert_conversation(&conversation).await {
            Ok(()) => {
                tracing::info!(conversation_id = %conversation.id, lead_id = %lead.id, "conversation opened");
                Ok((conversation, true))
            }
            Err(StoreError::Conflict(_)) => self
                .store
                .find_open_conversation(&lead.id)
                .await?
                .map(|existing| (existing, false))
                .ok_or_else(|| StoreError::Conflict("open conversation vanished".into())),
            Err(err) => Err(err),
        }
    }
}

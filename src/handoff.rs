//! Suspension of automated replies.
//!
//! The map is consulted before the store and is always written first, so a
//! customer message racing a hand-off write already sees the suspension.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::error::StoreError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HandoffEntry {
    permanent: bool,
    until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    Active,
    Permanent,
    PausedUntil(DateTime<Utc>),
}

impl Suspension {
    pub fn is_suspended(self) -> bool {
        !matches!(self, Self::Active)
    }
}

pub struct HandoffGuard {
    entries: DashMap<String, HandoffEntry>,
    store: Arc<dyn Store>,
}

impl HandoffGuard {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            entries: DashMap::new(),
            store,
        }
    }

    /// Loads every persisted suspension. Called once before serving.
    pub async fn warm(&self) -> Result<usize, StoreError> {
        let states = self.store.suspended_states().await?;
        let count = states.len();
        for state in states {
            self.entries.insert(
                state.conversation_id,
                HandoffEntry {
                    permanent: state.is_permanent_handoff,
                    until: state.handoff_until,
                },
            );
        }
        Ok(count)
    }

    pub async fn status(&self, conversation_id: &str, now: DateTime<Utc>) -> Suspension {
        let entry = match self.cached(conversation_id) {
            Some(entry) => entry,
            None => self.load(conversation_id).await,
        };
        match entry {
            HandoffEntry { permanent: true, .. } => Suspension::Permanent,
            HandoffEntry {
                until: Some(until), ..
            } if now < until => Suspension::PausedUntil(until),
            _ => Suspension::Active,
        }
    }

    pub async fn is_suspended(&self, conversation_id: &str) -> bool {
        self.status(conversation_id, Utc::now()).await.is_suspended()
    }

    /// Permanent hand-off. The map entry is in place before the store write starts.
    pub async fn set_permanent(&self, conversation_id: &str) -> Result<(), StoreError> {
        let until = {
            let mut entry = self.entries.entry(conversation_id.to_string()).or_default();
            entry.permanent = true;
            entry.until
        };
        tracing::info!(conversation_id, "permanent hand-off engaged");
        self.store.upsert_handoff(conversation_id, true, until).await
    }

    /// Temporary pause. Applies only when the conversation already has a
    /// chatbot state; returns whether a pause was recorded.
    pub async fn pause_for(
        &self,
        conversation_id: &str,
        duration: Duration,
    ) -> Result<bool, StoreError> {
        let Some(state) = self.store.get_state(conversation_id).await? else {
            tracing::debug!(conversation_id, "no chatbot state, pause skipped");
            return Ok(false);
        };
        let until = Utc::now() + duration;
        let permanent = {
            let mut entry = self.entries.entry(conversation_id.to_string()).or_default();
            entry.permanent |= state.is_permanent_handoff;
            entry.until = Some(until);
            entry.permanent
        };
        let recorded = self
            .store
            .set_handoff(conversation_id, permanent, Some(until))
            .await?;
        tracing::info!(conversation_id, %until, "automated replies paused");
        Ok(recorded)
    }

    /// Clears both suspension kinds.
    pub async fn release(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.entries
            .insert(conversation_id.to_string(), HandoffEntry::default());
        self.store.set_handoff(conversation_id, false, None).await?;
        // The store now answers "active" on its own.
        self.entries
            .remove_if(conversation_id, |_, entry| *entry == HandoffEntry::default());
        tracing::info!(conversation_id, "hand-off released");
        Ok(())
    }

    pub fn forget_all(&self) {
        self.entries.clear();
    }

    fn cached(&self, conversation_id: &str) -> Option<HandoffEntry> {
        self.entries.get(conversation_id).map(|entry| *entry)
    }

    async fn load(&self, conversation_id: &str) -> HandoffEntry {
        let loaded = match self.store.get_state(conversation_id).await {
            Ok(Some(state)) => HandoffEntry {
                permanent: state.is_permanent_handoff,
                until: state.handoff_until,
            },
            Ok(None) => HandoffEntry::default(),
            Err(error) => {
                // Not cached, so the next call retries the store.
                tracing::warn!(conversation_id, %error, "hand-off lookup failed; treating as active");
                return HandoffEntry::default();
            }
        };
        // A concurrent set_permanent may have landed while the store was read.
        if let Some(entry) = self.cached(conversation_id) {
            return entry;
        }
        if loaded == HandoffEntry::default() {
            return loaded;
        }
        *self
            .entries
            .entry(conversation_id.to_string())
            .or_insert(loaded)
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.entries.len()
    }
}

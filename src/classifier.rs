//! Decides who produced an inbound event: the customer, a human agent typing on
//! the shared device, or the engine's own outbound send echoing back.
//!
//! The gateway's origin tag is not populated by every gateway version. When it
//! is missing on an own-device event, an [`EchoStrategy`] makes the call.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;

use crate::types::{Message, MessageType};
use crate::validation::{InboundEvent, Origin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Group,
    BotEcho,
    HumanAgent,
    Customer,
    /// Own-device event without an origin tag; needs conversation history.
    Ambiguous,
    /// The strategy declined to decide.
    Unknown,
}

impl Classification {
    pub fn ignore_reason(self) -> Option<&'static str> {
        match self {
            Self::Group => Some("group-message-not-supported"),
            Self::BotEcho => Some("bot-echo"),
            Self::Unknown => Some("origin-unknown"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoJudgement {
    Echo,
    Human,
    Unknown,
}

/// Fallback used for own-device events that carry no origin tag.
pub trait EchoStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// How many recent outbound messages to load. Zero skips the lookup.
    fn history_window(&self) -> usize;

    /// `recent_outbound` is oldest first.
    fn judge(&self, event: &InboundEvent, recent_outbound: &[Message]) -> EchoJudgement;
}

/// Best-effort heuristic: an exact content match against one of the last N
/// outbound messages, sent within the echo window, is our own echo.
#[derive(Debug, Clone)]
pub struct ContentWindowEcho {
    pub window: Duration,
    pub history: usize,
}

impl Default for ContentWindowEcho {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            history: 10,
        }
    }
}

impl EchoStrategy for ContentWindowEcho {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn history_window(&self) -> usize {
        self.history
    }

    fn judge(&self, event: &InboundEvent, recent_outbound: &[Message]) -> EchoJudgement {
        let body = event.body.trim();
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(30));
        let candidates = recent_outbound
            .iter()
            .filter(|message| message.is_bot && message.message_type != MessageType::System)
            .rev()
            .take(self.history);

        for message in candidates {
            let same_send = message
                .metadata
                .get("gatewayMessageId")
                .and_then(|id| id.as_str())
                .is_some_and(|id| id == event.message_id);
            if same_send {
                return EchoJudgement::Echo;
            }
            let age = (event.timestamp - message.created_at).abs();
            if !body.is_empty() && message.content.trim() == body && age <= window {
                return EchoJudgement::Echo;
            }
        }
        EchoJudgement::Human
    }
}

/// Refuses to guess: an own-device event without origin is left undecided.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireOrigin;

impl EchoStrategy for RequireOrigin {
    fn name(&self) -> &'static str {
        "require-origin"
    }

    fn history_window(&self) -> usize {
        0
    }

    fn judge(&self, _event: &InboundEvent, _recent_outbound: &[Message]) -> EchoJudgement {
        EchoJudgement::Unknown
    }
}

/// Outbound text noted just before the gateway call, per phone.
///
/// The echo of a send can arrive while the send is still in flight, before its
/// row exists, so ambiguous events are judged against these entries too.
pub struct OutboundLog {
    window: chrono::Duration,
    history: usize,
    sends: DashMap<String, VecDeque<(String, DateTime<Utc>)>>,
}

impl OutboundLog {
    pub fn new(window: Duration, history: usize) -> Self {
        Self {
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(30)),
            history: history.max(1),
            sends: DashMap::new(),
        }
    }

    pub fn note(&self, phone: &str, text: &str) {
        let mut sends = self.sends.entry(phone.to_string()).or_default();
        sends.push_back((text.to_string(), Utc::now()));
        while sends.len() > self.history {
            sends.pop_front();
        }
    }

    /// Noted sends still inside the window, as bot messages, oldest first.
    pub fn recent(&self, phone: &str, conversation_id: &str) -> Vec<Message> {
        let cutoff = Utc::now() - self.window;
        let Some(sends) = self.sends.get(phone) else {
            return Vec::new();
        };
        sends
            .iter()
            .filter(|(_, at)| *at >= cutoff)
            .map(|(text, at)| {
                let mut message = Message::new(
                    conversation_id,
                    text,
                    true,
                    MessageType::Text,
                    json!({ "inFlight": true }),
                );
                message.created_at = *at;
                message
            })
            .collect()
    }

    /// Drops entries older than the window. Returns how many phones remain.
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now() - self.window;
        self.sends.retain(|_, sends| {
            sends.retain(|(_, at)| *at >= cutoff);
            !sends.is_empty()
        });
        self.sends.len()
    }
}

#[derive(Clone)]
pub struct SenderClassifier {
    strategy: Arc<dyn EchoStrategy>,
}

impl SenderClassifier {
    pub fn new(strategy: Arc<dyn EchoStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn history_window(&self) -> usize {
        self.strategy.history_window()
    }

    /// Classification from the event alone.
    pub fn classify(&self, event: &InboundEvent) -> Classification {
        if event.is_group {
            return Classification::Group;
        }
        if !event.from_me {
            return Classification::Customer;
        }
        match &event.origin {
            Some(Origin::Api) => Classification::BotEcho,
            Some(Origin::Human(_)) => Classification::HumanAgent,
            None => Classification::Ambiguous,
        }
    }

    /// Settles an [`Classification::Ambiguous`] event against recent outbound history.
    pub fn settle(&self, event: &InboundEvent, recent_outbound: &[Message]) -> Classification {
        match self.strategy.judge(event, recent_outbound) {
            EchoJudgement::Echo => Classification::BotEcho,
            EchoJudgement::Human => Classification::HumanAgent,
            EchoJudgement::Unknown => Classification::Unknown,
        }
    }
}

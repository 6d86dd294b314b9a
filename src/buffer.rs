//! Per-conversation debounce of customer messages.
//!
//! Every arrival re-arms the conversation's timer. When the window elapses the
//! pending lines are drained and handed to the [`FlushHandler`] joined by
//! newlines. A drained batch is detached from the timer slot, so later arrivals
//! cannot abort it; they start a fresh window that queues behind it on the
//! per-conversation flush lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

#[async_trait]
pub trait FlushHandler: Send + Sync {
    /// Debounce window for the conversation, resolved from its current step.
    async fn window_for(&self, conversation_id: &str) -> Duration;

    async fn flush(&self, conversation_id: &str, batch: String);
}

struct Slot {
    generation: u64,
    pending: Vec<String>,
    timer: Option<JoinHandle<()>>,
    flush_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: 0,
            pending: Vec::new(),
            timer: None,
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn idle(&self) -> bool {
        self.pending.is_empty() && self.timer.is_none() && Arc::strong_count(&self.flush_lock) == 1
    }
}

#[derive(Clone, Default)]
pub struct MessageBuffer {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, conversation_id: &str, text: String, handler: Arc<dyn FlushHandler>) {
        let mut slots = self.lock();
        let slot = slots
            .entry(conversation_id.to_string())
            .or_insert_with(Slot::new);
        if let Some(previous) = slot.timer.take() {
            previous.abort();
        }
        slot.generation += 1;
        slot.pending.push(text);
        tracing::debug!(conversation_id, pending = slot.pending.len(), "buffer window re-armed");

        let generation = slot.generation;
        let buffer = self.clone();
        let conversation_id = conversation_id.to_string();
        slot.timer = Some(tokio::spawn(async move {
            buffer.run_timer(conversation_id, generation, handler).await;
        }));
    }

    /// Drops pending input and any armed timer. An in-flight flush is unaffected.
    pub fn cancel(&self, conversation_id: &str) {
        let mut slots = self.lock();
        let remove = match slots.get_mut(conversation_id) {
            Some(slot) => {
                if let Some(timer) = slot.timer.take() {
                    timer.abort();
                }
                slot.pending.clear();
                slot.generation += 1;
                slot.idle()
            }
            None => false,
        };
        if remove {
            slots.remove(conversation_id);
        }
    }

    pub fn pending(&self, conversation_id: &str) -> usize {
        self.lock()
            .get(conversation_id)
            .map(|slot| slot.pending.len())
            .unwrap_or(0)
    }

    async fn run_timer(&self, conversation_id: String, generation: u64, handler: Arc<dyn FlushHandler>) {
        let armed = handler.window_for(&conversation_id).await;
        tokio::time::sleep(armed).await;
        // The step may have changed while we slept; its window is what counts.
        let current = handler.window_for(&conversation_id).await;
        if current > armed {
            tokio::time::sleep(current - armed).await;
        }

        let (batch, flush_lock) = {
            let mut slots = self.lock();
            let Some(slot) = slots.get_mut(&conversation_id) else {
                return;
            };
            if slot.generation != generation || slot.pending.is_empty() {
                return;
            }
            slot.timer = None;
            (
                std::mem::take(&mut slot.pending).join("\n"),
                slot.flush_lock.clone(),
            )
        };

        {
            let _in_flight = flush_lock.lock().await;
            tracing::debug!(%conversation_id, "buffer flushing");
            handler.flush(&conversation_id, batch).await;
        }
        drop(flush_lock);

        let mut slots = self.lock();
        if slots.get(&conversation_id).is_some_and(Slot::idle) {
            slots.remove(&conversation_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Recorder {
        window_ms: AtomicU64,
        flush_delay_ms: AtomicU64,
        batches: Mutex<Vec<(String, String)>>,
    }

    impl Recorder {
        fn with_window(ms: u64) -> Arc<Self> {
            let recorder = Self::default();
            recorder.window_ms.store(ms, Ordering::SeqCst);
            Arc::new(recorder)
        }

        fn batches(&self) -> Vec<String> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .map(|(_, batch)| batch.clone())
                .collect()
        }
    }

    #[async_trait]
    impl FlushHandler for Recorder {
        async fn window_for(&self, _conversation_id: &str) -> Duration {
            Duration::from_millis(self.window_ms.load(Ordering::SeqCst))
        }

        async fn flush(&self, conversation_id: &str, batch: String) {
            let delay = self.flush_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            self.batches
                .lock()
                .unwrap()
                .push((conversation_id.to_string(), batch));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_messages_flush_once_in_order() {
        let buffer = MessageBuffer::new();
        let recorder = Recorder::with_window(5_000);
        buffer.push("c1", "Olá".into(), recorder.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        buffer.push("c1", "quero um seguro".into(), recorder.clone());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(recorder.batches().is_empty(), "window restarted on second message");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(recorder.batches(), vec!["Olá\nquero um seguro".to_string()]);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.batches().len(), 1);
        assert_eq!(buffer.pending("c1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn conversations_are_independent() {
        let buffer = MessageBuffer::new();
        let recorder = Recorder::with_window(1_000);
        buffer.push("c1", "a".into(), recorder.clone());
        buffer.push("c2", "b".into(), recorder.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut batches = recorder.batches();
        batches.sort();
        assert_eq!(batches, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_read_when_the_timer_fires() {
        let buffer = MessageBuffer::new();
        let recorder = Recorder::with_window(1_000);
        buffer.push("c1", "oi".into(), recorder.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;
        recorder.window_ms.store(5_000, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(recorder.batches().is_empty());
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(recorder.batches(), vec!["oi".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn input_during_flush_starts_a_new_batch() {
        let buffer = MessageBuffer::new();
        let recorder = Recorder::with_window(1_000);
        recorder.flush_delay_ms.store(10_000, Ordering::SeqCst);

        buffer.push("c1", "primeira".into(), recorder.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        // first flush is now in flight
        buffer.push("c1", "segunda".into(), recorder.clone());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            recorder.batches(),
            vec!["primeira".to_string(), "segunda".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_pending_input() {
        let buffer = MessageBuffer::new();
        let recorder = Recorder::with_window(1_000);
        buffer.push("c1", "oi".into(), recorder.clone());
        buffer.cancel("c1");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(recorder.batches().is_empty());
        assert_eq!(buffer.pending("c1"), 0);
    }
}

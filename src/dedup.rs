//! Bounded FIFO memory of gateway message ids.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Fresh,
    Duplicate,
    /// A redelivered audio event whose first pass has not produced a
    /// transcript yet. Allowed through once.
    AudioRetry,
}

impl DedupVerdict {
    pub fn should_process(self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<String>,
    members: HashSet<String>,
    pending_audio: HashSet<String>,
}

/// Eviction is strict insertion order; a hit never refreshes an entry.
#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn seen(&self, id: &str) -> bool {
        self.lock().members.contains(id)
    }

    pub fn remember(&self, id: &str) {
        let mut inner = self.lock();
        Self::insert(&mut inner, self.capacity, id);
    }

    /// Atomic check-and-remember used by the webhook path.
    pub fn admit(&self, id: &str, is_audio: bool) -> DedupVerdict {
        let mut inner = self.lock();
        if inner.members.contains(id) {
            if inner.pending_audio.remove(id) {
                return DedupVerdict::AudioRetry;
            }
            return DedupVerdict::Duplicate;
        }
        Self::insert(&mut inner, self.capacity, id);
        if is_audio {
            inner.pending_audio.insert(id.to_string());
        }
        DedupVerdict::Fresh
    }

    /// Marks an audio id as transcribed; later deliveries are plain duplicates.
    pub fn transcribed(&self, id: &str) {
        self.lock().pending_audio.remove(id);
    }

    /// Drops an id so its next delivery is processed as fresh.
    pub fn forget(&self, id: &str) {
        let mut inner = self.lock();
        if inner.members.remove(id) {
            inner.order.retain(|member| member != id);
        }
        inner.pending_audio.remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(inner: &mut Inner, capacity: usize, id: &str) {
        if !inner.members.insert(id.to_string()) {
            return;
        }
        inner.order.push_back(id.to_string());
        while inner.order.len() > capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.members.remove(&oldest);
                inner.pending_audio.remove(&oldest);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned guard still holds a consistent set; keep serving.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

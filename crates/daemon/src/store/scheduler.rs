// Write-back timers for the document store.
//
// Two keyed deadline queues: debounced flushes ("2s quiet / 30s max") and
// the empty-document rename. A single driver task owned by the store sleeps
// until the earliest deadline across both and fires whatever is due.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Quiet period after the last edit before a document is flushed.
pub const WRITE_DELAY_TYPING: Duration = Duration::from_secs(2);
/// Longest an edited document may stay unflushed under continuous edits.
pub const WRITE_DELAY_MAX: Duration = Duration::from_secs(30);
/// Delay before a blank document is renamed to "Untitled".
pub const EMPTY_RENAME_DELAY: Duration = Duration::from_secs(5);

/// Pending deadlines keyed by `K`. Scheduling a key again replaces its
/// deadline, so each key has at most one pending entry.
#[derive(Debug)]
pub struct DeadlineQueue<K> {
    pending: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> DeadlineQueue<K> {
    pub fn new() -> Self {
        Self { pending: HashMap::new() }
    }

    /// Arm `key` for `deadline`, returning the deadline it replaced.
    pub fn schedule(&mut self, key: K, deadline: Instant) -> Option<Instant> {
        self.pending.insert(key, deadline)
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.pending.get(key).copied()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.pending.keys().cloned().collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn drain_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        self.pending.retain(|key, deadline| {
            if *deadline <= now {
                due.push((*deadline, key.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(deadline, _)| *deadline);
        due.into_iter().map(|(_, key)| key).collect()
    }
}

impl<K: Eq + Hash + Clone> Default for DeadlineQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// What the caller must do after scheduling a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    /// The max-delay bound was hit; flush before returning.
    FlushNow,
    /// A debounce timer is armed for the returned deadline.
    Deferred(Instant),
}

/// Timers that came due in one driver pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DueTimers {
    pub flush: Vec<Uuid>,
    pub rename: Vec<Uuid>,
}

impl DueTimers {
    pub fn is_empty(&self) -> bool {
        self.flush.is_empty() && self.rename.is_empty()
    }
}

#[derive(Debug, Default)]
struct Timers {
    flush: DeadlineQueue<Uuid>,
    rename: DeadlineQueue<Uuid>,
    last_flush: HashMap<Uuid, Instant>,
}

/// Timer state for every document. Callers hold the store lock while
/// mutating it so a rearm is atomic with the edit that caused it.
#[derive(Debug, Default)]
pub struct WriteScheduler {
    timers: Mutex<Timers>,
    wake: Notify,
}

impl WriteScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any pending flush for `id`, then either ask for an immediate
    /// flush (when `force_max_delay` is set and the last flush is at least
    /// [`WRITE_DELAY_MAX`] old) or arm a [`WRITE_DELAY_TYPING`] timer.
    pub fn schedule_write(&self, id: Uuid, force_max_delay: bool, now: Instant) -> WriteDecision {
        let mut timers = self.lock();
        timers.flush.cancel(&id);

        let overdue = timers
            .last_flush
            .get(&id)
            .is_some_and(|last| now.saturating_duration_since(*last) >= WRITE_DELAY_MAX);
        if force_max_delay && overdue {
            return WriteDecision::FlushNow;
        }

        let deadline = now + WRITE_DELAY_TYPING;
        timers.flush.schedule(id, deadline);
        drop(timers);
        self.wake.notify_one();
        WriteDecision::Deferred(deadline)
    }

    pub fn cancel_write(&self, id: Uuid) -> bool {
        self.lock().flush.cancel(&id)
    }

    pub fn record_flush(&self, id: Uuid, now: Instant) {
        self.lock().last_flush.insert(id, now);
    }

    /// (Re)arm the empty-rename timer for `id`.
    pub fn arm_empty_rename(&self, id: Uuid, now: Instant) {
        self.lock().rename.schedule(id, now + EMPTY_RENAME_DELAY);
        self.wake.notify_one();
    }

    pub fn cancel_empty_rename(&self, id: Uuid) -> bool {
        self.lock().rename.cancel(&id)
    }

    pub fn has_pending_write(&self, id: Uuid) -> bool {
        self.lock().flush.contains(&id)
    }

    pub fn has_pending_rename(&self, id: Uuid) -> bool {
        self.lock().rename.contains(&id)
    }

    /// Documents with a debounced flush still outstanding.
    pub fn pending_writes(&self) -> Vec<Uuid> {
        self.lock().flush.keys()
    }

    /// Drop all timer state for a deleted document.
    pub fn forget(&self, id: Uuid) {
        let mut timers = self.lock();
        timers.flush.cancel(&id);
        timers.rename.cancel(&id);
        timers.last_flush.remove(&id);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let timers = self.lock();
        match (timers.flush.next_deadline(), timers.rename.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn drain_due(&self, now: Instant) -> DueTimers {
        let mut timers = self.lock();
        DueTimers { flush: timers.flush.drain_due(now), rename: timers.rename.drain_due(now) }
    }

    /// Resolves when a timer has been armed since the last wait.
    pub async fn armed(&self) {
        self.wake.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    // ── DeadlineQueue ──────────────────────────────────────────────

    #[test]
    fn rescheduling_replaces_deadline() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();

        assert_eq!(queue.schedule("a", now + ms(100)), None);
        assert_eq!(queue.schedule("a", now + ms(300)), Some(now + ms(100)));
        assert_eq!(queue.len(), 1);

        assert!(queue.drain_due(now + ms(200)).is_empty());
        assert_eq!(queue.drain_due(now + ms(300)), vec!["a"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_returns_due_keys_earliest_first() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();
        queue.schedule("late", now + ms(50));
        queue.schedule("early", now + ms(10));
        queue.schedule("future", now + ms(500));

        assert_eq!(queue.next_deadline(), Some(now + ms(10)));
        assert_eq!(queue.drain_due(now + ms(60)), vec!["early", "late"]);
        assert_eq!(queue.next_deadline(), Some(now + ms(500)));
    }

    #[test]
    fn cancel_removes_pending_key() {
        let mut queue = DeadlineQueue::new();
        let now = Instant::now();
        queue.schedule(1, now);

        assert!(queue.cancel(&1));
        assert!(!queue.cancel(&1));
        assert!(queue.drain_due(now + ms(1)).is_empty());
        assert!(queue.next_deadline().is_none());
    }

    // ── WriteScheduler ─────────────────────────────────────────────

    #[test]
    fn first_write_is_always_deferred() {
        let scheduler = WriteScheduler::new();
        let id = Uuid::new_v4();
        let now = Instant::now();

        assert_eq!(scheduler.schedule_write(id, true, now), WriteDecision::Deferred(now + WRITE_DELAY_TYPING));
        assert!(scheduler.has_pending_write(id));
    }

    #[test]
    fn write_is_forced_once_max_delay_has_passed() {
        let scheduler = WriteScheduler::new();
        let id = Uuid::new_v4();
        let start = Instant::now();
        scheduler.record_flush(id, start);

        let just_before = start + WRITE_DELAY_MAX - ms(1);
        assert!(matches!(scheduler.schedule_write(id, true, just_before), WriteDecision::Deferred(_)));

        let at_bound = start + WRITE_DELAY_MAX;
        assert_eq!(scheduler.schedule_write(id, true, at_bound), WriteDecision::FlushNow);
        assert!(!scheduler.has_pending_write(id), "forced flush cancels the debounce");
    }

    #[test]
    fn max_delay_is_ignored_without_force_flag() {
        let scheduler = WriteScheduler::new();
        let id = Uuid::new_v4();
        let start = Instant::now();
        scheduler.record_flush(id, start);

        let later = start + WRITE_DELAY_MAX * 2;
        assert!(matches!(scheduler.schedule_write(id, false, later), WriteDecision::Deferred(_)));
    }

    #[test]
    fn rapid_writes_coalesce_into_one_deadline() {
        let scheduler = WriteScheduler::new();
        let id = Uuid::new_v4();
        let now = Instant::now();

        for step in 0..5 {
            scheduler.schedule_write(id, true, now + ms(step * 500));
        }
        let last = now + ms(2_000);

        assert!(scheduler.drain_due(last + WRITE_DELAY_TYPING - ms(1)).is_empty());
        let due = scheduler.drain_due(last + WRITE_DELAY_TYPING);
        assert_eq!(due.flush, vec![id]);
        assert!(due.rename.is_empty());
    }

    #[test]
    fn next_deadline_spans_both_queues() {
        let scheduler = WriteScheduler::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Instant::now();

        scheduler.arm_empty_rename(a, now);
        assert_eq!(scheduler.next_deadline(), Some(now + EMPTY_RENAME_DELAY));

        scheduler.schedule_write(b, true, now);
        assert_eq!(scheduler.next_deadline(), Some(now + WRITE_DELAY_TYPING));

        let due = scheduler.drain_due(now + EMPTY_RENAME_DELAY);
        assert_eq!(due, DueTimers { flush: vec![b], rename: vec![a] });
        assert!(scheduler.next_deadline().is_none());
    }

    #[test]
    fn forget_clears_every_timer() {
        let scheduler = WriteScheduler::new();
        let id = Uuid::new_v4();
        let now = Instant::now();
        scheduler.record_flush(id, now);
        scheduler.schedule_write(id, true, now);
        scheduler.arm_empty_rename(id, now);

        scheduler.forget(id);
        assert!(!scheduler.has_pending_write(id));
        assert!(!scheduler.has_pending_rename(id));
        assert!(scheduler.drain_due(now + WRITE_DELAY_MAX).is_empty());
        assert!(
            matches!(scheduler.schedule_write(id, true, now + WRITE_DELAY_MAX), WriteDecision::Deferred(_)),
            "flush history is forgotten too"
        );
    }

    #[tokio::test]
    async fn arming_a_timer_wakes_the_driver() {
        let scheduler = WriteScheduler::new();
        scheduler.schedule_write(Uuid::new_v4(), true, Instant::now());
        tokio::time::timeout(ms(100), scheduler.armed()).await.expect("permit stored by notify_one");
    }
}

//! Bounded priority queue for triaged alerts.
//!
//! Generalizes the agent scheduler's `BinaryHeap` + index-map queue to
//! order by `(priority, score, age)` instead of a bare `Priority`, and to
//! age entries so a long-waiting `MEDIUM` alert can eventually outrank a
//! freshly-enqueued one. Ordering is computed live at pop/peek time
//! against the caller's `now`, rather than baked into a `BinaryHeap`'s
//! stored order — with a bounded queue size this linear scan is cheap
//! and it sidesteps the "heap order goes stale as time passes" problem
//! a real `BinaryHeap` would have.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::types::{Alert, IncidentId, Priority};

/// Trait for items the queue can order and index by incident.
pub trait HasIncidentId {
    fn incident_id(&self) -> IncidentId;
}

impl HasIncidentId for Alert {
    fn incident_id(&self) -> IncidentId {
        self.id
    }
}

/// Score added per 30-second interval an alert has waited, capped so
/// aging alone cannot push a LOW alert past a freshly-enqueued CRITICAL
/// one; it can only close the gap within adjacent tiers.
const AGING_INCREMENT_PER_TICK: f64 = 0.05;
const AGING_TICK: Duration = Duration::from_secs(30);
const AGING_CAP: f64 = 0.3;

fn effective_score(score: f64, age: Duration) -> f64 {
    let ticks = (age.as_secs_f64() / AGING_TICK.as_secs_f64()).floor();
    let bonus = (ticks * AGING_INCREMENT_PER_TICK).min(AGING_CAP);
    (score + bonus).min(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
struct OrderKey {
    priority: Priority,
    score: f64,
    age: Duration,
}

impl OrderKey {
    fn for_alert(alert: &Alert, now: SystemTime) -> Self {
        let age = alert.age(now);
        let score = effective_score(alert.score, age);
        Self {
            priority: Priority::from_score(score).max(alert.priority),
            score,
            age,
        }
    }

    /// Total order: priority, then score, then age (older wins ties).
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.score.partial_cmp(&other.score).unwrap_or(std::cmp::Ordering::Equal))
            .then(self.age.cmp(&other.age))
    }
}

/// A bounded priority queue of alerts awaiting scheduling.
#[derive(Debug)]
pub struct PriorityQueue<T = Alert> {
    items: Vec<T>,
    index: HashMap<IncidentId, usize>,
    capacity: usize,
}

impl<T> PriorityQueue<T>
where
    T: Clone + HasIncidentId,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: &IncidentId) -> bool {
        self.index.contains_key(id)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (idx, item) in self.items.iter().enumerate() {
            self.index.insert(item.incident_id(), idx);
        }
    }

    pub fn remove(&mut self, id: &IncidentId) -> Option<T> {
        let idx = self.index.remove(id)?;
        let item = self.items.remove(idx);
        self.rebuild_index();
        Some(item)
    }
}

impl PriorityQueue<Alert> {
    /// Insert an alert. If the queue is full, evicts the current
    /// lowest-ranked alert to make room when `alert` outranks it;
    /// otherwise `alert` itself is rejected and returned as `Err`.
    /// Returns `Ok(evicted)` where `evicted` is `Some` only when an
    /// existing entry was bumped to make room.
    pub fn push(&mut self, alert: Alert, now: SystemTime) -> Result<Option<Alert>, Alert> {
        if self.items.len() < self.capacity {
            self.index.insert(alert.id, self.items.len());
            self.items.push(alert);
            return Ok(None);
        }

        let worst_idx = self.worst_index(now).expect("non-empty when at capacity");
        let worst_key = OrderKey::for_alert(&self.items[worst_idx], now);
        let incoming_key = OrderKey::for_alert(&alert, now);
        if incoming_key.cmp(&worst_key) == std::cmp::Ordering::Greater {
            let evicted = self.items.remove(worst_idx);
            self.items.push(alert);
            self.rebuild_index();
            Ok(Some(evicted))
        } else {
            Err(alert)
        }
    }

    fn best_index(&self, now: SystemTime) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| OrderKey::for_alert(a, now).cmp(&OrderKey::for_alert(b, now)))
            .map(|(idx, _)| idx)
    }

    fn worst_index(&self, now: SystemTime) -> Option<usize> {
        self.items
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| OrderKey::for_alert(a, now).cmp(&OrderKey::for_alert(b, now)))
            .map(|(idx, _)| idx)
    }

    pub fn peek(&self, now: SystemTime) -> Option<&Alert> {
        self.best_index(now).map(|idx| &self.items[idx])
    }

    pub fn pop(&mut self, now: SystemTime) -> Option<Alert> {
        let idx = self.best_index(now)?;
        let item = self.items.remove(idx);
        self.rebuild_index();
        Some(item)
    }

    /// Overrides a queued alert's priority tier directly, independent of
    /// aging (used by manual priority bumps). Returns `false` if no
    /// alert with that id is queued.
    pub fn update_priority(&mut self, id: &IncidentId, priority: Priority) -> bool {
        match self.index.get(id) {
            Some(&idx) => {
                self.items[idx].priority = priority;
                true
            }
            None => false,
        }
    }

    /// Every queued alert matching `predicate`.
    pub fn find_alerts(&self, predicate: impl Fn(&Alert) -> bool) -> Vec<&Alert> {
        self.items.iter().filter(|a| predicate(a)).collect()
    }

    /// Snapshot of queue-wide statistics for observability.
    pub fn metrics(&self, now: SystemTime) -> QueueMetrics {
        let total_queued = self.items.len();
        let mut counts_by_priority: HashMap<Priority, usize> = HashMap::new();
        let mut total_wait = Duration::ZERO;
        let mut total_score = 0.0;
        let mut oldest_enqueued_at = None;
        for alert in &self.items {
            *counts_by_priority.entry(alert.priority).or_insert(0) += 1;
            total_wait += alert.age(now);
            total_score += alert.score;
            oldest_enqueued_at = Some(match oldest_enqueued_at {
                Some(existing) if existing <= alert.enqueued_at => existing,
                _ => alert.enqueued_at,
            });
        }
        let average_wait = if total_queued > 0 { total_wait / total_queued as u32 } else { Duration::ZERO };
        let average_score = if total_queued > 0 { total_score / total_queued as f64 } else { 0.0 };
        QueueMetrics {
            total_queued,
            counts_by_priority,
            average_wait,
            average_score,
            oldest_enqueued_at,
        }
    }

    /// Discrete aging pass: invoked on a fixed tick by the scheduler
    /// rather than only computed lazily at pop/peek time. Persists the
    /// aged score onto each stored alert and, when the aged score
    /// crosses a tier boundary, promotes LOW -> MEDIUM or MEDIUM ->
    /// HIGH in place. Aging alone never promotes past HIGH, matching
    /// `effective_score`'s cap. Returns `true` if any entry's priority
    /// changed, which invalidates any cached ordering derived from the
    /// old tiers.
    pub fn age_tick(&mut self, now: SystemTime) -> bool {
        let mut changed = false;
        for alert in self.items.iter_mut() {
            let aged = effective_score(alert.score, alert.age(now));
            if aged > alert.score {
                alert.score = aged;
            }
            let promoted = match alert.priority {
                Priority::Low if alert.score > 0.4 => Some(Priority::Medium),
                Priority::Medium if alert.score > 0.65 => Some(Priority::High),
                _ => None,
            };
            if let Some(new_priority) = promoted {
                alert.priority = new_priority;
                changed = true;
            }
        }
        if changed {
            self.rebuild_index();
        }
        changed
    }
}

/// Queue-wide statistics snapshot returned by `PriorityQueue::metrics`.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub total_queued: usize,
    pub counts_by_priority: HashMap<Priority, usize>,
    pub average_wait: Duration,
    pub average_score: f64,
    pub oldest_enqueued_at: Option<SystemTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogRecord, PriorityBreakdown};
    use std::collections::HashMap as StdHashMap;

    fn make_alert(priority: Priority, score: f64, age_secs: u64) -> Alert {
        let now = SystemTime::now();
        Alert {
            id: IncidentId::new(),
            log: LogRecord::new("boom"),
            reason: "test".into(),
            priority,
            score,
            breakdown: PriorityBreakdown::default(),
            reasoning: String::new(),
            est_duration_ms: 1000,
            enqueued_at: now - Duration::from_secs(age_secs),
            session_id: None,
            metadata: StdHashMap::new(),
        }
    }

    #[test]
    fn pops_highest_priority_first() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(10);
        q.push(make_alert(Priority::Low, 0.1, 0), now).unwrap();
        q.push(make_alert(Priority::Critical, 0.9, 0), now).unwrap();
        q.push(make_alert(Priority::Medium, 0.5, 0), now).unwrap();

        assert_eq!(q.pop(now).unwrap().priority, Priority::Critical);
        assert_eq!(q.pop(now).unwrap().priority, Priority::Medium);
        assert_eq!(q.pop(now).unwrap().priority, Priority::Low);
    }

    #[test]
    fn remove_by_id_drops_the_right_entry() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(10);
        let a = make_alert(Priority::High, 0.7, 0);
        let b = make_alert(Priority::Medium, 0.5, 0);
        let b_id = b.id;
        q.push(a, now).unwrap();
        q.push(b, now).unwrap();

        assert!(q.contains(&b_id));
        let removed = q.remove(&b_id).unwrap();
        assert_eq!(removed.id, b_id);
        assert_eq!(q.len(), 1);
        assert!(!q.contains(&b_id));
    }

    #[test]
    fn capacity_eviction_prefers_the_more_urgent_incoming_alert() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(2);
        q.push(make_alert(Priority::Low, 0.1, 0), now).unwrap();
        q.push(make_alert(Priority::Medium, 0.5, 0), now).unwrap();

        let evicted = q.push(make_alert(Priority::Critical, 0.95, 0), now).unwrap();
        assert!(evicted.is_some());
        assert_eq!(evicted.unwrap().priority, Priority::Low);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn capacity_eviction_rejects_a_less_urgent_incoming_alert() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(1);
        q.push(make_alert(Priority::Critical, 0.95, 0), now).unwrap();

        let rejected = q.push(make_alert(Priority::Low, 0.05, 0), now);
        assert!(rejected.is_err());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn update_priority_overrides_the_stored_tier() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(10);
        let a = make_alert(Priority::Low, 0.1, 0);
        let id = a.id;
        q.push(a, now).unwrap();

        assert!(q.update_priority(&id, Priority::Critical));
        assert_eq!(q.to_vec()[0].priority, Priority::Critical);
        assert!(!q.update_priority(&IncidentId::new(), Priority::High));
    }

    #[test]
    fn find_alerts_filters_by_predicate() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(10);
        q.push(make_alert(Priority::Low, 0.1, 0), now).unwrap();
        q.push(make_alert(Priority::Critical, 0.9, 0), now).unwrap();

        let found = q.find_alerts(|a| a.priority == Priority::Critical);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].priority, Priority::Critical);
    }

    #[test]
    fn metrics_summarize_the_queue() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(10);
        q.push(make_alert(Priority::Low, 0.2, 60), now).unwrap();
        q.push(make_alert(Priority::High, 0.8, 0), now).unwrap();

        let m = q.metrics(now);
        assert_eq!(m.total_queued, 2);
        assert_eq!(m.counts_by_priority.get(&Priority::Low), Some(&1));
        assert_eq!(m.counts_by_priority.get(&Priority::High), Some(&1));
        assert!(m.oldest_enqueued_at.is_some());
    }

    #[test]
    fn age_tick_promotes_a_stale_low_alert_to_medium() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(10);
        // score 0.38 + aging cap 0.3 = 0.68, crossing the 0.4 LOW->MEDIUM
        // boundary well before the 0.65 MEDIUM->HIGH one.
        let a = make_alert(Priority::Low, 0.38, 600);
        let id = a.id;
        q.push(a, now).unwrap();

        let changed = q.age_tick(now);
        assert!(changed);
        let updated = q.to_vec().into_iter().find(|a| a.id == id).unwrap();
        assert_eq!(updated.priority, Priority::Medium);
    }

    #[test]
    fn age_tick_is_a_no_op_on_fresh_alerts() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(10);
        q.push(make_alert(Priority::Low, 0.1, 0), now).unwrap();

        assert!(!q.age_tick(now));
    }

    #[test]
    fn aging_lets_an_old_medium_alert_outrank_a_fresh_one() {
        let now = SystemTime::now();
        let mut q: PriorityQueue<Alert> = PriorityQueue::new(10);
        // old alert has been waiting 10 aging ticks (300s): +0.3 bonus, capped.
        let old = make_alert(Priority::Medium, 0.5, 300);
        let fresh = make_alert(Priority::Medium, 0.55, 0);
        q.push(old.clone(), now).unwrap();
        q.push(fresh, now).unwrap();

        let popped = q.pop(now).unwrap();
        assert_eq!(popped.id, old.id);
    }
}

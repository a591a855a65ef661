//! Trailing-edge save throttle.
//!
//! The first write to an idle key schedules a save one window later. Writes
//! arriving while that save is pending are absorbed by it; the next write
//! after the save fires starts a new window.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

pub struct SaveThrottle<K> {
    window: Duration,
    pending: HashMap<K, Instant>,
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K: Clone + Eq + Hash + Ord> SaveThrottle<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Note a write to `key`. Returns `true` if this started a new window.
    pub fn request(&mut self, key: K) -> bool {
        self.request_at(key, Instant::now())
    }

    pub fn request_at(&mut self, key: K, now: Instant) -> bool {
        if self.pending.contains_key(&key) {
            return false;
        }
        let deadline = now + self.window;
        self.pending.insert(key.clone(), deadline);
        self.heap.push(Reverse((deadline, key)));
        true
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Earliest scheduled save, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.pop_stale();
        self.heap.peek().map(|Reverse((t, _))| *t)
    }

    /// Remove and return every key whose window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        loop {
            self.pop_stale();
            let Some(Reverse((fire_at, _))) = self.heap.peek() else {
                break;
            };
            if *fire_at > now {
                break;
            }
            if let Some(Reverse((fire_at, key))) = self.heap.pop() {
                if self.pending.get(&key) == Some(&fire_at) {
                    self.pending.remove(&key);
                    due.push(key);
                }
            }
        }
        due
    }

    /// Remove and return every pending key regardless of deadline.
    pub fn take_all(&mut self) -> Vec<K> {
        self.heap.clear();
        let mut keys: Vec<K> = self.pending.drain().map(|(k, _)| k).collect();
        keys.sort();
        keys
    }

    fn pop_stale(&mut self) {
        while let Some(Reverse((fire_at, key))) = self.heap.peek() {
            if self.pending.get(key) == Some(fire_at) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(500);

    #[test]
    fn test_first_write_schedules_trailing_save() {
        let mut throttle = SaveThrottle::new(WINDOW);
        let t0 = Instant::now();
        assert!(throttle.request_at("a", t0));
        assert_eq!(throttle.next_deadline(), Some(t0 + WINDOW));
        assert!(throttle.take_due(t0 + Duration::from_millis(499)).is_empty());
        assert_eq!(throttle.take_due(t0 + WINDOW), vec!["a"]);
        assert!(throttle.next_deadline().is_none());
    }

    #[test]
    fn test_writes_inside_window_are_absorbed() {
        let mut throttle = SaveThrottle::new(WINDOW);
        let t0 = Instant::now();
        assert!(throttle.request_at("a", t0));
        assert!(!throttle.request_at("a", t0 + Duration::from_millis(100)));
        assert!(!throttle.request_at("a", t0 + Duration::from_millis(400)));
        // The deadline does not slide.
        assert_eq!(throttle.next_deadline(), Some(t0 + WINDOW));
        assert_eq!(throttle.take_due(t0 + WINDOW), vec!["a"]);

        // A later write opens a new window.
        let t1 = t0 + Duration::from_millis(600);
        assert!(throttle.request_at("a", t1));
        assert_eq!(throttle.next_deadline(), Some(t1 + WINDOW));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut throttle = SaveThrottle::new(WINDOW);
        let t0 = Instant::now();
        throttle.request_at("a", t0);
        throttle.request_at("b", t0 + Duration::from_millis(200));
        assert_eq!(throttle.pending_count(), 2);
        assert_eq!(throttle.take_due(t0 + WINDOW), vec!["a"]);
        assert!(throttle.is_pending(&"b"));
        assert_eq!(
            throttle.take_due(t0 + Duration::from_millis(700)),
            vec!["b"]
        );
    }

    #[test]
    fn test_take_all_clears_everything() {
        let mut throttle = SaveThrottle::new(WINDOW);
        let t0 = Instant::now();
        throttle.request_at("b", t0);
        throttle.request_at("a", t0);
        assert_eq!(throttle.take_all(), vec!["a", "b"]);
        assert!(throttle.next_deadline().is_none());
        assert!(throttle.take_due(t0 + WINDOW).is_empty());
    }
}

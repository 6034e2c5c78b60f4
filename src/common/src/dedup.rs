//! Bounded, deduplicating work set.
//!
//! Holds at most `capacity` distinct items. Adding an item that is already
//! pending is a no-op, and adding past capacity is refused rather than
//! evicting older work. Items come back out in the order they were first
//! added.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Debug)]
pub struct DedupSet<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    available: Notify,
}

#[derive(Debug)]
struct State<T> {
    members: HashSet<T>,
    order: VecDeque<T>,
}

impl<T> DedupSet<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                members: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            available: Notify::new(),
        }
    }

    /// Add `item`, returning `true` only when it was not already pending and
    /// the set had room for it.
    pub fn add(&self, item: T) -> bool {
        let added = {
            let mut state = self.lock();
            if state.members.len() >= self.capacity || state.members.contains(&item) {
                false
            } else {
                state.members.insert(item.clone());
                state.order.push_back(item);
                true
            }
        };
        if added {
            self.available.notify_one();
        }
        added
    }

    /// Remove the oldest pending item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.lock();
        let item = state.order.pop_front()?;
        state.members.remove(&item);
        Some(item)
    }

    /// Remove the oldest pending item, waiting until one is available.
    ///
    /// Cancel safe: dropping the future never loses an item.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        self.lock().members.contains(item)
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        // State is always left consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

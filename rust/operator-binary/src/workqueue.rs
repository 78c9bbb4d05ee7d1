//! Queue of distinct keys, where every key is handed to at most one worker at a time
//!
//! Adding a key that is already queued is a no-op. Adding a key that is currently being processed
//! marks it as dirty, so that it is queued again once the worker calls [`WorkQueue::done`].

use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::Notify;

#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    /// The delay before the `requeues`th retry (starting at 1)
    pub fn delay(&self, requeues: u32) -> Duration {
        let exponent = requeues.saturating_sub(1).min(63);
        self.base
            .checked_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need to be processed, whether queued or not
    dirty: HashSet<K>,
    processing: HashSet<K>,
    requeues: HashMap<K, u32>,
    shutting_down: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

pub struct WorkQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K: Clone + Eq + Hash + Send + 'static> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

impl<K: Clone + Eq + Hash + Send + 'static> WorkQueue<K> {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    requeues: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        // None of the critical sections can leave the state inconsistent
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing processing
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Waits for the next key to process
    ///
    /// Returns [`None`] once the queue has been shut down and all remaining keys have been handed out.
    /// Every key returned must be released by calling [`Self::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so that an add in between is not missed
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Permits don't accumulate, so pass the wakeup along
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases a key returned by [`Self::get`], queueing it again if it was added in the meantime
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Stops accepting new keys, and wakes up all waiting workers
    ///
    /// Keys that are already queued will still be handed out.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Adds `key` once `delay` has passed
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            return self.add(key);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds `key` after an exponentially increasing delay, based on how often it has been requeued so far
    pub fn add_rate_limited(&self, key: K) {
        let requeues = {
            let mut state = self.state();
            let requeues = state.requeues.entry(key.clone()).or_default();
            *requeues = requeues.saturating_add(1);
            *requeues
        };
        self.add_after(key, self.shared.backoff.delay(requeues));
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().requeues.get(key).copied().unwrap_or(0)
    }

    /// Resets the retry count of `key`
    pub fn forget(&self, key: &K) {
        self.state().requeues.remove(key);
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

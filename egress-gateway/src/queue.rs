use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use tokio::sync::Notify;

/// Rate-limited work queue with per-item exponential retry backoff.
///
/// Items are deduplicated while queued; an item re-added during processing is
/// requeued once its processing completes. `shut_down` lets the queue drain,
/// then `get` returns `None`.
#[derive(Clone)]
pub(crate) struct RetryQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

struct State<T> {
    queue: VecDeque<T>,
    queued: HashSet<T>,
    processing: HashSet<T>,
    dirty: HashSet<T>,
    failures: HashMap<T, u32>,
    shutdown: bool,
}

impl<T: Clone + Eq + Hash + Send + 'static> RetryQueue<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    queued: HashSet::new(),
                    processing: HashSet::new(),
                    dirty: HashSet::new(),
                    failures: HashMap::new(),
                    shutdown: false,
                }),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    pub fn add(&self, item: T) {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        if state.processing.contains(&item) {
            state.dirty.insert(item);
            return;
        }
        if state.queued.insert(item.clone()) {
            state.queue.push_back(item);
            self.shared.notify.notify_one();
        }
    }

    /// Re-adds the item after its current backoff delay, then doubles the
    /// delay up to the cap.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            let attempts = state.failures.entry(item.clone()).or_insert(0);
            let delay = backoff(self.shared.base_delay, self.shared.max_delay, *attempts);
            *attempts += 1;
            delay
        };

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Resets the backoff state for an item that was processed successfully.
    pub fn forget(&self, item: &T) {
        let mut state = self.shared.state.lock().unwrap();
        state.failures.remove(item);
    }

    /// Marks processing of an item complete, requeueing it if it was added
    /// again in the meantime.
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock().unwrap();
        state.processing.remove(item);
        if state.dirty.remove(item) && state.queued.insert(item.clone()) {
            state.queue.push_back(item.clone());
            self.shared.notify.notify_one();
        }
    }

    /// Next item to process, or `None` once the queue has been shut down and
    /// drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(item) = state.queue.pop_front() {
                    state.queued.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn shut_down(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        self.shared.notify.notify_waiters();
    }
}

fn backoff(base: Duration, max: Duration, attempts: u32) -> Duration {
    let delay = base.saturating_mul(2u32.saturating_pow(attempts));
    delay.min(max)
}

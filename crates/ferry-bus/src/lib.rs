//! In-process publish/subscribe.
//!
//! Messages sent to a topic are delivered to that topic's listeners in send order. Each
//! topic has at most one delivery task at a time, so topics never block each other beyond
//! sharing the worker pool.

mod pool;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ferry_config::BusConfig;
use parking_lot::Mutex;

use crate::pool::WorkerPool;

/// Messages handed to listeners per delivery task before it yields the worker.
const MAX_BATCH: usize = 64;

pub trait EventListener<M>: Send + Sync {
    fn on_message(&self, topic: &str, message: &M);
}

impl<M, F> EventListener<M> for F
where
    F: Fn(&str, &M) + Send + Sync,
{
    fn on_message(&self, topic: &str, message: &M) {
        self(topic, message)
    }
}

/// Returned by [`EventBus::subscribe`]; pass it back to [`EventBus::unsubscribe`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

struct TopicState<M> {
    listeners: Vec<(u64, Arc<dyn EventListener<M>>)>,
    queue: VecDeque<M>,
    scheduled: bool,
}

struct Topic<M> {
    name: String,
    state: Mutex<TopicState<M>>,
}

struct Inner<M> {
    pool: WorkerPool,
    // Lock order: `topics`, then a topic's `state`.
    topics: Mutex<HashMap<String, Arc<Topic<M>>>>,
    next_id: AtomicU64,
}

pub struct EventBus<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for EventBus<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> std::fmt::Debug for EventBus<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.topic_count())
            .finish()
    }
}

impl<M: Send + 'static> EventBus<M> {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool: WorkerPool::build("ferry-bus", config.worker_threads),
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(
        &self,
        topic: &str,
        listener: impl EventListener<M> + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Arc<dyn EventListener<M>> = Arc::new(listener);
        let mut topics = self.inner.topics.lock();
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            Arc::new(Topic {
                name: topic.to_string(),
                state: Mutex::new(TopicState {
                    listeners: Vec::new(),
                    queue: VecDeque::new(),
                    scheduled: false,
                }),
            })
        });
        entry.state.lock().listeners.push((id, listener));
        tracing::trace!(target: "ferry.bus", topic, id, "subscribed");
        Subscription {
            topic: topic.to_string(),
            id,
        }
    }

    /// Remove a listener. Returns `false` if it was already removed.
    ///
    /// Messages queued for a topic whose last listener leaves are discarded.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut topics = self.inner.topics.lock();
        let Some(topic) = topics.get(&subscription.topic).cloned() else {
            return false;
        };
        let mut state = topic.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(id, _)| *id != subscription.id);
        let removed = state.listeners.len() != before;
        if state.listeners.is_empty() {
            state.queue.clear();
            // A scheduled delivery task collects the topic when it finishes.
            if !state.scheduled {
                topics.remove(&subscription.topic);
            }
        }
        removed
    }

    /// Queue `message` for the listeners of `topic`. Returns `false` (and drops the message)
    /// when the topic has no listeners.
    pub fn send(&self, topic: &str, message: M) -> bool {
        let Some(topic) = self.inner.topics.lock().get(topic).cloned() else {
            return false;
        };
        let mut state = topic.state.lock();
        if state.listeners.is_empty() {
            return false;
        }
        state.queue.push_back(message);
        if state.scheduled {
            return true;
        }
        state.scheduled = true;
        drop(state);

        let inner = self.inner.clone();
        self.inner.pool.spawn(move || run_delivery(inner, topic));
        true
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        match self.inner.topics.lock().get(topic) {
            Some(topic) => topic.state.lock().listeners.len(),
            None => 0,
        }
    }
}

impl<M> EventBus<M> {
    /// Topics currently holding listeners or undelivered messages.
    pub fn topic_count(&self) -> usize {
        self.inner.topics.lock().len()
    }
}

fn run_delivery<M: Send + 'static>(inner: Arc<Inner<M>>, topic: Arc<Topic<M>>) {
    if inner.pool.is_inline() {
        while deliver_batch(&inner, &topic) {}
        return;
    }
    if deliver_batch(&inner, &topic) {
        let pool_inner = inner.clone();
        inner.pool.spawn(move || run_delivery(pool_inner, topic));
    }
}

/// Deliver one batch. Returns `true` if the task must run again.
fn deliver_batch<M>(inner: &Inner<M>, topic: &Topic<M>) -> bool {
    let (batch, listeners) = {
        let mut state = topic.state.lock();
        let take = state.queue.len().min(MAX_BATCH);
        let batch: Vec<M> = state.queue.drain(..take).collect();
        let listeners: Vec<_> = state
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        (batch, listeners)
    };

    for message in &batch {
        for listener in &listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_message(&topic.name, message)
            }));
            if let Err(payload) = outcome {
                tracing::warn!(
                    target: "ferry.bus",
                    topic = %topic.name,
                    panic = %panic_message(payload.as_ref()),
                    "listener panicked"
                );
            }
        }
    }

    let mut topics = inner.topics.lock();
    let mut state = topic.state.lock();
    if state.listeners.is_empty() {
        state.queue.clear();
    }
    if !state.queue.is_empty() {
        return true;
    }
    state.scheduled = false;
    if state.listeners.is_empty() {
        let current = topics
            .get(&topic.name)
            .is_some_and(|registered| std::ptr::eq(Arc::as_ptr(registered), topic));
        if current {
            topics.remove(&topic.name);
            tracing::trace!(target: "ferry.bus", topic = %topic.name, "collected idle topic");
        }
    }
    false
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

//! Per-key collapsing of concurrent identical fetches.
//!
//! The first caller for a key becomes the leader and performs the fetch;
//! everyone else joining while it is in flight awaits the leader's result.
//! The in-flight marker is removed on success, failure, and cancellation
//! alike: a leader that never completes (dropped future, error) closes the
//! channel, and followers observe the closure instead of hanging.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

struct Inner<K, V> {
    inflight: Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
}

pub struct SingleFlight<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

pub enum Flight<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Caller owns the fetch; it must call [`FlightGuard::complete`] (or
    /// drop the guard on failure).
    Leader(FlightGuard<K, V>),
    /// Another caller is already fetching; await its result.
    Follower(watch::Receiver<Option<V>>),
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn begin(&self, key: K) -> Flight<K, V> {
        let mut inflight = self.inner.inflight.lock();
        if let Some(receiver) = inflight.get(&key) {
            return Flight::Follower(receiver.clone());
        }
        let (sender, receiver) = watch::channel(None);
        inflight.insert(key.clone(), receiver);
        Flight::Leader(FlightGuard {
            inner: Arc::clone(&self.inner),
            key,
            sender: Some(sender),
        })
    }

    #[cfg(test)]
    fn inflight_len(&self) -> usize {
        self.inner.inflight.lock().len()
    }
}

pub struct FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
{
    inner: Arc<Inner<K, V>>,
    key: K,
    sender: Option<watch::Sender<Option<V>>>,
}

impl<K, V> FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Publishes the result to every follower and clears the marker.
    pub fn complete(mut self, value: V) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Some(value));
        }
        self.inner.inflight.lock().remove(&self.key);
    }
}

impl<K, V> Drop for FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        // leader bailed without publishing; clear the marker so the next
        // caller retries, and let the closed channel wake the followers
        if self.sender.is_some() {
            self.inner.inflight.lock().remove(&self.key);
        }
    }
}

/// Awaits the leader's published value; `None` means the leader failed or
/// was cancelled and the caller should surface its own error.
pub async fn await_leader<V: Clone>(mut receiver: watch::Receiver<Option<V>>) -> Option<V> {
    loop {
        let current = receiver.borrow().clone();
        if current.is_some() {
            return current;
        }
        if receiver.changed().await.is_err() {
            return receiver.borrow().clone();
        }
    }
}

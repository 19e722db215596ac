//! Deduplication of concurrent computations by key.
//!
//! Each computation is spawned as its own task and its outcome is broadcast
//! through a shared oneshot receiver, so a caller that gives up waiting never
//! cancels the work other callers are still waiting for.

use crate::error::{GatewayError, GatewayResult};
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type Ticket<T> = Shared<oneshot::Receiver<GatewayResult<T>>>;
type TicketMap<K, T> = Arc<Mutex<HashMap<K, Ticket<T>>>>;

/// Removes the ticket from the registry when dropped, including on panic.
struct RemoveOnDrop<K: Eq + Hash, T> {
    key: Option<K>,
    tickets: TicketMap<K, T>,
}

impl<K: Eq + Hash, T> Drop for RemoveOnDrop<K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.tickets.lock().remove(&key);
        }
    }
}

pub struct SingleFlight<K, T> {
    name: &'static str,
    tickets: TicketMap<K, T>,
    wait_timeout: Duration,
}

impl<K, T> fmt::Debug for SingleFlight<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight")
            .field("name", &self.name)
            .field("in_flight", &self.tickets.lock().len())
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, wait_timeout: Duration) -> Self {
        Self {
            name,
            tickets: Arc::new(Mutex::new(HashMap::new())),
            wait_timeout,
        }
    }

    /// Runs `computation` unless one is already in flight for `key`, in which
    /// case the caller waits for that one's outcome instead.
    pub async fn run<F, Fut>(&self, key: K, computation: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let ticket = {
            let mut tickets = self.tickets.lock();
            if let Some(ticket) = tickets.get(&key) {
                debug!("{}: joined in-flight computation for {}", self.name, key);
                ticket.clone()
            } else {
                let ticket = self.spawn(key.clone(), computation());
                tickets.insert(key.clone(), ticket.clone());
                ticket
            }
        };

        match tokio::time::timeout(self.wait_timeout, ticket).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(oneshot::Canceled)) => Err(GatewayError::Internal(format!(
                "{} computation for {} was aborted",
                self.name, key
            ))),
            Err(_) => Err(GatewayError::Upstream(format!(
                "timed out after {:?} waiting for {} of {}",
                self.wait_timeout, self.name, key
            ))),
        }
    }

    fn spawn<Fut>(&self, key: K, computation: Fut) -> Ticket<T>
    where
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let guard = RemoveOnDrop {
            key: Some(key),
            tickets: self.tickets.clone(),
        };

        tokio::spawn(async move {
            let outcome = computation.await;
            // Evict before publishing so late callers either see this ticket or start a new one.
            drop(guard);
            sender.send(outcome).ok();
        });

        receiver.shared()
    }

    pub fn in_flight(&self) -> usize {
        self.tickets.lock().len()
    }
}

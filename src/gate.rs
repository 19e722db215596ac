//! Serializes outbound upstream calls and spaces them by a minimum gap.
//!
//! Callers push a ticket onto a FIFO queue drained by one worker task. The
//! worker waits until `last_dispatch + min_gap`, then hands the slot to the
//! ticket owner, who issues its call. Tickets whose owner has gone away are
//! skipped without consuming a slot.

use crate::error::{GatewayError, GatewayResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

type Slot = oneshot::Sender<Instant>;

#[derive(Debug, Clone)]
pub struct UpstreamGate {
    queue: mpsc::UnboundedSender<Slot>,
    wait_timeout: Duration,
}

impl UpstreamGate {
    /// Spawns the dispatch worker on the current runtime.
    pub fn new(min_gap: Duration, wait_timeout: Duration) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(pending, min_gap));
        Self {
            queue,
            wait_timeout,
        }
    }

    /// Waits for this call's turn, then issues it.
    pub async fn enqueue<F, Fut, T>(&self, call: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (slot, turn) = oneshot::channel();
        self.queue
            .send(slot)
            .map_err(|_| GatewayError::Internal("upstream gate worker has stopped".into()))?;

        match tokio::time::timeout(self.wait_timeout, turn).await {
            Ok(Ok(_dispatched_at)) => Ok(call().await),
            Ok(Err(_)) => Err(GatewayError::Internal(
                "upstream gate dropped a queued call".into(),
            )),
            Err(_) => {
                warn!("gave up after {:?} in the upstream queue", self.wait_timeout);
                Err(GatewayError::Upstream(format!(
                    "timed out after {:?} waiting for an upstream slot",
                    self.wait_timeout
                )))
            }
        }
    }
}

async fn dispatch_loop(mut pending: mpsc::UnboundedReceiver<Slot>, min_gap: Duration) {
    let mut last_dispatch: Option<Instant> = None;
    while let Some(slot) = pending.recv().await {
        if slot.is_closed() {
            continue;
        }
        if let Some(last) = last_dispatch {
            tokio::time::sleep_until(last + min_gap).await;
        }
        let now = Instant::now();
        if slot.send(now).is_ok() {
            last_dispatch = Some(now);
            debug!("upstream slot dispatched");
        }
    }
}

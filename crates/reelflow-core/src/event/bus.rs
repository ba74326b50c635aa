//! Broadcast bus carrying [`JobEvent`]s from the executor to watchers.
//!
//! Publishing never blocks a run. A watcher that falls behind loses the
//! oldest events and keeps going; the job document stays the record of what
//! happened.

use reelflow_types::event::JobEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

/// Events buffered per subscriber before the oldest are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Multi-consumer event bus for job execution events.
///
/// Cloning the bus clones the sender, so the executor and batch workers can
/// share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Watch every job's events from now on.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription::new(self.sender.subscribe(), None)
    }

    /// Watch one job's events from now on. Events of other jobs in the same
    /// batch are dropped on receipt.
    pub fn subscribe_job(&self, job_id: &str) -> EventSubscription {
        EventSubscription::new(self.sender.subscribe(), Some(job_id.to_string()))
    }

    /// Publish to current subscribers. A no-op when nobody is watching.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiving end of an [`EventBus`], optionally narrowed to one job.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<JobEvent>,
    job_id: Option<String>,
    missed: u64,
}

impl EventSubscription {
    fn new(receiver: broadcast::Receiver<JobEvent>, job_id: Option<String>) -> Self {
        Self {
            receiver,
            job_id,
            missed: 0,
        }
    }

    /// Wait for the next matching event. `None` once the bus is dropped.
    ///
    /// Events lost to lag are counted in [`missed`](Self::missed) and skipped.
    pub async fn next(&mut self) -> Option<JobEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => self.lagged(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<JobEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(n)) => self.lagged(n),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Events dropped because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn wants(&self, event: &JobEvent) -> bool {
        self.job_id.as_deref().is_none_or(|id| event.job_id() == id)
    }

    fn lagged(&mut self, n: u64) {
        self.missed += n;
        tracing::debug!(missed = n, job_id = ?self.job_id, "event subscriber fell behind");
    }
}

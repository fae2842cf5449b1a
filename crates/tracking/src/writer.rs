//! Ordered, fire-and-forget record writes.
//!
//! A single task applies merges for every clone of a [`StoreWriter`], so
//! writes reach the store in the order they were issued. Patches that queue
//! up behind a slow write are folded into one merge per vehicle, latest field
//! wins, so a stalled store never replays a backlog of old positions.
//! Failures are logged and never surface to the caller.

use std::sync::Arc;
use std::time::Duration;

use realtime::{TrackingPatch, TrackingStore, VehicleCode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

enum Command {
    Merge { code: VehicleCode, patch: TrackingPatch },
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct StoreWriter {
    sender: mpsc::UnboundedSender<Command>,
}

impl StoreWriter {
    /// Start the write task. It exits once every clone has been dropped.
    pub fn spawn<S>(store: Arc<S>, write_timeout: Duration) -> Self
    where
        S: TrackingStore + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut pending = Pending::default();
            while let Some(command) = receiver.recv().await {
                let mut next = Some(command);
                while let Some(command) = next {
                    match command {
                        Command::Merge { code, patch } => pending.fold(code, patch),
                        Command::Flush(done) => {
                            pending.apply(store.as_ref(), write_timeout).await;
                            let _ = done.send(());
                        }
                    }
                    next = receiver.try_recv().ok();
                }
                pending.apply(store.as_ref(), write_timeout).await;
            }
            debug!("store writer stopped");
        });

        Self { sender }
    }

    /// Queue a merge. Returns `false` when the write task has gone away.
    pub fn write(&self, code: &VehicleCode, patch: TrackingPatch) -> bool {
        self.sender.send(Command::Merge { code: code.clone(), patch }).is_ok()
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

/// Merges queued since the last store round trip, one per vehicle in first
/// issue order.
#[derive(Default)]
struct Pending(Vec<(VehicleCode, TrackingPatch)>);

impl Pending {
    fn fold(&mut self, code: VehicleCode, patch: TrackingPatch) {
        match self.0.iter_mut().find(|(queued, _)| *queued == code) {
            Some((_, queued)) => *queued = queued.then(patch),
            None => self.0.push((code, patch)),
        }
    }

    async fn apply<S: TrackingStore>(&mut self, store: &S, write_timeout: Duration) {
        if self.0.len() > 1 {
            debug!(vehicles = self.0.len(), "applying queued writes");
        }
        for (code, patch) in self.0.drain(..) {
            apply(store, &code, patch, write_timeout).await;
        }
    }
}

async fn apply<S: TrackingStore>(
    store: &S, code: &VehicleCode, patch: TrackingPatch, write_timeout: Duration,
) {
    match tokio::time::timeout(write_timeout, store.merge_record(code, patch)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!(vehicle = %code, heartbeat = patch.is_heartbeat(), error = %e, "tracking write failed");
        }
        Err(_) => {
            warn!(vehicle = %code, timeout = ?write_timeout, "tracking write timed out");
        }
    }
}

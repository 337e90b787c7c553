use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::retry::{retry_with_backoff, RetryPolicy};
use crate::events::{EventBus, NoticeKind};
use crate::model::{DocumentId, PendingSave, SaveMode};
use crate::service::ProgressService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Healthy,
    /// A background save exhausted its retries; cleared by the next success.
    Degraded,
}

/// Coalescing save queue: one pending slot, at most one save in flight.
///
/// `enqueue` always overwrites the pending slot, so the save a worker picks
/// up is the most recent position at the moment it starts. The worker is a
/// tokio task started on demand; it exits once the slot is empty and the
/// next `enqueue` starts a fresh one.
#[derive(Clone)]
pub struct ProgressSaveQueue {
    shared: Arc<Shared>,
}

struct Shared {
    document: DocumentId,
    service: Arc<dyn ProgressService>,
    policy: RetryPolicy,
    bus: EventBus,
    slot: Mutex<Slot>,
    status: Mutex<SyncStatus>,
}

#[derive(Default)]
struct Slot {
    pending: Option<PendingSave>,
    worker_active: bool,
    worker: Option<JoinHandle<()>>,
}

impl ProgressSaveQueue {
    pub fn new(
        document: DocumentId,
        service: Arc<dyn ProgressService>,
        policy: RetryPolicy,
        bus: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                document,
                service,
                policy,
                bus,
                slot: Mutex::new(Slot::default()),
                status: Mutex::new(SyncStatus::Healthy),
            }),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, save: PendingSave) {
        let mut slot = self.shared.slot.lock();
        if slot.pending.replace(save).is_some() {
            debug!(document = %self.shared.document, "coalesced pending progress save");
        }
        if !slot.worker_active {
            slot.worker_active = true;
            let shared = Arc::clone(&self.shared);
            slot.worker = Some(tokio::spawn(shared.run()));
        }
    }

    pub fn status(&self) -> SyncStatus {
        *self.shared.status.lock()
    }

    pub fn is_idle(&self) -> bool {
        let slot = self.shared.slot.lock();
        !slot.worker_active && slot.pending.is_none()
    }

    /// Waits until the worker has drained the slot.
    pub async fn flush(&self) {
        loop {
            let worker = self.shared.slot.lock().worker.take();
            match worker {
                Some(handle) => {
                    if let Err(err) = handle.await {
                        warn!(?err, "progress save worker ended abnormally");
                    }
                }
                None => break,
            }
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>) {
        loop {
            let save = {
                let mut slot = self.slot.lock();
                match slot.pending.take() {
                    Some(save) => save,
                    None => {
                        slot.worker_active = false;
                        return;
                    }
                }
            };
            self.persist(save).await;
        }
    }

    #[instrument(skip(self, save), fields(document = %self.document, page = ?save.update.page))]
    async fn persist(&self, save: PendingSave) {
        let result = retry_with_backoff(&self.policy, "progress", || {
            self.service.update_progress(&self.document, &save.update)
        })
        .await;

        match result {
            Ok(()) => {
                let previous = std::mem::replace(&mut *self.status.lock(), SyncStatus::Healthy);
                if previous == SyncStatus::Degraded {
                    info!("progress sync recovered");
                }
                if save.mode == SaveMode::Interactive {
                    self.bus.notice(NoticeKind::Confirmation, "Progress saved");
                }
            }
            Err(err) => {
                *self.status.lock() = SyncStatus::Degraded;
                warn!(error = %err, "progress save gave up");
                if save.mode == SaveMode::Interactive {
                    self.bus.notice(NoticeKind::Error, err.to_string());
                }
            }
        }
    }
}

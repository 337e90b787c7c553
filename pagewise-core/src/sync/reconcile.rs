use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::{info, instrument};

use super::queue::ProgressSaveQueue;
use crate::model::{DocumentId, PendingSave, Position};
use crate::position::PositionCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// Local is ahead: keep it and push it to the remote authority.
    PushLocal,
    /// Remote is ahead: overwrite the local cache, no remote write.
    AdoptRemote,
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// The position the session starts from.
    pub position: Position,
    pub correction: Correction,
}

/// Compares the two snapshots by page. A missing side counts as page 1.
pub fn reconcile(
    local: Option<&Position>,
    remote: Option<&Position>,
    tolerance: u32,
) -> Reconciliation {
    let local_page = local.map_or(1, |p| p.page);
    let remote_page = remote.map_or(1, |p| p.page);

    if local_page > remote_page.saturating_add(tolerance) {
        return Reconciliation {
            position: local.cloned().unwrap_or_default(),
            correction: Correction::PushLocal,
        };
    }
    if remote_page > local_page.saturating_add(tolerance) {
        return Reconciliation {
            position: remote.cloned().unwrap_or_default(),
            correction: Correction::AdoptRemote,
        };
    }
    Reconciliation {
        position: local.or(remote).cloned().unwrap_or_default(),
        correction: Correction::None,
    }
}

/// Applies [`reconcile`] at most once per mount.
pub struct Reconciler {
    resolved: AtomicBool,
    tolerance: u32,
}

impl Reconciler {
    pub fn new(tolerance: u32) -> Self {
        Self {
            resolved: AtomicBool::new(false),
            tolerance,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// Returns `None` when this mount already reconciled.
    #[instrument(skip_all, fields(document = %document))]
    pub fn run(
        &self,
        document: &DocumentId,
        cache: &dyn PositionCache,
        saves: &ProgressSaveQueue,
        remote: Option<&Position>,
    ) -> Result<Option<Reconciliation>> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let local = cache.load(document)?;
        let outcome = reconcile(local.as_ref(), remote, self.tolerance);
        info!(
            local = ?local.as_ref().map(|p| p.page),
            remote = ?remote.map(|p| p.page),
            correction = ?outcome.correction,
            "reconciled reading position"
        );

        match outcome.correction {
            Correction::PushLocal => saves.enqueue(PendingSave::background(&outcome.position)),
            Correction::AdoptRemote => cache.save(document, &outcome.position)?,
            Correction::None => {}
        }
        Ok(Some(outcome))
    }
}

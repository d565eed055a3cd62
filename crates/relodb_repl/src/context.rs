//! Per-run applier context.

use tokio_util::sync::CancellationToken;

/// How strictly operations must find the documents they target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrictness {
    /// A delete or update whose document is missing fails the job.
    Strict,
    /// Missing targets are logged and skipped.
    Lenient,
}

/// Flags that change how an oplog run is applied.
///
/// Recovery replays entries whose effects may already be visible in the
/// cloned data, so it runs with `reapplying` and `updates_as_upserts` set:
/// inserts overwrite, updates create missing documents, and missing
/// targets are tolerated. Steady-state replication runs with both unset.
#[derive(Debug, Clone, Default)]
pub struct ApplierContext {
    reapplying: bool,
    updates_as_upserts: bool,
    cancel: CancellationToken,
}

impl ApplierContext {
    /// Context for steady-state application.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context used when replaying a window over cloned data.
    pub fn recovery() -> Self {
        Self::new().reapplying(true).updates_as_upserts(true)
    }

    /// Marks the run as replaying entries that may already be applied.
    pub fn reapplying(mut self, reapplying: bool) -> Self {
        self.reapplying = reapplying;
        self
    }

    /// Treats every update as an upsert.
    pub fn updates_as_upserts(mut self, enabled: bool) -> Self {
        self.updates_as_upserts = enabled;
        self
    }

    /// Attaches the token executors watch for cancellation.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether entries are being reapplied.
    pub fn is_reapplying(&self) -> bool {
        self.reapplying
    }

    /// Whether updates are treated as upserts.
    pub fn is_updates_as_upserts(&self) -> bool {
        self.updates_as_upserts
    }

    /// How strictly targets must match.
    pub fn match_strictness(&self) -> MatchStrictness {
        if self.reapplying {
            MatchStrictness::Lenient
        } else {
            MatchStrictness::Strict
        }
    }

    /// Cancellation token of the run.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true once the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

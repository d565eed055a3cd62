//! Initial sync.
//!
//! Recovery brings an empty or diverged replica to a consistent copy of a
//! sync source:
//!
//! 1. mark the replica inconsistent and pick a sync source
//! 2. read the source's newest entry `P1`
//! 3. reset the checkpoint and drop every local user database
//! 4. clone the replicated databases, then force the checkpoint to `P1`
//! 5. apply the oplog window `(P1, P2]`, then `(P2, P3]`, replaying entries
//!    leniently since the clone may already contain their effects
//! 6. rebuild indexes and mark the replica consistent
//!
//! Transient failures restart the whole sequence after a linear backoff;
//! persistence failures end recovery at once.

mod consistency;
mod memory;
mod remote;
mod window;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relodb_oplog::OplogOperation;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use consistency::{ConsistencyHandler, StoredConsistencyHandler};
pub use memory::{MemoryCloner, MemoryRemote};
pub use remote::{
    CloneOptions, DbCloner, RemoteClient, RemoteClientFactory, SyncSource, SyncSourceProvider,
};
pub use window::WindowFetcher;

use crate::config::RecoveryConfig;
use crate::context::ApplierContext;
use crate::error::{ReplError, ReplResult};
use crate::filter::{ReplicationFilters, LOCAL_DATABASE};
use crate::pipeline::OplogApplier;
use crate::store::{DocumentStore, RESERVED_DATABASE};

/// Where a recovery run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Not started.
    Idle,
    /// The replica was marked inconsistent.
    Inconsistent,
    /// Choosing and connecting to a sync source.
    SelectingSource,
    /// Copying databases.
    Cloning,
    /// Applying the window after the clone.
    ApplyingFirstWindow,
    /// Applying the window accumulated while the first one was applied.
    ApplyingSecondWindow,
    /// Rebuilding indexes.
    RebuildingIndexes,
    /// The replica is consistent.
    Finished,
    /// Recovery gave up.
    Failed,
}

impl RecoveryState {
    /// Returns true for `Finished` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RecoveryState::Finished | RecoveryState::Failed)
    }
}

/// How a recovery run ended.
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// The replica is consistent.
    Finished {
        /// Attempts used, the successful one included.
        attempts: u32,
    },
    /// Recovery gave up.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        error: ReplError,
    },
}

impl RecoveryOutcome {
    /// Returns true if the replica is consistent.
    pub fn is_finished(&self) -> bool {
        matches!(self, RecoveryOutcome::Finished { .. })
    }
}

/// Local components recovery works on.
pub struct ReplicaHandles {
    /// The local document store.
    pub store: Arc<dyn DocumentStore>,
    /// Applier used for the oplog windows; its checkpoint is the one reset
    /// and forced by recovery.
    pub applier: Arc<OplogApplier>,
    /// The consistency flag.
    pub consistency: Arc<dyn ConsistencyHandler>,
    /// What is replicated.
    pub filters: Arc<ReplicationFilters>,
}

/// Remote collaborators.
pub struct RemoteHandles {
    /// Picks sync sources.
    pub sources: Arc<dyn SyncSourceProvider>,
    /// Connects to them.
    pub clients: Arc<dyn RemoteClientFactory>,
    /// Copies databases.
    pub cloner: Arc<dyn DbCloner>,
}

/// Runs initial sync with retries.
pub struct RecoveryService {
    config: RecoveryConfig,
    replica: ReplicaHandles,
    remote: RemoteHandles,
    runtime: Handle,
    state: Mutex<RecoveryState>,
    stop: CancellationToken,
}

impl RecoveryService {
    /// Creates the service. Oplog windows are applied on `runtime`.
    pub fn new(
        config: RecoveryConfig,
        replica: ReplicaHandles,
        remote: RemoteHandles,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            replica,
            remote,
            runtime,
            state: Mutex::new(RecoveryState::Idle),
            stop: CancellationToken::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> RecoveryState {
        *self.state.lock()
    }

    /// Makes a running recovery give up at its next step, interrupting a
    /// backoff or an oplog window in progress. A stopped service stays
    /// stopped.
    pub fn stop(&self) {
        info!("stopping recovery");
        self.stop.cancel();
    }

    /// Runs recovery until the replica is consistent, a fatal error occurs
    /// or the attempts are used up.
    ///
    /// # Panics
    ///
    /// Panics if called from an asynchronous context, since it blocks on
    /// the runtime given to [`new`](Self::new).
    pub fn run(&self) -> RecoveryOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let delay = self.config.delay_before(attempt);
            if !delay.is_zero() && self.sleep_or_stop(delay) {
                return self.fail(attempt - 1, ReplError::Cancelled);
            }
            info!(attempt, max_attempts, "starting initial sync");
            match self.initial_sync() {
                Ok(()) => {
                    self.set_state(RecoveryState::Finished);
                    info!(attempt, "initial sync finished");
                    return RecoveryOutcome::Finished { attempts: attempt };
                }
                Err(e) if e.is_cancellation() => {
                    info!(attempt, "initial sync stopped");
                    return self.fail(attempt, e);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, error = %e, "initial sync attempt failed, retrying");
                }
                Err(e) => {
                    error!(attempt, error = %e, "initial sync failed");
                    return self.fail(attempt, e);
                }
            }
        }
    }

    fn fail(&self, attempts: u32, error: ReplError) -> RecoveryOutcome {
        self.set_state(RecoveryState::Failed);
        RecoveryOutcome::Failed { attempts, error }
    }

    fn set_state(&self, state: RecoveryState) {
        debug!(?state, "recovery state");
        *self.state.lock() = state;
    }

    /// Sleeps for `delay`. Returns true if stopped meanwhile.
    fn sleep_or_stop(&self, delay: Duration) -> bool {
        let stop = self.stop.clone();
        self.runtime.block_on(async move {
            tokio::select! {
                _ = stop.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            }
        })
    }

    fn check_stopped(&self) -> ReplResult<()> {
        if self.stop.is_cancelled() {
            Err(ReplError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn initial_sync(&self) -> ReplResult<()> {
        self.check_stopped()?;
        self.set_state(RecoveryState::Inconsistent);
        self.replica.consistency.set_consistent(false)?;

        self.check_stopped()?;
        self.set_state(RecoveryState::SelectingSource);
        let source = self.remote.sources.new_sync_source()?;
        info!(source = %source, "selected sync source");
        let mut client = self.remote.clients.connect(&source)?;
        let result = self.sync_from(client.as_mut());
        client.close();
        result
    }

    fn sync_from(&self, client: &mut dyn RemoteClient) -> ReplResult<()> {
        let first = client.last_op()?;
        info!(position = %first.position, "sync source tail before cloning");

        self.check_stopped()?;
        self.set_state(RecoveryState::Cloning);
        self.clone_databases(client, &first)?;

        self.check_stopped()?;
        self.set_state(RecoveryState::ApplyingFirstWindow);
        let second = client.last_op()?;
        self.apply_window(client, &first, &second)?;

        self.check_stopped()?;
        self.set_state(RecoveryState::ApplyingSecondWindow);
        let third = client.last_op()?;
        self.apply_window(client, &second, &third)?;

        self.check_stopped()?;
        self.set_state(RecoveryState::RebuildingIndexes);
        self.remote.cloner.rebuild_indexes(&self.replica.store)?;

        self.replica.consistency.set_consistent(true)?;
        Ok(())
    }

    /// Replaces local data with a clone of the source. The checkpoint write
    /// handle is held throughout, so nothing reads a checkpoint that does
    /// not match the data.
    fn clone_databases(&self, client: &dyn RemoteClient, start: &OplogOperation) -> ReplResult<()> {
        let checkpoint = self.replica.applier.checkpoint();
        let mut handle = checkpoint.open_write();
        handle.reset()?;
        self.drop_user_databases()?;

        let options = CloneOptions::new(Arc::clone(&self.replica.filters));
        for database in client.list_databases()? {
            if !self.replica.filters.database_filter(&database) {
                debug!(database, "database excluded from clone");
                continue;
            }
            self.check_stopped()?;
            info!(database, source = %client.sync_source(), "cloning database");
            self.remote
                .cloner
                .clone_database(&database, client, &self.replica.store, &options)?;
        }

        handle.force(start.hash, start.position)?;
        handle.close();
        Ok(())
    }

    fn drop_user_databases(&self) -> ReplResult<()> {
        let mut txn = self.replica.store.open_write_transaction()?;
        for database in txn.list_databases()? {
            if database == RESERVED_DATABASE || database == LOCAL_DATABASE {
                continue;
            }
            debug!(database, "dropping local database");
            txn.drop_database(&database)?;
        }
        txn.commit()
    }

    fn apply_window(
        &self,
        client: &dyn RemoteClient,
        from: &OplogOperation,
        to: &OplogOperation,
    ) -> ReplResult<()> {
        info!(from = %from.position, to = %to.position, "applying oplog window");
        let fetcher = WindowFetcher::new(
            client.oplog_between(from.position, to.position)?,
            from.position,
            client.sync_source().address.clone(),
        );
        let context = ApplierContext::recovery().with_cancellation(self.stop.child_token());
        let job = {
            let _entered = self.runtime.enter();
            self.replica.applier.apply(fetcher, context)
        };
        self.runtime.block_on(job.wait())?;

        let reached = self.replica.applier.checkpoint().current().position;
        if reached != to.position {
            debug!(reached = %reached, expected = %to.position, "checkpoint differs from window end");
        }
        Ok(())
    }
}

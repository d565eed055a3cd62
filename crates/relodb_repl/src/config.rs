//! Configuration for the replication engine.

use std::time::{Duration, SystemTime};

/// Limits of the batch accumulation stage.
#[derive(Debug, Clone)]
pub struct ApplierConfig {
    /// Maximum number of entries in a flushed batch.
    pub max_batch_size: usize,
    /// Maximum time an entry may wait in the accumulator.
    pub max_batch_period: Duration,
    /// Capacity of the buffer between the fetcher and the accumulator, in
    /// fetched batches.
    pub buffer_capacity: usize,
    /// Capacity of the channel between accumulation and execution, in
    /// flushed batches.
    pub stage_capacity: usize,
}

impl ApplierConfig {
    /// Sets the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    /// Sets the maximum batch period.
    pub fn with_max_batch_period(mut self, period: Duration) -> Self {
        self.max_batch_period = period;
        self
    }

    /// Sets the fetch buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// Sets the inter-stage channel capacity.
    pub fn with_stage_capacity(mut self, capacity: usize) -> Self {
        self.stage_capacity = capacity.max(1);
        self
    }
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            max_batch_period: Duration::from_millis(100),
            buffer_capacity: 64,
            stage_capacity: 2,
        }
    }
}

/// Sizing of concurrent sub-batches.
#[derive(Debug, Clone)]
pub struct SubBatchConfig {
    /// Smallest sub-batch, in operations.
    pub min_size: usize,
    /// Sub-batch size used before any latency was observed.
    pub target_size: usize,
    /// Largest sub-batch, in operations.
    pub max_size: usize,
    /// Latency a sub-batch should take to execute.
    pub target_latency: Duration,
}

impl Default for SubBatchConfig {
    fn default() -> Self {
        Self {
            min_size: 16,
            target_size: 300,
            max_size: 2000,
            target_latency: Duration::from_millis(50),
        }
    }
}

/// How CRUD batches are executed.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Run namespace sub-batches on a worker pool.
    pub concurrent: bool,
    /// Sub-batches running at once.
    pub worker_threads: usize,
    /// Sub-batch sizing.
    pub sub_batch: SubBatchConfig,
}

impl ExecutorConfig {
    /// Sequential execution on the calling thread.
    pub fn sequential() -> Self {
        Self {
            concurrent: false,
            ..Self::default()
        }
    }

    /// Sets the number of worker threads.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Sets sub-batch sizing.
    pub fn with_sub_batch(mut self, sub_batch: SubBatchConfig) -> Self {
        self.sub_batch = sub_batch;
        self
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let worker_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            concurrent: true,
            worker_threads,
            sub_batch: SubBatchConfig::default(),
        }
    }
}

/// Retry behavior for backend transactions.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound of any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Adds up to 25% to each delay so that retries of concurrent
    /// sub-batches spread out.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Delay to wait before `attempt` (0-indexed). The first attempt never
    /// waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let secs = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = secs.min(self.max_delay.as_secs_f64());
        if self.add_jitter {
            Duration::from_secs_f64(secs + secs * 0.25 * jitter_fraction())
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Pseudo-random fraction in `[0, 1)` taken from the clock.
fn jitter_fraction() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Checkpoint persistence settings.
#[derive(Debug, Clone, Default)]
pub struct CheckpointConfig {
    /// Retries on backend rollback.
    pub retry: RetryConfig,
}

/// Initial-sync recovery settings.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Attempts before recovery gives up.
    pub max_attempts: u32,
    /// Attempt `n` waits `n * backoff_step` first.
    pub backoff_step: Duration,
}

impl RecoveryConfig {
    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the backoff step.
    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step = step;
        self
    }

    /// Delay before the given 1-based attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.backoff_step * attempt
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_step: Duration::from_secs(1),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct ReplConfig {
    /// Accumulation limits.
    pub applier: ApplierConfig,
    /// Execution strategy.
    pub executor: ExecutorConfig,
    /// Checkpoint persistence.
    pub checkpoint: CheckpointConfig,
    /// Recovery loop.
    pub recovery: RecoveryConfig,
}

impl ReplConfig {
    /// Sets the applier configuration.
    pub fn with_applier(mut self, applier: ApplierConfig) -> Self {
        self.applier = applier;
        self
    }

    /// Sets the executor configuration.
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the recovery configuration.
    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

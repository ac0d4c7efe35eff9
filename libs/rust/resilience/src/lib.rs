//! Resilience utilities: per-stage deadlines for blocking pipeline work.
//!
//! Stages are never retried. A stage that overruns its deadline is reported as a fatal timeout; the
//! blocking thread itself cannot be interrupted and is left to finish in the background. Work that
//! must not land after a timeout checks its [`StageToken`] before the irreversible step.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{warn, debug};
use opentelemetry::{global, metrics::Counter, KeyValue};
use once_cell::sync::Lazy;

static STAGE_TIMEOUTS: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("churnguard-resilience")
        .u64_counter("churnguard_stage_timeouts_total")
        .with_description("Stages aborted because they exceeded their deadline")
        .build()
});

#[derive(Debug, Error)]
pub enum DeadlineError {
    #[error("stage {stage} exceeded its deadline of {deadline:?}")]
    Elapsed { stage: &'static str, deadline: Duration },
    #[error("stage {stage} aborted: {reason}")]
    Aborted { stage: &'static str, reason: String },
}

const RUNNING: u8 = 0;
const COMMITTING: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared by a stage body and its deadline. Whichever of commit or cancel comes first wins.
#[derive(Debug, Clone, Default)]
pub struct StageToken(Arc<AtomicU8>);

impl StageToken {
    pub fn new() -> Self { Self::default() }

    /// Claim the right to make the stage's effect visible. `false` once the deadline has fired;
    /// after `true` the deadline waits for the body instead of abandoning it.
    pub fn enter_commit(&self) -> bool {
        match self.0.compare_exchange(RUNNING, COMMITTING, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(state) => state == COMMITTING,
        }
    }

    /// Mark the stage abandoned. `false` if the body already entered its commit.
    pub fn cancel(&self) -> bool {
        match self.0.compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(state) => state == CANCELLED,
        }
    }

    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Acquire) == CANCELLED }
}

/// Run `work` on the blocking pool and wait at most `deadline` for it.
pub async fn with_deadline<F, T>(stage: &'static str, deadline: Duration, work: F) -> Result<T, DeadlineError>
where F: FnOnce() -> T + Send + 'static, T: Send + 'static {
    with_cancellable_deadline(stage, deadline, move |_| work()).await
}

/// [`with_deadline`] for work that commits through a [`StageToken`]. A body that entered its
/// commit before the deadline fired is awaited to completion.
pub async fn with_cancellable_deadline<F, T>(stage: &'static str, deadline: Duration, work: F) -> Result<T, DeadlineError>
where F: FnOnce(&StageToken) -> T + Send + 'static, T: Send + 'static {
    debug!(stage, ?deadline, "stage dispatched");
    let token = StageToken::new();
    let body_token = token.clone();
    let mut handle = tokio::task::spawn_blocking(move || work(&body_token));
    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(joined) => joined.map_err(|join| aborted(stage, join)),
        Err(_) if !token.cancel() => {
            debug!(stage, "deadline elapsed mid-commit; waiting for the stage");
            handle.await.map_err(|join| aborted(stage, join))
        }
        Err(_) => {
            STAGE_TIMEOUTS.add(1, &[KeyValue::new("stage", stage)]);
            warn!(stage, ?deadline, "stage deadline elapsed");
            Err(DeadlineError::Elapsed { stage, deadline })
        }
    }
}

fn aborted(stage: &'static str, join: JoinError) -> DeadlineError {
    DeadlineError::Aborted { stage, reason: join.to_string() }
}

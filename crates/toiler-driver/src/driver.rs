use crate::{DriverError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};
use toiler_core::{Message, Outcome};

/// Current time as fractional unix-epoch seconds.
pub fn epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Remaining wait for this cycle.
///
/// With a `starttime`, waits are phase-locked to `starttime + k * waittime`
/// ticks so co-located workers spread their polls instead of herding.
pub fn wait_time(starttime: Option<f64>, waittime: f64, now: f64) -> f64 {
    match starttime {
        None => waittime,
        Some(start) => {
            let span = now - start;
            let tick = (span / waittime).ceil();
            let next = start + tick * waittime;
            (next - now).max(0.0)
        }
    }
}

/// When an enqueued job becomes claimable.
#[derive(Debug, Clone, PartialEq)]
pub enum When {
    /// Relative delay in seconds.
    Delay(f64),
    /// Absolute deadline, resolved to `max(0, deadline - now)`.
    At(DateTime<Utc>),
}

impl When {
    pub fn delay_seconds(&self, now: DateTime<Utc>) -> f64 {
        match self {
            When::Delay(seconds) => seconds.max(0.0),
            When::At(deadline) => {
                let micros = deadline.signed_duration_since(now).num_microseconds().unwrap_or(0);
                (micros as f64 / 1_000_000.0).max(0.0)
            }
        }
    }
}

/// Options for enqueuing one job.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Higher value is more urgent; the backend default applies when `None`.
    pub priority: Option<i64>,
    /// `None` means immediately claimable.
    pub when: Option<When>,
    /// Per-job timeout in seconds (0 = worker default).
    pub timeout: f64,
}

impl SendOptions {
    pub fn is_immediate(&self) -> bool {
        match &self.when {
            None => true,
            Some(when) => when.delay_seconds(Utc::now()) <= 0.0,
        }
    }
}

/// The backend contract every queue engine implements.
///
/// One instance owns one backend handle exclusively. A claim yielded by
/// `select` stays open inside the driver (the in-flight claim handle)
/// until exactly one `resolve` or `abandon` call; the driver commits the
/// storage mutation atomically with the claim release. A claim that is
/// never resolved (process death) must become claimable again after the
/// backend's time-to-run window, exactly once.
#[async_trait]
pub trait Driver: Send {
    /// Human-readable endpoint description for log lines.
    fn describe(&self) -> String;

    /// Idempotently provision backend schema/directories. `forcibly`
    /// destroys and recreates first; never use it in production.
    async fn setup(&mut self, forcibly: bool) -> Result<()>;

    /// Post-fork, per-worker initialization (wake registration etc).
    async fn daemonize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Non-blocking degraded-state probe; a standing-by worker pauses
    /// instead of claiming.
    async fn is_standby(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// One-shot claim attempt. Returns `None` after an interruptible wait
    /// of up to the configured waittime when nothing is claimable; on
    /// `Some` a claim is held open until `resolve` or `abandon`.
    /// Restartable: a stale unresolved claim is released first.
    async fn select(&mut self) -> Result<Option<Message>>;

    /// Commit the in-flight claim with its outcome. Exactly-once per claim.
    async fn resolve(&mut self, message: &Message, outcome: Outcome) -> Result<()>;

    /// Roll the in-flight claim back so the job is immediately reclaimable.
    async fn abandon(&mut self, message: &Message) -> Result<()>;

    /// Enqueue a job; returns the job id where the backend assigns one.
    async fn send(&mut self, contents: &str, options: SendOptions) -> Result<Option<String>>;

    /// Best-effort wake of up to `count` idle co-located workers.
    async fn notify(&mut self, count: usize) -> Result<usize> {
        let _ = count;
        Ok(0)
    }

    /// Best-effort removal of not-yet-claimed jobs matching id or contents.
    async fn cancel(&mut self, job_id: Option<&str>, contents: Option<&str>) -> Result<usize> {
        let _ = (job_id, contents);
        Err(DriverError::Unsupported("cancel"))
    }

    /// Drain all unclaimed jobs (test/debug only).
    async fn clear(&mut self) -> Result<usize>;

    /// Whether an error means the backend connection itself is dead.
    /// `true` makes the worker propagate instead of retrying the cycle.
    fn is_fatal(&self, error: &DriverError) -> bool {
        let _ = error;
        false
    }

    /// Release the backend handle; idempotent.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Wake handle that interrupts this driver's idle wait.
    fn wake_handle(&self) -> crate::Wake;

    async fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

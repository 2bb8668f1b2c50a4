use crate::Message;

/// Observer hooks for queue lifecycle events.
///
/// Every method has a no-op default so implementors pick the events they
/// care about. Fired synchronously from the client (`on_send`) and the
/// worker loop (everything else); implementations should return quickly.
pub trait Listener: Send + Sync {
    /// A job was enqueued. `job_id` is `None` when the backend assigns no id.
    fn on_send(&self, job_id: Option<&str>) {
        let _ = job_id;
    }

    /// Work completed successfully.
    fn on_done(&self, message: &Message, result: Option<&str>) {
        let _ = (message, result);
    }

    /// Work raised a terminal failure; the job was dead-lettered.
    fn on_fail(&self, message: &Message, error: &str) {
        let _ = (message, error);
    }

    /// Work requested a retry.
    fn on_retry(&self, message: &Message, delay: f64) {
        let _ = (message, delay);
    }

    /// The per-job timeout fired.
    fn on_timeout(&self, message: &Message, elapsed: f64) {
        let _ = (message, elapsed);
    }

    /// A claim finished resolution, whatever the outcome.
    fn on_finish(&self, message: &Message) {
        let _ = message;
    }

    /// A cycle found no claimable job.
    fn on_breather(&self, cycle: u64) {
        let _ = cycle;
    }

    /// Continuity crossed a busy bucket upward.
    fn on_busy(&self, continuity: u64) {
        let _ = continuity;
    }

    /// Continuity fell back across a bucket.
    fn on_idle(&self, continuity: u64) {
        let _ = continuity;
    }

    /// The backend left standby; the worker will restart itself.
    fn on_standup(&self, driver: &str) {
        let _ = driver;
    }

    /// A cycle completed.
    fn on_cycle(&self, cycle: u64) {
        let _ = cycle;
    }
}

/// Listener that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl Listener for NullListener {}

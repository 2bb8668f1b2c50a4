use crate::RestartPolicy;
use std::time::{Instant, SystemTime};
use tracing::warn;

/// Evaluates the restart policy at cycle boundaries.
pub struct RestartGuard {
    policy: RestartPolicy,
    started: Instant,
    baseline: Option<SystemTime>,
}

impl RestartGuard {
    pub fn new(policy: RestartPolicy) -> Self {
        let baseline = match &policy {
            RestartPolicy::Watch { path } => match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(mtime) => Some(mtime),
                Err(e) => {
                    warn!("cannot watch {}: {}", path.display(), e);
                    None
                }
            },
            _ => None,
        };
        RestartGuard { policy, started: Instant::now(), baseline }
    }

    pub fn due(&self, cycle: u64) -> bool {
        match &self.policy {
            RestartPolicy::Never => false,
            RestartPolicy::Lifetime { seconds } => self.started.elapsed().as_secs_f64() >= *seconds,
            RestartPolicy::Cycles { count } => cycle >= *count,
            RestartPolicy::Watch { path } => {
                let current = std::fs::metadata(path).and_then(|m| m.modified()).ok();
                match (&self.baseline, &current) {
                    (Some(baseline), Some(current)) => current > baseline,
                    // the marker appeared or vanished since startup
                    (None, Some(_)) | (Some(_), None) => true,
                    (None, None) => false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_never_is_never_due() {
        let guard = RestartGuard::new(RestartPolicy::Never);
        assert!(!guard.due(u64::MAX));
    }

    #[test]
    fn test_cycles_counts_cycles() {
        let guard = RestartGuard::new(RestartPolicy::Cycles { count: 10 });
        assert!(!guard.due(9));
        assert!(guard.due(10));
    }

    #[test]
    fn test_lifetime_expires() {
        let guard = RestartGuard::new(RestartPolicy::Lifetime { seconds: 0.01 });
        assert!(!guard.due(0));
        std::thread::sleep(Duration::from_millis(20));
        assert!(guard.due(0));
    }

    #[test]
    fn test_watch_notices_touch() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("release");
        std::fs::write(&marker, "v1").unwrap();

        let guard = RestartGuard::new(RestartPolicy::Watch { path: marker.clone() });
        assert!(!guard.due(0));

        // mtime granularity can be a full second on some filesystems
        let future = std::time::SystemTime::now() + Duration::from_secs(2);
        let file = std::fs::File::options().write(true).open(&marker).unwrap();
        file.set_modified(future).unwrap();
        assert!(guard.due(0));
    }
}

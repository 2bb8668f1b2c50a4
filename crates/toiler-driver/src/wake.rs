use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Handle that interrupts a driver's idle wait.
///
/// Workers park on `wait` between polls; `wake` releases one waiter (or
/// stores a single permit when nobody is waiting yet, so a wake sent just
/// before the wait still lands within the cycle).
#[derive(Debug, Clone, Default)]
pub struct Wake {
    inner: Arc<Notify>,
}

impl Wake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wake(&self) {
        self.inner.notify_one();
    }

    /// Wait up to `timeout`; returns true when woken early.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::select! {
            _ = self.inner.notified() => true,
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static REGISTRY: Lazy<Mutex<HashMap<String, Vec<(u64, Wake)>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Register a worker's wake handle under its backend identity.
/// Returns the registration id used for `notify` self-exclusion and
/// `unregister`.
pub fn register(identity: &str, wake: Wake) -> u64 {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    REGISTRY.lock().entry(identity.to_string()).or_default().push((id, wake));
    id
}

pub fn unregister(identity: &str, id: u64) {
    let mut registry = REGISTRY.lock();
    if let Some(wakes) = registry.get_mut(identity) {
        wakes.retain(|(wake_id, _)| *wake_id != id);
        if wakes.is_empty() {
            registry.remove(identity);
        }
    }
}

/// Wake up to `count` sibling workers registered under `identity`,
/// excluding the caller's own registration. Returns how many were nudged.
pub fn notify(identity: &str, exclude: Option<u64>, count: usize) -> usize {
    let targets: Vec<Wake> = {
        let registry = REGISTRY.lock();
        match registry.get(identity) {
            Some(wakes) => wakes
                .iter()
                .filter(|(id, _)| Some(*id) != exclude)
                .map(|(_, wake)| wake.clone())
                .collect(),
            None => Vec::new(),
        }
    };

    let mut targets = targets;
    targets.shuffle(&mut rand::thread_rng());

    let woken = targets.len().min(count);
    for wake in targets.iter().take(woken) {
        wake.wake();
    }
    woken
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wake_interrupts_wait() {
        let wake = Wake::new();
        let waiter = wake.clone();
        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        wake.wake();
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let wake = Wake::new();
        assert!(!wake.wait(Duration::from_millis(50)).await);
    }

    #[test]
    fn test_notify_excludes_self_and_caps_count() {
        let identity = "test:notify-exclude";
        let mine = register(identity, Wake::new());
        let other_a = register(identity, Wake::new());
        let other_b = register(identity, Wake::new());

        assert_eq!(notify(identity, Some(mine), 10), 2);
        assert_eq!(notify(identity, Some(mine), 1), 1);

        unregister(identity, mine);
        unregister(identity, other_a);
        unregister(identity, other_b);
        assert_eq!(notify(identity, None, 10), 0);
    }
}

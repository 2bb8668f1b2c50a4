//! One behavioral suite, run against every backend: whatever engine sits
//! behind the URL, claims are exclusive, order is (priority, arrival),
//! delays defer, retries back off, and unresolved claims come back.

use std::time::{Duration, Instant};
use toiler_core::{Message, Outcome};
use toiler_driver::{connect, Driver, SendOptions, When};

struct Backend {
    name: &'static str,
    url: String,
    _dir: tempfile::TempDir,
}

fn backends(tag: &str) -> Vec<Backend> {
    let sqlite_dir = tempfile::tempdir().unwrap();
    let file_dir = tempfile::tempdir().unwrap();
    let memory_dir = tempfile::tempdir().unwrap();
    vec![
        Backend {
            name: "sqlite",
            url: format!("sqlite://{}/queue.db?waittime=0.05&ttr=0.3", sqlite_dir.path().display()),
            _dir: sqlite_dir,
        },
        Backend {
            name: "file",
            url: format!("file://{}/spool.job?waittime=0.05&ttr=0.3", file_dir.path().display()),
            _dir: file_dir,
        },
        Backend {
            name: "memory",
            url: format!("memory://contract-{tag}?waittime=0.05&ttr=0.3"),
            _dir: memory_dir,
        },
    ]
}

async fn open(backend: &Backend) -> Box<dyn Driver> {
    let mut driver = connect(&backend.url).await.unwrap();
    driver.setup(true).await.unwrap();
    driver
}

/// A second handle on the same backend, leaving its contents alone.
async fn open_peer(backend: &Backend) -> Box<dyn Driver> {
    connect(&backend.url).await.unwrap()
}

/// Keep selecting until something is claimable or the deadline passes.
async fn claim_within(driver: &mut Box<dyn Driver>, seconds: f64) -> Option<Message> {
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    while Instant::now() < deadline {
        if let Some(message) = driver.select().await.unwrap() {
            return Some(message);
        }
    }
    None
}

#[tokio::test]
async fn test_claim_is_exclusive() {
    for backend in backends("exclusive") {
        let mut a = open(&backend).await;
        let mut b = open_peer(&backend).await;

        a.send("only", SendOptions::default()).await.unwrap();
        let claimed = a.select().await.unwrap().unwrap_or_else(|| panic!("{}: no claim", backend.name));
        assert!(b.select().await.unwrap().is_none(), "{}: double claim", backend.name);

        a.resolve(&claimed, Outcome::Ack).await.unwrap();
        a.close().await.unwrap();
        b.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_priority_then_arrival_order() {
    for backend in backends("order") {
        let mut driver = open(&backend).await;

        driver.send("b", SendOptions { priority: Some(500), ..Default::default() }).await.unwrap();
        driver.send("a", SendOptions { priority: Some(900), ..Default::default() }).await.unwrap();
        driver.send("c", SendOptions { priority: Some(500), ..Default::default() }).await.unwrap();

        for expected in ["a", "b", "c"] {
            let message = driver.select().await.unwrap().unwrap_or_else(|| panic!("{}: queue ran dry", backend.name));
            assert_eq!(message.contents, expected, "{}: wrong order", backend.name);
            driver.resolve(&message, Outcome::Ack).await.unwrap();
        }
        driver.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_delay_defers_claim() {
    for backend in backends("delay") {
        let mut driver = open(&backend).await;

        driver
            .send("later", SendOptions { when: Some(When::Delay(3600.0)), ..Default::default() })
            .await
            .unwrap();
        driver.send("now", SendOptions::default()).await.unwrap();

        let message = driver.select().await.unwrap().unwrap_or_else(|| panic!("{}: no claim", backend.name));
        assert_eq!(message.contents, "now", "{}", backend.name);
        driver.resolve(&message, Outcome::Ack).await.unwrap();

        assert!(driver.select().await.unwrap().is_none(), "{}: delay ignored", backend.name);
        driver.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_retry_requeues_with_backoff() {
    for backend in backends("retry") {
        let mut driver = open(&backend).await;

        driver.send("flaky", SendOptions::default()).await.unwrap();
        let message = driver.select().await.unwrap().unwrap();
        assert_eq!(message.retry_count, 0);
        driver.resolve(&message, Outcome::Retry { delay: 0.2 }).await.unwrap();

        assert!(driver.select().await.unwrap().is_none(), "{}: backoff ignored", backend.name);

        let again = claim_within(&mut driver, 2.0)
            .await
            .unwrap_or_else(|| panic!("{}: retry never surfaced", backend.name));
        assert_eq!(again.contents, "flaky", "{}", backend.name);
        assert_eq!(again.retry_count, 1, "{}: retry count not bumped", backend.name);
        driver.resolve(&again, Outcome::Ack).await.unwrap();
        driver.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_drain_round_trip() {
    for backend in backends("drain") {
        let mut driver = open(&backend).await;

        for i in 0..5 {
            driver.send(&format!("job-{i}"), SendOptions::default()).await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some(message) = driver.select().await.unwrap() {
            seen.push(message.contents.clone());
            driver.resolve(&message, Outcome::Ack).await.unwrap();
        }

        seen.sort();
        assert_eq!(seen, vec!["job-0", "job-1", "job-2", "job-3", "job-4"], "{}", backend.name);
        driver.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_unresolved_claim_recovers_after_ttr() {
    for backend in backends("recover") {
        let mut crashed = open(&backend).await;
        let mut survivor = open_peer(&backend).await;

        crashed.send("orphan", SendOptions::default()).await.unwrap();
        let _held = crashed.select().await.unwrap().unwrap();
        // the holder dies without resolving or closing
        drop(crashed);

        let reclaimed = claim_within(&mut survivor, 3.0)
            .await
            .unwrap_or_else(|| panic!("{}: claim never recovered", backend.name));
        assert_eq!(reclaimed.contents, "orphan", "{}", backend.name);
        survivor.resolve(&reclaimed, Outcome::Ack).await.unwrap();
        survivor.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_abandon_makes_job_immediately_claimable() {
    for backend in backends("abandon") {
        let mut driver = open(&backend).await;

        driver.send("bounced", SendOptions::default()).await.unwrap();
        let message = driver.select().await.unwrap().unwrap();
        driver.abandon(&message).await.unwrap();

        let again = driver.select().await.unwrap().unwrap_or_else(|| panic!("{}: abandon lost the job", backend.name));
        assert_eq!(again.contents, "bounced", "{}", backend.name);
        assert_eq!(again.retry_count, 0, "{}: abandon is not a retry", backend.name);
        driver.resolve(&again, Outcome::Ack).await.unwrap();
        driver.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_clear_counts_removed_jobs() {
    for backend in backends("clear") {
        let mut driver = open(&backend).await;

        for i in 0..3 {
            driver.send(&format!("job-{i}"), SendOptions::default()).await.unwrap();
        }
        assert_eq!(driver.clear().await.unwrap(), 3, "{}", backend.name);
        assert!(driver.select().await.unwrap().is_none(), "{}", backend.name);
        driver.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_resolve_is_exactly_once() {
    for backend in backends("once") {
        let mut driver = open(&backend).await;

        driver.send("single", SendOptions::default()).await.unwrap();
        let message = driver.select().await.unwrap().unwrap();
        driver.resolve(&message, Outcome::Ack).await.unwrap();

        assert!(driver.resolve(&message, Outcome::Ack).await.is_err(), "{}: double resolve allowed", backend.name);
        driver.close().await.unwrap();
    }
}

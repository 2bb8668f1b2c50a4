use crate::driver::{epoch, wait_time, Driver, SendOptions};
use crate::{BackendUrl, DriverError, Result, Wake};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use toiler_core::{Envelope, Message, Outcome, MAX_CONTENTS_SIZE};

const DEFAULT_PRIORITY: i64 = 32767;

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Queue name; drivers created with the same name share one queue.
    pub name: String,
    pub waittime: f64,
    /// Seconds a claim may stay unresolved before it is reclaimable.
    pub ttr: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            name: "default".to_string(),
            waittime: 10.0,
            ttr: 60.0,
        }
    }
}

impl MemoryConfig {
    /// `memory://name?waittime=…&ttr=…`.
    pub fn from_url(url: &BackendUrl) -> Result<Self> {
        let mut config = MemoryConfig::default();
        if let Some(host) = &url.host {
            config.name = host.clone();
        }
        if let Some(waittime) = url.query_f64("waittime")? {
            config.waittime = waittime;
        }
        if let Some(ttr) = url.query_f64("ttr")? {
            config.ttr = ttr;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DriverError::Config("queue name is required".to_string()));
        }
        if self.waittime <= 0.0 {
            return Err(DriverError::Config("waittime must be positive".to_string()));
        }
        if self.ttr <= 0.0 {
            return Err(DriverError::Config("ttr must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemJob {
    envelope: Envelope,
    priority: i64,
    start_at: f64,
    claimed_until: Option<f64>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: BTreeMap<u64, MemJob>,
    dead: Vec<(u64, Envelope, String)>,
    next_id: u64,
}

/// Broker half of the in-process backend. Cloning shares the queue;
/// clients and workers holding clones see the same jobs, which is what the
/// tests and single-process deployments want.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
    wake: Wake,
}

static QUEUES: Lazy<Mutex<HashMap<String, MemoryQueue>>> = Lazy::new(|| Mutex::new(HashMap::new()));

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide queue for `name`, created on first use.
    pub fn named(name: &str) -> Self {
        QUEUES.lock().entry(name.to_string()).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }

    /// Dead-lettered jobs as (contents, error), oldest first.
    pub fn dead(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .dead
            .iter()
            .map(|(_, envelope, error)| (envelope.contents.clone(), error.clone()))
            .collect()
    }
}

/// In-process backend, shaped like a broker: claims are leases with a TTR
/// and acknowledgement resolves them. Useful for tests and for embedding a
/// queue without any external service.
pub struct MemoryDriver {
    queue: MemoryQueue,
    config: MemoryConfig,
    in_flight: Option<String>,
}

impl MemoryDriver {
    pub fn new(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let queue = MemoryQueue::named(&config.name);
        Ok(MemoryDriver { queue, config, in_flight: None })
    }

    /// A driver over an explicit queue handle, bypassing the name registry.
    pub fn with_queue(queue: MemoryQueue, config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        Ok(MemoryDriver { queue, config, in_flight: None })
    }

    fn release(&self, job_id: &str) {
        if let Ok(id) = job_id.parse::<u64>() {
            if let Some(job) = self.queue.state.lock().jobs.get_mut(&id) {
                job.claimed_until = None;
            }
        }
    }

    /// Exactly-once resolution guard shared by `resolve`.
    fn take_claim(&mut self, message: &Message) -> Result<u64> {
        match self.in_flight.take() {
            None => Err(DriverError::Claim("no claim in flight".to_string())),
            Some(claimed) if claimed != message.id => {
                let held = claimed.clone();
                self.in_flight = Some(claimed);
                Err(DriverError::Claim(format!("claim is {held}, not {}", message.id)))
            }
            Some(claimed) => claimed
                .parse::<u64>()
                .map_err(|_| DriverError::Claim(format!("invalid job id: {claimed}"))),
        }
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn describe(&self) -> String {
        format!("memory {}", self.config.name)
    }

    async fn setup(&mut self, forcibly: bool) -> Result<()> {
        if forcibly {
            let mut state = self.queue.state.lock();
            state.jobs.clear();
            state.dead.clear();
        }
        Ok(())
    }

    async fn select(&mut self) -> Result<Option<Message>> {
        if let Some(stale) = self.in_flight.take() {
            self.release(&stale);
        }

        let now = epoch();
        let claimed = {
            let mut state = self.queue.state.lock();
            let best = state
                .jobs
                .iter()
                .filter(|(_, job)| {
                    job.start_at <= now && job.claimed_until.map_or(true, |until| until <= now)
                })
                .min_by_key(|(id, job)| (Reverse(job.priority), **id))
                .map(|(id, _)| *id);
            best.and_then(|id| {
                state.jobs.get_mut(&id).map(|job| {
                    job.claimed_until = Some(now + self.config.ttr);
                    (id, job.envelope.clone())
                })
            })
        };

        match claimed {
            Some((id, envelope)) => {
                let job_id = id.to_string();
                self.in_flight = Some(job_id.clone());
                Ok(Some(Message::new(job_id, envelope.contents, envelope.retry, envelope.timeout)))
            }
            None => {
                let wait = wait_time(None, self.config.waittime, now).max(0.001);
                self.queue.wake.wait(Duration::from_secs_f64(wait)).await;
                Ok(None)
            }
        }
    }

    async fn resolve(&mut self, message: &Message, outcome: Outcome) -> Result<()> {
        let id = self.take_claim(message)?;
        let mut state = self.queue.state.lock();
        match outcome {
            Outcome::Ack => {
                state.jobs.remove(&id);
            }
            Outcome::Retry { delay } => {
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.envelope = Envelope {
                        contents: message.contents.clone(),
                        retry: message.retry_count + 1,
                        timeout: message.timeout,
                    };
                    job.start_at = epoch() + delay.max(0.0);
                    job.claimed_until = None;
                }
            }
            Outcome::Dead { error } => {
                if let Some(job) = state.jobs.remove(&id) {
                    state.dead.push((id, job.envelope, error));
                }
            }
        }
        Ok(())
    }

    async fn abandon(&mut self, message: &Message) -> Result<()> {
        if self.in_flight.as_deref() == Some(message.id.as_str()) {
            self.in_flight = None;
        }
        self.release(&message.id);
        Ok(())
    }

    async fn send(&mut self, contents: &str, options: SendOptions) -> Result<Option<String>> {
        if contents.len() > MAX_CONTENTS_SIZE {
            return Err(toiler_core::CoreError::ContentsTooLarge {
                max: MAX_CONTENTS_SIZE,
                actual: contents.len(),
            }
            .into());
        }

        let delay = options
            .when
            .as_ref()
            .map(|when| when.delay_seconds(chrono::Utc::now()))
            .unwrap_or(0.0);
        let job = MemJob {
            envelope: Envelope::with_timeout(contents, options.timeout),
            priority: options.priority.unwrap_or(DEFAULT_PRIORITY),
            start_at: if delay > 0.0 { epoch() + delay } else { 0.0 },
            claimed_until: None,
        };

        let id = {
            let mut state = self.queue.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.jobs.insert(id, job);
            id
        };
        Ok(Some(id.to_string()))
    }

    async fn notify(&mut self, count: usize) -> Result<usize> {
        for _ in 0..count.max(1) {
            self.queue.wake.wake();
        }
        // no separate processes to signal
        Ok(0)
    }

    async fn clear(&mut self) -> Result<usize> {
        let now = epoch();
        let mut state = self.queue.state.lock();
        let unclaimed: Vec<u64> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.claimed_until.map_or(true, |until| until <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in &unclaimed {
            state.jobs.remove(id);
        }
        Ok(unclaimed.len())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(stale) = self.in_flight.take() {
            self.release(&stale);
        }
        Ok(())
    }

    fn wake_handle(&self) -> Wake {
        self.queue.wake.clone()
    }
}

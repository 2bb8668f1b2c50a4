use crate::restart::RestartGuard;
use crate::{Result, ScaleCommand, SignalBridge, WorkerConfig, WorkerError};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use toiler_core::{Listener, Message, NullListener, Outcome, WorkError};
use toiler_driver::Driver;
use tracing::{debug, error, info, warn};

/// The work callback: one claimed job in, a result string (or a verdict
/// to retry or fail) out.
pub type WorkFn =
    Arc<dyn Fn(Message) -> BoxFuture<'static, std::result::Result<Option<String>, WorkError>> + Send + Sync>;

/// Exit codes the supervisor understands: 0 is a deliberate stop, 1 asks
/// for a replacement process.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_RESTART: i32 = 1;

/// First continuity bucket; each busy level doubles it. A worker that
/// clears 16 jobs without a breather asks for help, at 32 more it asks
/// again, and so on up to `MAX_LEVEL` times.
const BUCKET_BASE: u64 = 16;
const MAX_LEVEL: u32 = 6;

/// Where scale verdicts go.
enum ScaleSink {
    /// Nobody is listening.
    Silent,
    /// Fork mode: the supervisor reads our stdout.
    Stdout,
    /// In-process supervisor or tests.
    Channel(mpsc::UnboundedSender<ScaleCommand>),
}

/// The claim-execute-resolve loop over one backend handle.
pub struct Worker {
    driver: Box<dyn Driver>,
    work: WorkFn,
    config: WorkerConfig,
    listener: Arc<dyn Listener>,
    scale: ScaleSink,
    signals: Option<SignalBridge>,
}

impl Worker {
    pub fn new(driver: Box<dyn Driver>, work: WorkFn, config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Worker {
            driver,
            work,
            config,
            listener: Arc::new(NullListener),
            scale: ScaleSink::Silent,
            signals: None,
        })
    }

    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_scale_channel(mut self, tx: mpsc::UnboundedSender<ScaleCommand>) -> Self {
        self.scale = ScaleSink::Channel(tx);
        self
    }

    /// Fork mode: emit scale verdicts on stdout for the supervisor.
    pub fn with_scale_stdout(mut self) -> Self {
        self.scale = ScaleSink::Stdout;
        self
    }

    /// The signal bridge, installed on first use. Must be called inside a
    /// runtime; also the stop handle for tests.
    pub fn signal_bridge(&mut self) -> Result<SignalBridge> {
        match &self.signals {
            Some(signals) => Ok(signals.clone()),
            None => {
                let signals = SignalBridge::install(&self.config.stop_signals, self.driver.wake_handle())?;
                self.signals = Some(signals.clone());
                Ok(signals)
            }
        }
    }

    /// Run until a stop signal, a restart-policy exit, or a fatal backend
    /// error. Returns the exit code for the process to report.
    pub async fn run(mut self) -> Result<i32> {
        let pid = std::process::id();
        let signals = self.signal_bridge()?;
        let wake = self.driver.wake_handle();

        info!("[{pid}] start: {}", self.driver.describe());
        // a broken schema must not stop a read-only worker from limping along
        if let Err(e) = self.driver.setup(false).await {
            warn!("[{pid}] setup failed: {e}");
        }
        self.driver.daemonize().await?;

        let stood_by = match self.driver.is_standby().await {
            Ok(stood_by) => stood_by,
            Err(e) => {
                self.driver.close().await.ok();
                return Err(e.into());
            }
        };
        if stood_by {
            info!("[{pid}] backend is standby, dozing until it answers");
        }

        let restart = RestartGuard::new(self.config.restart.clone());
        let mut cycle: u64 = 0;
        let mut continuity: u64 = 0;
        let mut level: u32 = 0;

        let exit = loop {
            if !signals.is_running() {
                info!("[{pid}] end by signal");
                break EXIT_CLEAN;
            }
            if restart.due(cycle) {
                info!("[{pid}] exit for restart");
                break EXIT_RESTART;
            }

            if stood_by {
                match self.driver.is_standby().await {
                    Ok(true) => {
                        debug!("[{pid}] sleep");
                        wake.wait(Duration::from_secs_f64(self.config.standby_interval)).await;
                        continue;
                    }
                    Ok(false) => {
                        // a fresh process gets the promoted backend
                        info!("[{pid}] standup: {}", self.driver.describe());
                        self.listener.on_standup(&self.driver.describe());
                        break EXIT_RESTART;
                    }
                    Err(e) => {
                        warn!("[{pid}] standby probe failed: {e}");
                        tokio::time::sleep(Duration::from_secs_f64(self.config.error_pause)).await;
                        continue;
                    }
                }
            }

            match self.cycle_once(&mut continuity, &mut level, cycle).await {
                Ok(()) => {}
                Err(WorkerError::Driver(e)) if !self.driver.is_fatal(&e) => {
                    warn!("[{pid}] backend error: {e}");
                    tokio::time::sleep(Duration::from_secs_f64(self.config.error_pause)).await;
                }
                Err(e) => {
                    error!("[{pid}] fatal: {e}");
                    self.driver.close().await.ok();
                    return Err(e);
                }
            }

            cycle += 1;
            self.listener.on_cycle(cycle);
        };

        self.driver.close().await?;
        info!("[{pid}] end");
        Ok(exit)
    }

    async fn cycle_once(&mut self, continuity: &mut u64, level: &mut u32, cycle: u64) -> Result<()> {
        let pid = std::process::id();
        match self.driver.select().await? {
            Some(message) => {
                self.execute(message).await?;
                *continuity += 1;
                if *continuity >= (BUCKET_BASE << *level) && *level < MAX_LEVEL {
                    *level += 1;
                    info!("[{pid}] busy at {} jobs without a breather", continuity);
                    self.listener.on_busy(*continuity);
                    self.push_scale(ScaleCommand::Increase);
                }
            }
            None => {
                if *level > 0 {
                    *level -= 1;
                    info!("[{pid}] idle again after {} jobs", continuity);
                    self.listener.on_idle(*continuity);
                    self.push_scale(ScaleCommand::Decrease);
                }
                *continuity = 0;
                debug!("[{pid}] breather");
                self.listener.on_breather(cycle);
            }
        }
        Ok(())
    }

    async fn execute(&mut self, message: Message) -> Result<()> {
        let pid = std::process::id();
        info!("[{pid}] job {} (retry {})", message.id, message.retry_count);
        let started = Instant::now();

        let work = self.work.clone();
        let job = message.clone();
        let mut handle = tokio::spawn(async move { work(job).await });

        // the job's own timeout wins over the worker default, 0 means none
        let limit = if message.timeout > 0.0 { message.timeout } else { self.config.timeout };
        let joined = if limit > 0.0 {
            match tokio::time::timeout(Duration::from_secs_f64(limit), &mut handle).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    handle.abort();
                    None
                }
            }
        } else {
            Some(handle.await)
        };

        let elapsed = started.elapsed().as_secs_f64();
        let outcome = match joined {
            // a timed-out job is acknowledged, never rerun by accident
            None => {
                error!("[{pid}] timeout {} after {:.3}s", message.id, elapsed);
                self.listener.on_timeout(&message, elapsed);
                Outcome::Ack
            }
            Some(Err(join)) => {
                if join.is_panic() {
                    error!("[{pid}] job {} panicked, aborting it", message.id);
                } else {
                    warn!("[{pid}] job {} was cancelled", message.id);
                }
                Outcome::Ack
            }
            Some(Ok(Ok(result))) => {
                info!("[{pid}] done {} in {:.3}s", message.id, elapsed);
                self.listener.on_done(&message, result.as_deref());
                Outcome::Ack
            }
            Some(Ok(Err(WorkError::Retry { delay }))) => {
                info!("[{pid}] retry {} in {:.1}s", message.id, delay);
                self.listener.on_retry(&message, delay);
                Outcome::Retry { delay }
            }
            Some(Ok(Err(WorkError::Failed(error)))) => {
                error!("[{pid}] fail {}: {}", message.id, error);
                self.listener.on_fail(&message, &error);
                Outcome::Dead { error }
            }
        };

        self.driver.resolve(&message, outcome).await?;
        self.listener.on_finish(&message);
        Ok(())
    }

    fn push_scale(&self, command: ScaleCommand) {
        match &self.scale {
            ScaleSink::Silent => {}
            ScaleSink::Stdout => println!("{}", command.as_line()),
            ScaleSink::Channel(tx) => {
                let _ = tx.send(command);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use toiler_driver::{MemoryConfig, MemoryDriver, MemoryQueue, SendOptions};

    fn queue_driver(queue: MemoryQueue) -> Box<dyn Driver> {
        let config = MemoryConfig { waittime: 0.02, ..Default::default() };
        Box::new(MemoryDriver::with_queue(queue, config).unwrap())
    }

    async fn fill(queue: &MemoryQueue, count: usize) {
        let config = MemoryConfig { waittime: 0.02, ..Default::default() };
        let mut driver = MemoryDriver::with_queue(queue.clone(), config).unwrap();
        for i in 0..count {
            driver.send(&format!("job-{i}"), SendOptions::default()).await.unwrap();
        }
    }

    /// A work fn that records contents and stops the worker after `quota`
    /// jobs.
    fn counting_work(seen: Arc<Mutex<Vec<String>>>, quota: u64, stop: SignalBridge) -> WorkFn {
        let counter = Arc::new(AtomicU64::new(0));
        Arc::new(move |message: Message| {
            let seen = seen.clone();
            let counter = counter.clone();
            let stop = stop.clone();
            Box::pin(async move {
                seen.lock().push(message.contents.clone());
                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= quota {
                    stop.stop();
                }
                Ok(None)
            })
        })
    }

    #[tokio::test]
    async fn test_drains_queue_and_stops_cleanly() {
        let queue = MemoryQueue::new();
        fill(&queue, 3).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut worker = Worker::new(queue_driver(queue.clone()), Arc::new(|_| Box::pin(async { Ok(None) })), WorkerConfig::default()).unwrap();
        let stop = worker.signal_bridge().unwrap();
        worker.work = counting_work(seen.clone(), 3, stop);

        assert_eq!(worker.run().await.unwrap(), EXIT_CLEAN);
        assert_eq!(seen.lock().len(), 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_burst_of_257_asks_for_help_five_times() {
        let queue = MemoryQueue::new();
        fill(&queue, 257).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut worker = Worker::new(queue_driver(queue.clone()), Arc::new(|_| Box::pin(async { Ok(None) })), WorkerConfig::default())
            .unwrap()
            .with_scale_channel(tx);
        let stop = worker.signal_bridge().unwrap();
        worker.work = counting_work(seen.clone(), 257, stop);

        assert_eq!(worker.run().await.unwrap(), EXIT_CLEAN);

        let mut increases = 0;
        while let Ok(command) = rx.try_recv() {
            assert_eq!(command, ScaleCommand::Increase);
            increases += 1;
        }
        assert_eq!(increases, 5);
    }

    #[tokio::test]
    async fn test_breather_walks_the_level_back_down() {
        let queue = MemoryQueue::new();
        fill(&queue, 16).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = WorkerConfig {
            restart: crate::RestartPolicy::Cycles { count: 18 },
            ..Default::default()
        };
        let worker = Worker::new(
            queue_driver(queue.clone()),
            Arc::new(|_| Box::pin(async { Ok(None) })),
            config,
        )
        .unwrap()
        .with_scale_channel(tx);

        // 16 jobs raise the level once; the breather after the drain
        // lowers it again, then the cycle cap exits with a restart code
        assert_eq!(worker.run().await.unwrap(), EXIT_RESTART);

        assert_eq!(rx.try_recv().unwrap(), ScaleCommand::Increase);
        assert_eq!(rx.try_recv().unwrap(), ScaleCommand::Decrease);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_acks_and_reports() {
        struct Timeouts(Mutex<Vec<String>>);
        impl Listener for Timeouts {
            fn on_timeout(&self, message: &Message, _elapsed: f64) {
                self.0.lock().push(message.contents.clone());
            }
        }

        let queue = MemoryQueue::new();
        {
            let config = MemoryConfig { waittime: 0.02, ..Default::default() };
            let mut driver = MemoryDriver::with_queue(queue.clone(), config).unwrap();
            driver
                .send("slow", SendOptions { timeout: 0.05, ..Default::default() })
                .await
                .unwrap();
        }

        let timeouts = Arc::new(Timeouts(Mutex::new(Vec::new())));
        let config = WorkerConfig {
            restart: crate::RestartPolicy::Cycles { count: 2 },
            ..Default::default()
        };
        let worker = Worker::new(
            queue_driver(queue.clone()),
            Arc::new(|_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(None)
                })
            }),
            config,
        )
        .unwrap()
        .with_listener(timeouts.clone());

        worker.run().await.unwrap();
        assert_eq!(*timeouts.0.lock(), vec!["slow".to_string()]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_retry_verdict_requeues_with_backoff() {
        let queue = MemoryQueue::new();
        fill(&queue, 1).await;

        let config = WorkerConfig {
            restart: crate::RestartPolicy::Cycles { count: 4 },
            ..Default::default()
        };
        let worker = Worker::new(
            queue_driver(queue.clone()),
            Arc::new(|message: Message| {
                Box::pin(async move {
                    if message.retry_count == 0 {
                        Err(WorkError::Retry { delay: 0.0 })
                    } else {
                        Ok(None)
                    }
                })
            }),
            config,
        )
        .unwrap();

        worker.run().await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_failed_verdict_dead_letters() {
        let queue = MemoryQueue::new();
        fill(&queue, 1).await;

        let config = WorkerConfig {
            restart: crate::RestartPolicy::Cycles { count: 2 },
            ..Default::default()
        };
        let worker = Worker::new(
            queue_driver(queue.clone()),
            Arc::new(|_| Box::pin(async { Err(WorkError::failed("no such user")) })),
            config,
        )
        .unwrap();

        worker.run().await.unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.dead(), vec![("job-0".to_string(), "no such user".to_string())]);
    }

    #[tokio::test]
    async fn test_panicking_job_is_acked_and_loop_survives() {
        let queue = MemoryQueue::new();
        fill(&queue, 2).await;

        let config = WorkerConfig {
            restart: crate::RestartPolicy::Cycles { count: 3 },
            ..Default::default()
        };
        let worker = Worker::new(
            queue_driver(queue.clone()),
            Arc::new(|message: Message| {
                Box::pin(async move {
                    if message.contents == "job-0" {
                        panic!("boom");
                    }
                    Ok(None)
                })
            }),
            config,
        )
        .unwrap();

        worker.run().await.unwrap();
        assert!(queue.is_empty());
    }
}

use crate::driver::{epoch, wait_time, Driver, SendOptions};
use crate::{wake, BackendUrl, DriverError, Result, Wake};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toiler_core::{Envelope, Message, Outcome, MAX_CONTENTS_SIZE};
use tracing::{debug, warn};
use uuid::Uuid;

const WORKING_DIR: &str = ".working";
const DEAD_DIR: &str = ".dead";
const DEFAULT_PRIORITY: i64 = 500;

#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Spool directory holding one file per queued job.
    pub directory: PathBuf,
    /// Job file extension, without the dot.
    pub extension: String,
    pub waittime: f64,
    pub starttime: Option<f64>,
    /// Seconds a claimed job may sit in `.working/` before it reverts.
    pub ttr: f64,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            directory: PathBuf::from("toiler-spool"),
            extension: "job".to_string(),
            waittime: 10.0,
            starttime: None,
            ttr: 86400.0,
        }
    }
}

impl FsConfig {
    /// `file:///var/spool/jobs.job`: the last dot splits directory from
    /// extension.
    pub fn from_url(url: &BackendUrl) -> Result<Self> {
        let (directory, extension) = url.dotted_path();
        let mut config = FsConfig {
            directory: PathBuf::from(directory),
            ..Default::default()
        };
        if let Some(extension) = extension {
            config.extension = extension;
        }
        if let Some(waittime) = url.query_f64("waittime")? {
            config.waittime = waittime;
        }
        if let Some(starttime) = url.query_f64("starttime")? {
            config.starttime = Some(starttime);
        }
        if let Some(ttr) = url.query_f64("ttr")? {
            config.ttr = ttr;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.directory.as_os_str().is_empty() {
            return Err(DriverError::Config("directory is required".to_string()));
        }
        if self.extension.is_empty() || self.extension.contains(['/', '.']) {
            return Err(DriverError::Config(format!("invalid extension: {:?}", self.extension)));
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

/// On-disk job record. Scheduling lives in the record, not in file
/// timestamps, so copying a spool directory does not reschedule anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FsJob {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    not_before: f64,
}

/// Filesystem-polling backend.
///
/// One file per job. Claiming is a rename into `.working/`, which is atomic
/// on POSIX filesystems; whoever wins the rename owns the job. File names
/// sort as (priority, arrival), so a plain directory listing is the queue
/// order. Claim age is the workfile mtime, refreshed by a rewrite at claim
/// time.
pub struct FileSystemDriver {
    config: FsConfig,
    wake: Wake,
    registration: Option<u64>,
    in_flight: Option<String>,
    identity: String,
}

impl FileSystemDriver {
    pub fn new(config: FsConfig) -> Result<Self> {
        config.validate()?;
        let identity = format!("file:{}", config.directory.display());
        Ok(FileSystemDriver {
            config,
            wake: Wake::new(),
            registration: None,
            in_flight: None,
            identity,
        })
    }

    fn working_dir(&self) -> PathBuf {
        self.config.directory.join(WORKING_DIR)
    }

    fn dead_dir(&self) -> PathBuf {
        self.config.directory.join(DEAD_DIR)
    }

    fn job_path(&self, name: &str) -> PathBuf {
        self.config.directory.join(name)
    }

    /// `{999-priority}-{microseconds}-{uuid}.{ext}`, so lexicographic order
    /// is priority-descending, then oldest-first.
    fn job_name(&self, priority: i64) -> String {
        let slot = 999 - priority.clamp(0, 999);
        let micros = (epoch() * 1_000_000.0) as u64;
        format!("{:03}-{:016}-{}.{}", slot, micros, Uuid::new_v4().simple(), self.config.extension)
    }

    async fn write_atomic(&self, path: &Path, data: &str) -> Result<()> {
        let tmp = self.config.directory.join(format!(".tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Queued job names in queue order.
    async fn scan(&self) -> Result<Vec<String>> {
        let suffix = format!(".{}", self.config.extension);
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(&suffix) && !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_job(&self, path: &Path) -> Result<Option<FsJob>> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                // quarantine it so the scan does not trip over it forever
                warn!("unreadable job file {}: {}", path.display(), e);
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("garbled");
                let _ = tokio::fs::rename(path, self.dead_dir().join(name)).await;
                Ok(None)
            }
        }
    }

    /// Move a job file back out of `.working/`.
    async fn release(&self, name: &str) -> Result<()> {
        match tokio::fs::rename(self.working_dir().join(name), self.job_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn sleep(&self) {
        let wait = wait_time(self.config.starttime, self.config.waittime, epoch()).max(0.001);
        self.wake.wait(Duration::from_secs_f64(wait)).await;
    }

    /// Revert workfiles whose claim outlived the TTR.
    async fn recover(&self) -> Result<usize> {
        let mut reverted = 0;
        let mut entries = match tokio::fs::read_dir(self.working_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = match entry.file_name().to_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            let modified = entry.metadata().await?.modified()?;
            let age = modified.elapsed().unwrap_or_default();
            if age.as_secs_f64() >= self.config.ttr {
                warn!("reverting stalled claim {} after {:.0}s", name, age.as_secs_f64());
                self.release(&name).await?;
                reverted += 1;
            }
        }
        Ok(reverted)
    }
}

#[async_trait]
impl Driver for FileSystemDriver {
    fn describe(&self) -> String {
        format!("file {}/*.{}", self.config.directory.display(), self.config.extension)
    }

    async fn setup(&mut self, forcibly: bool) -> Result<()> {
        if forcibly {
            match tokio::fs::remove_dir_all(&self.config.directory).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tokio::fs::create_dir_all(self.working_dir()).await?;
        tokio::fs::create_dir_all(self.dead_dir()).await?;
        Ok(())
    }

    async fn daemonize(&mut self) -> Result<()> {
        if self.registration.is_none() {
            self.registration = Some(wake::register(&self.identity, self.wake.clone()));
        }
        Ok(())
    }

    async fn is_standby(&mut self) -> Result<bool> {
        let probe = self.config.directory.join(format!(".probe-{}", Uuid::new_v4().simple()));
        match tokio::fs::write(&probe, b"").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                Ok(false)
            }
            Err(_) => Ok(true),
        }
    }

    async fn select(&mut self) -> Result<Option<Message>> {
        if let Some(stale) = self.in_flight.take() {
            self.release(&stale).await?;
        }

        let now = epoch();
        for name in self.scan().await? {
            let job = match self.read_job(&self.job_path(&name)).await? {
                Some(job) => job,
                None => continue,
            };
            if job.not_before > now {
                continue;
            }

            let workfile = self.working_dir().join(&name);
            match tokio::fs::rename(self.job_path(&name), &workfile).await {
                Ok(()) => {}
                // someone else won the rename
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            // rewrite so the workfile mtime marks the claim, not the send
            let data = serde_json::to_string(&job).map_err(toiler_core::CoreError::Encode)?;
            tokio::fs::write(&workfile, data).await?;

            self.in_flight = Some(name.clone());
            let envelope = job.envelope;
            return Ok(Some(Message::new(name, envelope.contents, envelope.retry, envelope.timeout)));
        }

        self.sleep().await;
        self.recover().await?;
        Ok(None)
    }

    async fn resolve(&mut self, message: &Message, outcome: Outcome) -> Result<()> {
        match self.in_flight.take() {
            None => return Err(DriverError::Claim("no claim in flight".to_string())),
            Some(claimed) if claimed != message.id => {
                let held = claimed.clone();
                self.in_flight = Some(claimed);
                return Err(DriverError::Claim(format!("claim is {held}, not {}", message.id)));
            }
            Some(_) => {}
        }

        let workfile = self.working_dir().join(&message.id);
        match outcome {
            Outcome::Ack => {
                tokio::fs::remove_file(&workfile).await?;
            }
            Outcome::Retry { delay } => {
                let job = FsJob {
                    envelope: Envelope {
                        contents: message.contents.clone(),
                        retry: message.retry_count + 1,
                        timeout: message.timeout,
                    },
                    not_before: epoch() + delay.max(0.0),
                };
                let data = serde_json::to_string(&job).map_err(toiler_core::CoreError::Encode)?;
                tokio::fs::write(&workfile, data).await?;
                tokio::fs::rename(&workfile, self.job_path(&message.id)).await?;
            }
            Outcome::Dead { error } => {
                let record = serde_json::json!({
                    "contents": message.contents,
                    "retry": message.retry_count,
                    "timeout": message.timeout,
                    "error": error,
                });
                let data = serde_json::to_string(&record).map_err(toiler_core::CoreError::Encode)?;
                tokio::fs::write(self.dead_dir().join(&message.id), data).await?;
                tokio::fs::remove_file(&workfile).await?;
            }
        }
        Ok(())
    }

    async fn abandon(&mut self, message: &Message) -> Result<()> {
        if self.in_flight.as_deref() == Some(message.id.as_str()) {
            self.in_flight = None;
        }
        self.release(&message.id).await
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
        let job = FsJob {
            envelope: Envelope::with_timeout(contents, options.timeout),
            not_before: if delay > 0.0 { epoch() + delay } else { 0.0 },
        };
        let data = serde_json::to_string(&job).map_err(toiler_core::CoreError::Encode)?;

        let name = self.job_name(options.priority.unwrap_or(DEFAULT_PRIORITY));
        self.write_atomic(&self.job_path(&name), &data).await?;
        debug!("queued {}", name);
        Ok(Some(name))
    }

    async fn notify(&mut self, count: usize) -> Result<usize> {
        Ok(wake::notify(&self.identity, self.registration, count))
    }

    async fn cancel(&mut self, job_id: Option<&str>, contents: Option<&str>) -> Result<usize> {
        if job_id.is_none() && contents.is_none() {
            return Ok(0);
        }
        let mut cancelled = 0;
        for name in self.scan().await? {
            let matched = match (job_id, contents) {
                (Some(id), _) if id == name => true,
                (_, Some(contents)) => match self.read_job(&self.job_path(&name)).await? {
                    Some(job) => job.envelope.contents == contents,
                    None => false,
                },
                _ => false,
            };
            if matched {
                match tokio::fs::remove_file(self.job_path(&name)).await {
                    Ok(()) => cancelled += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(cancelled)
    }

    async fn clear(&mut self) -> Result<usize> {
        let mut removed = 0;
        for name in self.scan().await? {
            match tokio::fs::remove_file(self.job_path(&name)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    fn is_fatal(&self, error: &DriverError) -> bool {
        matches!(error, DriverError::Io(e) if e.kind() == ErrorKind::PermissionDenied)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(id) = self.registration.take() {
            wake::unregister(&self.identity, id);
        }
        Ok(())
    }

    fn wake_handle(&self) -> Wake {
        self.wake.clone()
    }
}

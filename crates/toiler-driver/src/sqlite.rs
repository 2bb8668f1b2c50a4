use crate::driver::{epoch, wait_time, Driver, SendOptions};
use crate::{wake, BackendUrl, DriverError, Result, SharedCache, Wake};
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteQueryResult,
    SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use toiler_core::{Envelope, Message, Outcome, MAX_CONTENTS_SIZE};
use tracing::debug;

/// What happens to a dead-lettered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadMode {
    /// Delete it.
    #[default]
    Discard,
    /// Move it into the `{table}_dead` side table with the error recorded.
    Table,
    /// Record the error in place; rows with an error are never selected.
    Column,
}

impl FromStr for DeadMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "discard" => Ok(DeadMode::Discard),
            "table" => Ok(DeadMode::Table),
            "column" => Ok(DeadMode::Column),
            other => Err(DriverError::Config(format!("unknown deadmode: {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file path.
    pub database: PathBuf,
    /// Job table name; `{table}_dead` is derived from it.
    pub table: String,
    /// One cycle's wait in seconds.
    pub waittime: f64,
    /// Phase-lock origin for herd-spread polling (unix epoch seconds).
    pub starttime: Option<f64>,
    pub deadmode: DeadMode,
    /// Seconds a claim may stay unresolved before it is reclaimable.
    pub ttr: f64,
    /// Cross-process batch cache file; `None` disables sharing.
    pub shared_file: Option<PathBuf>,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        SqliteConfig {
            database: PathBuf::from("toiler.db"),
            table: "toiler".to_string(),
            waittime: 10.0,
            starttime: None,
            deadmode: DeadMode::Discard,
            ttr: 3600.0,
            shared_file: None,
        }
    }
}

impl SqliteConfig {
    pub fn from_url(url: &BackendUrl) -> Result<Self> {
        let mut config = SqliteConfig {
            database: PathBuf::from(url.path.clone()),
            ..Default::default()
        };
        if let Some(table) = url.query.get("table") {
            config.table = table.clone();
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
        if let Some(deadmode) = url.query.get("deadmode") {
            config.deadmode = deadmode.parse()?;
        }
        if let Some(shared) = url.query.get("sharedfile") {
            config.shared_file = Some(PathBuf::from(shared));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.as_os_str().is_empty() {
            return Err(DriverError::Config("database path is required".to_string()));
        }
        if !valid_identifier(&self.table) {
            return Err(DriverError::Config(format!("invalid table name: {:?}", self.table)));
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

// the table name is interpolated into SQL
fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

const CANDIDATE_LIMIT: usize = 256;
const DEFAULT_PRIORITY: i64 = 32767;

type SqlQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Relational-polling backend over SQLite.
///
/// Claiming is one atomic lease CAS (`UPDATE … SET claimed_until …
/// RETURNING`) on the best available row; SQLite's serialized writes give
/// the mutual exclusion that `FOR UPDATE SKIP LOCKED` gives on a server
/// engine. An unresolved claim expires after TTR and the same CAS reclaims
/// it, which is the crash-recovery path.
pub struct SqliteDriver {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    config: SqliteConfig,
    shared: Option<SharedCache>,
    wake: Wake,
    registration: Option<u64>,
    in_flight: Option<String>,
    identity: String,
    closed: bool,
}

impl SqliteDriver {
    pub async fn connect(config: SqliteConfig) -> Result<Self> {
        config.validate()?;

        if let Some(parent) = config.database.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;

        let identity = format!("sqlite:{}#{}", config.database.display(), config.table);
        let shared = config
            .shared_file
            .as_ref()
            .map(|path| SharedCache::new(path.clone(), config.waittime));

        Ok(SqliteDriver {
            pool,
            tx: None,
            shared,
            wake: Wake::new(),
            registration: None,
            in_flight: None,
            identity,
            closed: false,
            config,
        })
    }

    async fn run(&mut self, query: SqlQuery<'_>) -> Result<SqliteQueryResult> {
        let result = match self.tx.as_deref_mut() {
            Some(conn) => query.execute(conn).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result)
    }

    async fn fetch_optional(&mut self, query: SqlQuery<'_>) -> Result<Option<SqliteRow>> {
        let row = match self.tx.as_deref_mut() {
            Some(conn) => query.fetch_optional(conn).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(row)
    }

    async fn fetch_all(&mut self, query: SqlQuery<'_>) -> Result<Vec<SqliteRow>> {
        let rows = match self.tx.as_deref_mut() {
            Some(conn) => query.fetch_all(conn).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows)
    }

    /// Claimable candidates, best first.
    async fn candidates(&mut self, limit: usize) -> Result<Vec<(String, i64)>> {
        let now = epoch();
        let sql = format!(
            "SELECT job_id, priority FROM \"{t}\" \
             WHERE start_at <= ? AND error IS NULL AND (claimed_until IS NULL OR claimed_until <= ?) \
             ORDER BY priority DESC, job_id ASC LIMIT ?",
            t = self.config.table,
        );
        let rows = self
            .fetch_all(sqlx::query(&sql).bind(now).bind(now).bind(limit as i64))
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get::<i64, _>("job_id").to_string(), row.get::<i64, _>("priority")))
            .collect())
    }

    /// Atomically lease one candidate; `None` means the race was lost or
    /// the row is gone.
    async fn claim(&mut self, job_id: i64) -> Result<Option<Envelope>> {
        let now = epoch();
        let lease = now + self.config.ttr;
        let sql = format!(
            "UPDATE \"{t}\" SET claimed_until = ? \
             WHERE job_id = ? AND start_at <= ? AND error IS NULL \
               AND (claimed_until IS NULL OR claimed_until <= ?) \
             RETURNING job_data",
            t = self.config.table,
        );
        let row = self
            .fetch_optional(sqlx::query(&sql).bind(lease).bind(job_id).bind(now).bind(now))
            .await?;
        match row {
            Some(row) => Ok(Some(Envelope::decode(row.get::<&str, _>("job_data"))?)),
            None => Ok(None),
        }
    }

    async fn release_claim(&mut self, job_id: &str) -> Result<()> {
        let sql = format!("UPDATE \"{t}\" SET claimed_until = NULL WHERE job_id = ?", t = self.config.table);
        let job_id = job_id.to_string();
        self.run(sqlx::query(&sql).bind(job_id)).await?;
        Ok(())
    }

    async fn unshare(&mut self, job_id: &str) -> Result<()> {
        if let Some(cache) = self.shared.clone() {
            cache.take(job_id).await?;
        }
        Ok(())
    }

    /// Interruptible idle wait.
    async fn sleep(&self) {
        let wait = wait_time(self.config.starttime, self.config.waittime, epoch()).max(0.001);
        self.wake.wait(Duration::from_secs_f64(wait)).await;
    }

    /// Make expired leases visible as available again. The claim CAS would
    /// reclaim them anyway; the sweep keeps the table honest for observers.
    async fn recover(&mut self) -> Result<usize> {
        let now = epoch();
        let sql = format!(
            "UPDATE \"{t}\" SET claimed_until = NULL WHERE claimed_until IS NOT NULL AND claimed_until <= ?",
            t = self.config.table,
        );
        let reverted = self.run(sqlx::query(&sql).bind(now)).await?.rows_affected() as usize;
        if reverted > 0 {
            debug!("recovered {} expired claims", reverted);
        }
        Ok(reverted)
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn describe(&self) -> String {
        format!("sqlite {}/{}", self.config.database.display(), self.config.table)
    }

    async fn setup(&mut self, forcibly: bool) -> Result<()> {
        let table = self.config.table.clone();

        if forcibly {
            for sql in [
                format!("DROP TABLE IF EXISTS \"{table}\""),
                format!("DROP TABLE IF EXISTS \"{table}_dead\""),
            ] {
                self.run(sqlx::query(&sql)).await?;
            }
        }

        let create = format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\"(\
                 job_id        INTEGER PRIMARY KEY AUTOINCREMENT,\
                 job_data      TEXT NOT NULL,\
                 priority      INTEGER NOT NULL DEFAULT 0,\
                 start_at      REAL NOT NULL,\
                 claimed_until REAL DEFAULT NULL,\
                 error         TEXT DEFAULT NULL\
             )"
        );
        self.run(sqlx::query(&create)).await?;

        let index = format!("CREATE INDEX IF NOT EXISTS \"{table}_idx_select\" ON \"{table}\"(start_at, priority)");
        self.run(sqlx::query(&index)).await?;

        if self.config.deadmode == DeadMode::Table {
            let dead = format!(
                "CREATE TABLE IF NOT EXISTS \"{table}_dead\"(\
                     job_id    INTEGER PRIMARY KEY,\
                     job_data  TEXT NOT NULL,\
                     priority  INTEGER NOT NULL DEFAULT 0,\
                     start_at  REAL NOT NULL,\
                     error     TEXT DEFAULT NULL\
                 )"
            );
            self.run(sqlx::query(&dead)).await?;
        }

        if let Some(shared) = &self.config.shared_file {
            if let Some(parent) = shared.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        Ok(())
    }

    async fn daemonize(&mut self) -> Result<()> {
        if self.registration.is_none() {
            self.registration = Some(wake::register(&self.identity, self.wake.clone()));
        }
        Ok(())
    }

    async fn is_standby(&mut self) -> Result<bool> {
        // a throwaway write probes read-only replicas and lost handles
        let sql = format!("DELETE FROM \"{t}\" WHERE job_id = -1", t = self.config.table);
        match self.run(sqlx::query(&sql)).await {
            Ok(_) => Ok(false),
            Err(_) => Ok(true),
        }
    }

    async fn select(&mut self) -> Result<Option<Message>> {
        if let Some(stale) = self.in_flight.take() {
            self.release_claim(&stale).await?;
        }

        let candidates = match self.shared.clone() {
            Some(cache) => {
                cache
                    .select_shared(CANDIDATE_LIMIT, |limit| self.candidates(limit))
                    .await?
            }
            None => self.candidates(CANDIDATE_LIMIT).await?,
        };

        for (job_id, _priority) in candidates {
            let numeric_id = match job_id.parse::<i64>() {
                Ok(id) => id,
                Err(_) => continue,
            };
            match self.claim(numeric_id).await? {
                Some(envelope) => {
                    self.unshare(&job_id).await?;
                    self.in_flight = Some(job_id.clone());
                    return Ok(Some(Message::new(job_id, envelope.contents, envelope.retry, envelope.timeout)));
                }
                None => {
                    // claimed elsewhere or gone; drop it from the shared batch
                    self.unshare(&job_id).await?;
                }
            }
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

        let table = self.config.table.clone();
        let job_id = message
            .id
            .parse::<i64>()
            .map_err(|_| DriverError::Claim(format!("invalid job id: {}", message.id)))?;

        match outcome {
            Outcome::Ack => {
                let sql = format!("DELETE FROM \"{table}\" WHERE job_id = ?");
                self.run(sqlx::query(&sql).bind(job_id)).await?;
            }
            Outcome::Retry { delay } => {
                let envelope = Envelope {
                    contents: message.contents.clone(),
                    retry: message.retry_count + 1,
                    timeout: message.timeout,
                };
                let job_data = envelope.encode()?;
                let start_at = epoch() + delay.max(0.0);
                let sql = format!(
                    "UPDATE \"{table}\" SET job_data = ?, start_at = ?, claimed_until = NULL WHERE job_id = ?"
                );
                self.run(sqlx::query(&sql).bind(job_data).bind(start_at).bind(job_id)).await?;
            }
            Outcome::Dead { error } => match self.config.deadmode {
                DeadMode::Discard => {
                    let sql = format!("DELETE FROM \"{table}\" WHERE job_id = ?");
                    self.run(sqlx::query(&sql).bind(job_id)).await?;
                }
                DeadMode::Column => {
                    let sql = format!("UPDATE \"{table}\" SET error = ?, claimed_until = NULL WHERE job_id = ?");
                    self.run(sqlx::query(&sql).bind(error).bind(job_id)).await?;
                }
                DeadMode::Table => {
                    let insert = format!(
                        "INSERT INTO \"{table}_dead\"(job_id, job_data, priority, start_at, error) \
                         SELECT job_id, job_data, priority, start_at, ? FROM \"{table}\" WHERE job_id = ?"
                    );
                    let delete = format!("DELETE FROM \"{table}\" WHERE job_id = ?");
                    if self.tx.is_some() {
                        self.run(sqlx::query(&insert).bind(error).bind(job_id)).await?;
                        self.run(sqlx::query(&delete).bind(job_id)).await?;
                    } else {
                        let mut tx = self.pool.begin().await?;
                        sqlx::query(&insert).bind(error).bind(job_id).execute(&mut *tx).await?;
                        sqlx::query(&delete).bind(job_id).execute(&mut *tx).await?;
                        tx.commit().await?;
                    }
                }
            },
        }

        Ok(())
    }

    async fn abandon(&mut self, message: &Message) -> Result<()> {
        if self.in_flight.as_deref() == Some(message.id.as_str()) {
            self.in_flight = None;
        }
        self.release_claim(&message.id).await
    }

    async fn send(&mut self, contents: &str, options: SendOptions) -> Result<Option<String>> {
        if contents.len() > MAX_CONTENTS_SIZE {
            return Err(toiler_core::CoreError::ContentsTooLarge {
                max: MAX_CONTENTS_SIZE,
                actual: contents.len(),
            }
            .into());
        }

        let envelope = Envelope::with_timeout(contents, options.timeout);
        let job_data = envelope.encode()?;
        let priority = options.priority.unwrap_or(DEFAULT_PRIORITY);
        let delay = options
            .when
            .as_ref()
            .map(|when| when.delay_seconds(chrono::Utc::now()))
            .unwrap_or(0.0);
        let start_at = epoch() + delay;

        let sql = format!(
            "INSERT INTO \"{t}\"(job_data, priority, start_at) VALUES (?, ?, ?)",
            t = self.config.table,
        );
        let result = self.run(sqlx::query(&sql).bind(job_data).bind(priority).bind(start_at)).await?;
        Ok(Some(result.last_insert_rowid().to_string()))
    }

    async fn notify(&mut self, count: usize) -> Result<usize> {
        Ok(wake::notify(&self.identity, self.registration, count))
    }

    async fn cancel(&mut self, job_id: Option<&str>, contents: Option<&str>) -> Result<usize> {
        if job_id.is_none() && contents.is_none() {
            return Ok(0);
        }

        let mut condition = String::from("0");
        if job_id.is_some() {
            condition.push_str(" OR job_id = ?");
        }
        if contents.is_some() {
            condition.push_str(" OR json_extract(job_data, '$.contents') = ?");
        }

        // in-flight claims are untouchable
        let sql = format!(
            "DELETE FROM \"{t}\" WHERE error IS NULL \
               AND (claimed_until IS NULL OR claimed_until <= ?) AND ({condition})",
            t = self.config.table,
        );

        let now = epoch();
        let mut query = sqlx::query(&sql).bind(now);
        if let Some(job_id) = job_id {
            query = query.bind(job_id.to_string());
        }
        if let Some(contents) = contents {
            query = query.bind(contents.to_string());
        }

        Ok(self.run(query).await?.rows_affected() as usize)
    }

    async fn clear(&mut self) -> Result<usize> {
        let sql = format!("DELETE FROM \"{t}\"", t = self.config.table);
        Ok(self.run(sqlx::query(&sql)).await?.rows_affected() as usize)
    }

    fn is_fatal(&self, error: &DriverError) -> bool {
        matches!(
            error,
            DriverError::Sql(sqlx::Error::Io(_))
                | DriverError::Sql(sqlx::Error::PoolClosed)
                | DriverError::Sql(sqlx::Error::PoolTimedOut)
        )
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(id) = self.registration.take() {
            wake::unregister(&self.identity, id);
        }
        if !self.closed {
            self.tx = None;
            self.pool.close().await;
            self.closed = true;
        }
        Ok(())
    }

    fn wake_handle(&self) -> Wake {
        self.wake.clone()
    }

    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(DriverError::Claim("transaction already open".to_string()));
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &tempfile::TempDir, deadmode: DeadMode) -> SqliteConfig {
        SqliteConfig {
            database: dir.path().join("queue.db"),
            waittime: 0.05,
            deadmode,
            ..Default::default()
        }
    }

    async fn open(dir: &tempfile::TempDir, deadmode: DeadMode) -> SqliteDriver {
        let mut driver = SqliteDriver::connect(test_config(dir, deadmode)).await.unwrap();
        driver.setup(true).await.unwrap();
        driver
    }

    #[tokio::test]
    async fn test_send_assigns_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = open(&dir, DeadMode::Discard).await;

        let first = driver.send("a", SendOptions::default()).await.unwrap().unwrap();
        let second = driver.send("b", SendOptions::default()).await.unwrap().unwrap();
        assert!(second.parse::<i64>().unwrap() > first.parse::<i64>().unwrap());
    }

    #[tokio::test]
    async fn test_dead_table_moves_job_with_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = open(&dir, DeadMode::Table).await;

        driver.send("doomed", SendOptions::default()).await.unwrap();
        let message = driver.select().await.unwrap().unwrap();
        driver
            .resolve(&message, Outcome::Dead { error: "kaput".to_string() })
            .await
            .unwrap();

        assert!(driver.select().await.unwrap().is_none());

        let rows = driver
            .fetch_all(sqlx::query("SELECT error FROM \"toiler_dead\""))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<&str, _>("error"), "kaput");
    }

    #[tokio::test]
    async fn test_dead_column_keeps_row_unselectable() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = open(&dir, DeadMode::Column).await;

        driver.send("doomed", SendOptions::default()).await.unwrap();
        let message = driver.select().await.unwrap().unwrap();
        driver
            .resolve(&message, Outcome::Dead { error: "kaput".to_string() })
            .await
            .unwrap();

        assert!(driver.select().await.unwrap().is_none());
        // the row is still there, carrying the error
        let rows = driver
            .fetch_all(sqlx::query("SELECT error FROM \"toiler\" WHERE error IS NOT NULL"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_sends() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = open(&dir, DeadMode::Discard).await;

        driver.begin().await.unwrap();
        driver.send("ghost", SendOptions::default()).await.unwrap();
        driver.rollback().await.unwrap();

        assert_eq!(driver.clear().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancel_spares_claimed_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = open(&dir, DeadMode::Discard).await;

        driver.send("keep", SendOptions::default()).await.unwrap();
        driver.send("drop", SendOptions::default()).await.unwrap();

        let claimed = driver.select().await.unwrap().unwrap();
        assert_eq!(claimed.contents, "keep");

        assert_eq!(driver.cancel(None, Some("keep")).await.unwrap(), 0);
        assert_eq!(driver.cancel(None, Some("drop")).await.unwrap(), 1);

        driver.resolve(&claimed, Outcome::Ack).await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_without_claim_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = open(&dir, DeadMode::Discard).await;

        let phantom = Message::new("1", "x", 0, 0.0);
        let result = driver.resolve(&phantom, Outcome::Ack).await;
        assert!(matches!(result, Err(DriverError::Claim(_))));
    }

    #[test]
    fn test_config_rejects_bad_table() {
        let config = SqliteConfig { table: "jobs; drop".to_string(), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_url_configuration() {
        let url = BackendUrl::parse("sqlite:///tmp/q.db?table=jobs&deadmode=column&waittime=0.25").unwrap();
        let config = SqliteConfig::from_url(&url).unwrap();
        assert_eq!(config.database, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.table, "jobs");
        assert_eq!(config.deadmode, DeadMode::Column);
        assert_eq!(config.waittime, 0.25);
    }
}

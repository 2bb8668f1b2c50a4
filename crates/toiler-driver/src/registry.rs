use crate::{BackendUrl, Driver, DriverError, FileSystemDriver, FsConfig, MemoryConfig, MemoryDriver, Result, SqliteConfig, SqliteDriver};
use tracing::info;

/// Open the backend named by a URL.
///
/// The scheme picks the driver, everything else is driver configuration:
///
/// - `sqlite:///path/to/queue.db?table=jobs&deadmode=table`
/// - `file:///var/spool/jobs.job?waittime=2`
/// - `memory://name?ttr=60`
pub async fn connect(url: &str) -> Result<Box<dyn Driver>> {
    let parsed = BackendUrl::parse(url)?;
    let driver: Box<dyn Driver> = match parsed.scheme.as_str() {
        "sqlite" => Box::new(SqliteDriver::connect(SqliteConfig::from_url(&parsed)?).await?),
        "file" => Box::new(FileSystemDriver::new(FsConfig::from_url(&parsed)?)?),
        "memory" => Box::new(MemoryDriver::new(MemoryConfig::from_url(&parsed)?)?),
        other => return Err(DriverError::Config(format!("unknown backend scheme: {other:?}"))),
    };
    info!("connected to {}", driver.describe());
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let driver = connect("memory://registry-test").await.unwrap();
        assert_eq!(driver.describe(), "memory registry-test");
    }

    #[tokio::test]
    async fn test_connect_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}/spool.job", dir.path().display());
        let driver = connect(&url).await.unwrap();
        assert!(driver.describe().starts_with("file "));
    }

    #[tokio::test]
    async fn test_connect_unknown_scheme() {
        assert!(matches!(connect("redis://nope").await, Err(DriverError::Config(_))));
    }
}

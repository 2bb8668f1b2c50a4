//! Producer side of the queue: enqueue jobs over any backend, with
//! optional transactional batching where the backend supports it.

use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use toiler_core::{Listener, NullListener};
use toiler_driver::{connect, Driver, DriverError, SendOptions};
use tracing::debug;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Driver(#[from] DriverError),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A queue producer bound to one backend handle.
pub struct Client {
    driver: Box<dyn Driver>,
    listener: Arc<dyn Listener>,
}

impl Client {
    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Client::new(connect(url).await?))
    }

    pub fn new(driver: Box<dyn Driver>) -> Self {
        Client { driver, listener: Arc::new(NullListener) }
    }

    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listener = listener;
        self
    }

    /// Create (or with `forcibly`, recreate) the backend's storage.
    pub async fn setup(&mut self, forcibly: bool) -> Result<()> {
        self.driver.setup(forcibly).await?;
        Ok(())
    }

    /// Enqueue one immediately-claimable job.
    pub async fn send(&mut self, contents: &str) -> Result<Option<String>> {
        self.send_with(contents, SendOptions::default()).await
    }

    /// Enqueue one job with explicit priority, schedule, and timeout.
    pub async fn send_with(&mut self, contents: &str, options: SendOptions) -> Result<Option<String>> {
        let immediate = options.is_immediate();
        let job_id = self.driver.send(contents, options).await?;
        if immediate {
            self.driver.notify(1).await?;
        }
        self.listener.on_send(job_id.as_deref());
        Ok(job_id)
    }

    /// Enqueue a batch in one backend transaction, then wake workers once
    /// for however many of the jobs are immediately claimable.
    pub async fn send_bulk(&mut self, batch: &[(&str, SendOptions)]) -> Result<Vec<Option<String>>> {
        let immediate = batch.iter().filter(|(_, options)| options.is_immediate()).count();

        let ids = self
            .transactional(|client| {
                let batch: Vec<(String, SendOptions)> = batch
                    .iter()
                    .map(|(contents, options)| (contents.to_string(), options.clone()))
                    .collect();
                Box::pin(async move {
                    let mut ids = Vec::with_capacity(batch.len());
                    for (contents, options) in batch {
                        ids.push(client.driver.send(&contents, options).await?);
                    }
                    Ok(ids)
                })
            })
            .await?;

        if immediate > 0 {
            self.driver.notify(immediate).await?;
        }
        for id in &ids {
            self.listener.on_send(id.as_deref());
        }
        debug!("sent {} jobs ({} immediate)", ids.len(), immediate);
        Ok(ids)
    }

    /// Run `f` inside a backend transaction: commit on `Ok`, roll back and
    /// propagate on `Err`. Backends without transactions treat this as a
    /// plain scope.
    pub async fn transactional<T, F>(&mut self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Client) -> BoxFuture<'a, Result<T>>,
    {
        self.driver.begin().await?;
        match f(self).await {
            Ok(value) => {
                self.driver.commit().await?;
                Ok(value)
            }
            Err(e) => {
                self.driver.rollback().await?;
                Err(e)
            }
        }
    }

    /// Remove unclaimed jobs matching an id or exact contents.
    pub async fn cancel(&mut self, job_id: Option<&str>, contents: Option<&str>) -> Result<usize> {
        Ok(self.driver.cancel(job_id, contents).await?)
    }

    /// Drop every unclaimed job.
    pub async fn clear(&mut self) -> Result<usize> {
        Ok(self.driver.clear().await?)
    }

    /// Nudge up to `count` sleeping workers.
    pub async fn notify(&mut self, count: usize) -> Result<usize> {
        Ok(self.driver.notify(count).await?)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.driver.close().await?;
        Ok(())
    }
}

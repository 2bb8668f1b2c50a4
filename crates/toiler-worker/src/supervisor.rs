use crate::{ProcessControl, ProcessEvent, Result, ScaleCommand, WorkerError, EXIT_CLEAN, EXIT_RESTART};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Core pool size, kept alive at all times.
    pub least: usize,
    /// Hard ceiling including elastic workers.
    pub most: usize,
    /// Pause before replacing a crashed child.
    pub respawn_pause: f64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig { least: 1, most: 8, respawn_pause: 1.0 }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.least < 1 {
            return Err(WorkerError::Config("least must be at least 1".to_string()));
        }
        if self.most < self.least {
            return Err(WorkerError::Config("most must not be below least".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildKind {
    /// One of the `least` permanent workers.
    Core,
    /// Added under load, first to go when it lifts.
    Elastic,
}

/// What to do when a child we killed on purpose reports its exit.
#[derive(Debug, Clone, Copy)]
enum ExitPlan {
    /// Let it go (scale-down, shutdown).
    Forget,
    /// Start a successor (rolling restart).
    Replace,
}

/// Keeps a pool of worker processes sized to the load.
///
/// Children vote through `ScaleCommand`s: a busy worker asks for one more,
/// an idle one offers to shrink. The supervisor grows with elastic workers
/// up to `most` and never drops below `least`. Crashed children are
/// replaced; SIGHUP rolls the whole pool over one child at a time.
pub struct Supervisor<P: ProcessControl> {
    control: P,
    config: SupervisorConfig,
    children: HashMap<u32, ChildKind>,
    pending: HashMap<u32, ExitPlan>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    stopping: bool,
}

impl<P: ProcessControl> Supervisor<P> {
    pub fn new(control: P, config: SupervisorConfig, events: mpsc::UnboundedReceiver<ProcessEvent>) -> Result<Self> {
        config.validate()?;
        Ok(Supervisor {
            control,
            config,
            children: HashMap::new(),
            pending: HashMap::new(),
            events,
            stopping: false,
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("starting {} workers (ceiling {})", self.config.least, self.config.most);
        for _ in 0..self.config.least {
            let pid = self.control.spawn().await?;
            self.children.insert(pid, ChildKind::Core);
        }
        Ok(())
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    fn elastic_pid(&self) -> Option<u32> {
        self.children
            .iter()
            .find(|(_, kind)| **kind == ChildKind::Elastic)
            .map(|(pid, _)| *pid)
    }

    pub async fn handle_event(&mut self, event: ProcessEvent) -> Result<()> {
        match event {
            ProcessEvent::Scale { pid, command: ScaleCommand::Increase } => {
                if self.children.len() >= self.config.most {
                    debug!("[{pid}] asked for help, pool at ceiling");
                } else {
                    let new_pid = self.control.spawn().await?;
                    self.children.insert(new_pid, ChildKind::Elastic);
                    info!("[{pid}] busy, added elastic worker {new_pid} ({} total)", self.children.len());
                }
            }
            ProcessEvent::Scale { pid, command: ScaleCommand::Decrease } => {
                // only ever shrink the elastic margin
                if let Some(victim) = self.elastic_pid() {
                    info!("[{pid}] idle, retiring elastic worker {victim}");
                    self.pending.insert(victim, ExitPlan::Forget);
                    self.control.kill(victim).await?;
                }
            }
            ProcessEvent::Exited { pid, code } => self.handle_exit(pid, code).await?,
        }
        Ok(())
    }

    async fn handle_exit(&mut self, pid: u32, code: i32) -> Result<()> {
        let kind = match self.children.remove(&pid) {
            Some(kind) => kind,
            None => return Ok(()),
        };
        let plan = self.pending.remove(&pid);
        if self.stopping {
            return Ok(());
        }

        match plan {
            Some(ExitPlan::Forget) => {
                debug!("worker {pid} retired ({} left)", self.children.len());
            }
            Some(ExitPlan::Replace) | None => {
                if code != EXIT_CLEAN && code != EXIT_RESTART {
                    warn!("worker {pid} died with code {code}");
                    if self.config.respawn_pause > 0.0 {
                        tokio::time::sleep(Duration::from_secs_f64(self.config.respawn_pause)).await;
                    }
                }
                let new_pid = self.control.spawn().await?;
                self.children.insert(new_pid, kind);
                info!("worker {pid} replaced by {new_pid}");
            }
        }
        Ok(())
    }

    /// Kill every child, replacing each as it dies. New code (or config)
    /// takes over without the pool ever emptying.
    pub async fn rolling_restart(&mut self) -> Result<()> {
        let pids: Vec<u32> = self.children.keys().copied().collect();
        info!("rolling restart of {} workers", pids.len());
        for pid in pids {
            self.pending.insert(pid, ExitPlan::Replace);
            self.control.kill(pid).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.stopping = true;
        let pids: Vec<u32> = self.children.keys().copied().collect();
        info!("stopping {} workers", pids.len());
        for pid in pids {
            self.pending.insert(pid, ExitPlan::Forget);
            self.control.kill(pid).await?;
        }
        while !self.children.is_empty() {
            match tokio::time::timeout(Duration::from_secs(30), self.events.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await?,
                _ => {
                    warn!("gave up waiting on {} workers", self.children.len());
                    break;
                }
            }
        }
        Ok(())
    }

    /// Supervise until SIGTERM or SIGINT; SIGHUP rolls the pool.
    pub async fn run(mut self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hup = signal(SignalKind::hangup())?;
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;

        self.start().await?;
        loop {
            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event).await?,
                _ = hup.recv() => self.rolling_restart().await?,
                _ = term.recv() => break,
                _ = int.recv() => break,
            }
        }
        self.shutdown().await
    }

    #[cfg(test)]
    async fn drain_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FakeProcessControl;

    fn pool(least: usize, most: usize) -> Supervisor<FakeProcessControl> {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = FakeProcessControl::new(tx);
        let config = SupervisorConfig { least, most, respawn_pause: 0.0 };
        Supervisor::new(control, config, rx).unwrap()
    }

    #[tokio::test]
    async fn test_start_spawns_the_core_pool() {
        let mut supervisor = pool(3, 8);
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.child_count(), 3);
        assert_eq!(supervisor.control.spawned.len(), 3);
    }

    #[tokio::test]
    async fn test_increase_grows_until_the_ceiling() {
        let mut supervisor = pool(2, 4);
        supervisor.start().await.unwrap();
        let voter = supervisor.control.spawned[0];

        for _ in 0..5 {
            supervisor
                .handle_event(ProcessEvent::Scale { pid: voter, command: ScaleCommand::Increase })
                .await
                .unwrap();
        }
        assert_eq!(supervisor.child_count(), 4);
    }

    #[tokio::test]
    async fn test_decrease_retires_only_elastic_workers() {
        let mut supervisor = pool(2, 4);
        supervisor.start().await.unwrap();
        let voter = supervisor.control.spawned[0];

        supervisor
            .handle_event(ProcessEvent::Scale { pid: voter, command: ScaleCommand::Increase })
            .await
            .unwrap();
        assert_eq!(supervisor.child_count(), 3);

        // two decreases: one retires the elastic worker, the second finds
        // nothing elastic to retire
        for _ in 0..2 {
            supervisor
                .handle_event(ProcessEvent::Scale { pid: voter, command: ScaleCommand::Decrease })
                .await
                .unwrap();
            supervisor.drain_events().await.unwrap();
        }
        assert_eq!(supervisor.child_count(), 2);
        assert_eq!(supervisor.control.killed.len(), 1);
    }

    #[tokio::test]
    async fn test_crashed_child_is_replaced() {
        let mut supervisor = pool(2, 4);
        supervisor.start().await.unwrap();
        let crashed = supervisor.control.spawned[0];

        supervisor
            .handle_event(ProcessEvent::Exited { pid: crashed, code: -1 })
            .await
            .unwrap();
        assert_eq!(supervisor.child_count(), 2);
        assert!(!supervisor.children.contains_key(&crashed));
    }

    #[tokio::test]
    async fn test_restart_exit_code_is_replaced_without_pause() {
        let (tx, rx) = mpsc::unbounded_channel();
        let control = FakeProcessControl::new(tx);
        // a nonzero pause would hang the test if the pause branch ran
        let config = SupervisorConfig { least: 1, most: 2, respawn_pause: 1000.0 };
        let mut supervisor = Supervisor::new(control, config, rx).unwrap();
        supervisor.start().await.unwrap();
        let pid = supervisor.control.spawned[0];

        supervisor
            .handle_event(ProcessEvent::Exited { pid, code: EXIT_RESTART })
            .await
            .unwrap();
        assert_eq!(supervisor.child_count(), 1);
    }

    #[tokio::test]
    async fn test_rolling_restart_replaces_everyone() {
        let mut supervisor = pool(3, 8);
        supervisor.start().await.unwrap();
        let original: Vec<u32> = supervisor.control.spawned.clone();

        supervisor.rolling_restart().await.unwrap();
        supervisor.drain_events().await.unwrap();

        assert_eq!(supervisor.child_count(), 3);
        for pid in original {
            assert!(!supervisor.children.contains_key(&pid));
        }
    }

    #[tokio::test]
    async fn test_shutdown_forgets_everyone() {
        let mut supervisor = pool(2, 4);
        supervisor.start().await.unwrap();
        supervisor.shutdown().await.unwrap();
        assert_eq!(supervisor.child_count(), 0);
        assert_eq!(supervisor.control.killed.len(), 2);
    }

    #[test]
    fn test_config_bounds() {
        assert!(SupervisorConfig { least: 0, most: 4, respawn_pause: 0.0 }.validate().is_err());
        assert!(SupervisorConfig { least: 4, most: 2, respawn_pause: 0.0 }.validate().is_err());
    }
}

use crate::{Result, ScaleCommand};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// What the supervisor hears back from its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Exited { pid: u32, code: i32 },
    Scale { pid: u32, command: ScaleCommand },
}

/// How the supervisor starts and stops worker processes. The OS
/// implementation re-execs the binary; tests swap in a fake.
#[async_trait]
pub trait ProcessControl: Send {
    async fn spawn(&mut self) -> Result<u32>;
    async fn kill(&mut self, pid: u32) -> Result<()>;
}

/// Real child processes. Each child's stdout is read line by line for
/// scale verdicts; its exit lands as an event on the shared channel.
pub struct OsProcessControl {
    argv: Vec<String>,
    events: mpsc::UnboundedSender<ProcessEvent>,
    kill_handles: HashMap<u32, oneshot::Sender<()>>,
}

impl OsProcessControl {
    pub fn new(argv: Vec<String>, events: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        OsProcessControl { argv, events, kill_handles: HashMap::new() }
    }

    async fn monitor(mut child: Child, pid: u32, events: mpsc::UnboundedSender<ProcessEvent>, mut kill_rx: oneshot::Receiver<()>) {
        if let Some(stdout) = child.stdout.take() {
            let events = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match ScaleCommand::parse_line(&line) {
                        Some(command) => {
                            let _ = events.send(ProcessEvent::Scale { pid, command });
                        }
                        None => debug!("[{pid}] {line}"),
                    }
                }
            });
        }

        let mut killed = false;
        let code = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.ok().and_then(|s| s.code()).unwrap_or(-1);
                }
                _ = &mut kill_rx, if !killed => {
                    killed = true;
                    if let Err(e) = child.start_kill() {
                        warn!("[{pid}] kill failed: {e}");
                    }
                }
            }
        };
        let _ = events.send(ProcessEvent::Exited { pid, code });
    }
}

#[async_trait]
impl ProcessControl for OsProcessControl {
    async fn spawn(&mut self) -> Result<u32> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().unwrap_or(0);

        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill_handles.insert(pid, kill_tx);
        tokio::spawn(Self::monitor(child, pid, self.events.clone(), kill_rx));
        debug!("spawned worker {pid}");
        Ok(pid)
    }

    async fn kill(&mut self, pid: u32) -> Result<()> {
        if let Some(kill_tx) = self.kill_handles.remove(&pid) {
            let _ = kill_tx.send(());
        }
        Ok(())
    }
}

/// Records spawns and kills; a kill reports the child as exited so the
/// supervisor's bookkeeping can be driven synchronously in tests.
pub struct FakeProcessControl {
    next_pid: u32,
    pub spawned: Vec<u32>,
    pub killed: Vec<u32>,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

impl FakeProcessControl {
    pub fn new(events: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        FakeProcessControl { next_pid: 100, spawned: Vec::new(), killed: Vec::new(), events }
    }
}

#[async_trait]
impl ProcessControl for FakeProcessControl {
    async fn spawn(&mut self) -> Result<u32> {
        self.next_pid += 1;
        self.spawned.push(self.next_pid);
        Ok(self.next_pid)
    }

    async fn kill(&mut self, pid: u32) -> Result<()> {
        self.killed.push(pid);
        let _ = self.events.send(ProcessEvent::Exited { pid, code: 0 });
        Ok(())
    }
}

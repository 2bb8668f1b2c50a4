use crate::{Result, WorkerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use toiler_driver::Wake;
use tracing::info;

pub fn signal_kind(name: &str) -> Result<SignalKind> {
    match name {
        "term" => Ok(SignalKind::terminate()),
        "int" => Ok(SignalKind::interrupt()),
        "hup" => Ok(SignalKind::hangup()),
        "quit" => Ok(SignalKind::quit()),
        "usr1" => Ok(SignalKind::user_defined1()),
        "usr2" => Ok(SignalKind::user_defined2()),
        other => Err(WorkerError::Config(format!("unknown signal: {other:?}"))),
    }
}

/// Bridges process signals into the worker loop: stop signals flip a flag
/// the loop checks at cycle boundaries, SIGUSR1 just interrupts the idle
/// wait. Either way the wake is poked so a sleeping worker reacts now,
/// not a waittime later.
#[derive(Clone)]
pub struct SignalBridge {
    running: Arc<AtomicBool>,
    wake: Wake,
}

impl SignalBridge {
    pub fn install(stop_signals: &[String], wake: Wake) -> Result<Self> {
        let bridge = SignalBridge {
            running: Arc::new(AtomicBool::new(true)),
            wake,
        };

        for name in stop_signals {
            let mut stream = signal(signal_kind(name)?)?;
            let name = name.clone();
            let running = bridge.running.clone();
            let wake = bridge.wake.clone();
            tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    info!("received sig{}", name);
                    running.store(false, Ordering::SeqCst);
                    wake.wake();
                }
            });
        }

        let mut usr1 = signal(SignalKind::user_defined1())?;
        let wake = bridge.wake.clone();
        tokio::spawn(async move {
            while usr1.recv().await.is_some() {
                wake.wake();
            }
        });

        Ok(bridge)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Programmatic stop, same effect as a stop signal.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.wake();
    }
}

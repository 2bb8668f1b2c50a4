use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use toiler_core::{Message, WorkError};
use toiler_worker::{
    OsProcessControl, Supervisor, SupervisorConfig, WorkFn, Worker, WorkerConfig, WorkerError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "toiler-worker")]
#[command(about = "Job queue worker", long_about = None)]
struct Args {
    /// Backend URL, e.g. sqlite:///var/lib/toiler/queue.db?table=jobs
    #[arg(short, long)]
    url: String,

    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Create the backend storage before starting
    #[arg(long)]
    setup: bool,

    /// Run job contents as a shell command instead of just logging them
    #[arg(long)]
    exec: bool,

    /// Supervise a pool of worker processes, sized least:most (e.g. 2:8)
    #[arg(long)]
    fork: Option<String>,
}

fn parse_pool(spec: &str) -> anyhow::Result<SupervisorConfig> {
    let (least, most) = spec
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("pool size must look like least:most"))?;
    let config = SupervisorConfig {
        least: least.parse()?,
        most: most.parse()?,
        ..Default::default()
    };
    config.validate()?;
    Ok(config)
}

/// The child argv for fork mode: this binary, same flags, minus --fork.
fn child_argv() -> Vec<String> {
    let mut argv = vec![std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "toiler-worker".to_string())];
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--fork" {
            args.next();
            continue;
        }
        if arg.starts_with("--fork=") {
            continue;
        }
        argv.push(arg);
    }
    argv
}

fn work_fn(exec: bool) -> WorkFn {
    Arc::new(move |message: Message| {
        Box::pin(async move {
            if !exec {
                tracing::info!("{}", message.contents);
                return Ok(None);
            }
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&message.contents)
                .output()
                .await
                .map_err(WorkError::failed)?;
            if output.status.success() {
                Ok(Some(String::from_utf8_lossy(&output.stdout).trim_end().to_string()))
            } else {
                Err(WorkError::failed(format!(
                    "command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim_end(),
                )))
            }
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };

    if let Some(spec) = &args.fork {
        let pool = parse_pool(spec)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let control = OsProcessControl::new(child_argv(), events_tx);
        let supervisor = Supervisor::new(control, pool, events_rx)?;
        supervisor.run().await?;
        return Ok(());
    }

    let mut driver = toiler_driver::connect(&args.url).await.map_err(WorkerError::from)?;
    if args.setup {
        driver.setup(false).await.map_err(WorkerError::from)?;
    }

    let worker = Worker::new(driver, work_fn(args.exec), config)?.with_scale_stdout();
    let code = worker.run().await?;
    std::process::exit(code);
}

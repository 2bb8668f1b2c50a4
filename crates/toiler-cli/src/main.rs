use clap::{Parser, Subcommand};
use toiler_client::Client;
use toiler_driver::{SendOptions, When};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "toiler")]
#[command(about = "Job queue admin CLI", long_about = None)]
struct Args {
    /// Backend URL, e.g. sqlite:///var/lib/toiler/queue.db?table=jobs
    #[arg(short, long)]
    url: String,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the backend storage
    Setup {
        /// Drop and recreate existing storage
        #[arg(long)]
        forcibly: bool,
    },

    /// Enqueue a job
    Send {
        /// Job contents
        contents: String,

        /// Priority, higher runs first
        #[arg(short, long)]
        priority: Option<i64>,

        /// Delay in seconds before the job becomes claimable
        #[arg(short, long)]
        delay: Option<f64>,

        /// Per-job timeout in seconds (0 = worker default)
        #[arg(short, long, default_value = "0")]
        timeout: f64,
    },

    /// Remove unclaimed jobs by id or exact contents
    Cancel {
        /// Job id
        #[arg(long)]
        job_id: Option<String>,

        /// Exact contents match
        #[arg(long)]
        contents: Option<String>,
    },

    /// Drop every unclaimed job
    Clear,

    /// Wake sleeping workers
    Notify {
        /// How many workers to wake
        #[arg(default_value = "1")]
        count: usize,
    },

    /// Report whether the backend is in standby
    Standby,
}

fn report(format: &str, key: &str, value: impl serde::Serialize + std::fmt::Display) {
    match format {
        "json" => println!("{}", serde_json::json!({ (key): value })),
        _ => println!("{key}: {value}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match args.command {
        Commands::Setup { forcibly } => {
            let mut client = Client::connect(&args.url).await?;
            client.setup(forcibly).await?;
            client.close().await?;
            report(&args.format, "setup", "ok");
        }

        Commands::Send { contents, priority, delay, timeout } => {
            let mut client = Client::connect(&args.url).await?;
            let options = SendOptions {
                priority,
                when: delay.map(When::Delay),
                timeout,
            };
            let job_id = client.send_with(&contents, options).await?;
            client.close().await?;
            report(&args.format, "job_id", job_id.unwrap_or_else(|| "-".to_string()));
        }

        Commands::Cancel { job_id, contents } => {
            if job_id.is_none() && contents.is_none() {
                anyhow::bail!("cancel needs --job-id or --contents");
            }
            let mut client = Client::connect(&args.url).await?;
            let cancelled = client.cancel(job_id.as_deref(), contents.as_deref()).await?;
            client.close().await?;
            report(&args.format, "cancelled", cancelled);
        }

        Commands::Clear => {
            let mut client = Client::connect(&args.url).await?;
            let cleared = client.clear().await?;
            client.close().await?;
            report(&args.format, "cleared", cleared);
        }

        Commands::Notify { count } => {
            let mut client = Client::connect(&args.url).await?;
            let woken = client.notify(count).await?;
            client.close().await?;
            report(&args.format, "woken", woken);
        }

        Commands::Standby => {
            let mut driver = toiler_driver::connect(&args.url).await?;
            let standby = driver.is_standby().await?;
            driver.close().await?;
            report(&args.format, "standby", standby);
        }
    }

    Ok(())
}

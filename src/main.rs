use clap::Parser;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use varlock::config::Config;
use varlock::domain::duration::parse_duration;
use varlock::{HttpClient, LeaserOptions, LockLeaser, Locks, RetryClient, Variable, VariableLock};

/// Run a command only while holding the lock on a variable path.
#[derive(Parser, Debug)]
#[command(name = "varlock", version)]
struct Cli {
    /// Lease duration requested from the service
    #[arg(long, default_value = "15s", value_parser = parse_duration)]
    ttl: Duration,

    /// Time an expired lock stays blocked before it can be taken again
    #[arg(long, default_value = "15s", value_parser = parse_duration)]
    lock_delay: Duration,

    /// Attempts per lock request on retryable server errors
    #[arg(long)]
    max_retry: Option<u32>,

    /// Base delay between attempts, doubled on each retry
    #[arg(long, value_parser = parse_duration)]
    retry_delay: Option<Duration>,

    /// Identity reported for this runner (defaults to a random id)
    #[arg(long)]
    id: Option<String>,

    /// Run the command through `/bin/sh -c`
    #[arg(long)]
    shell: bool,

    /// Variable path to lock
    path: String,

    /// Command to run while the lock is held
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "varlock=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_env()?;
    if let Some(max_retry) = cli.max_retry {
        config.retry.max_retries = max_retry;
    }
    if let Some(retry_delay) = cli.retry_delay {
        config.retry.delay_base = retry_delay;
    }
    tracing::debug!("Configuration loaded, service at {}", config.address);

    let http_client = HttpClient::from_config(&config)?;
    let retry_client = RetryClient::new(Arc::new(http_client), config.retry.clone());

    let mut variable = Variable::new(cli.path.clone())
        .with_lock(VariableLock::new(cli.ttl, cli.lock_delay));
    if let Some(namespace) = &config.namespace {
        variable = variable.with_namespace(namespace.clone());
    }
    let locks = Locks::new(retry_client, variable)?;

    let id = cli
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    // The runner is done once the child exits
    let options = LeaserOptions {
        release_on_completion: true,
        ..LeaserOptions::default()
    };
    let leaser = LockLeaser::new(id, Arc::new(locks), cli.ttl, options);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    let command = Arc::new(build_command_line(&cli));
    leaser
        .start(cancel, move |token| run_child(command.clone(), token))
        .await?;

    Ok(())
}

fn build_command_line(cli: &Cli) -> Vec<String> {
    if cli.shell {
        vec!["/bin/sh".to_string(), "-c".to_string(), cli.command.join(" ")]
    } else {
        cli.command.clone()
    }
}

/// Runs the child to completion, killing it if the lease is lost first.
async fn run_child(command_line: Arc<Vec<String>>, token: CancellationToken) -> anyhow::Result<()> {
    let (program, args) = command_line
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("no command given"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to start {}: {}", program, e))?;
    tracing::info!("Started {} (pid {:?})", program, child.id());

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if status.success() {
                Ok(())
            } else {
                Err(anyhow::anyhow!("{} exited with {}", program, status))
            }
        }
        _ = token.cancelled() => {
            tracing::warn!("Lock no longer held, stopping {}", program);
            child.kill().await?;
            Ok(())
        }
    }
}

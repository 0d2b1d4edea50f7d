use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use tokio::time::sleep;
use tracing::{info, warn};

use postbox_core::app::{Postbox, PostboxBuilder};
use postbox_core::domain::{Address, DeliveryState, EnvironmentPolicy, MessageId, SendParams};
use postbox_core::error::ConfigError;
use postbox_core::impls::sendgrid::DEFAULT_ENDPOINT;
use postbox_core::impls::{RecordingTransport, SendGridConfig, SendGridTransport};
use postbox_core::observability::MessageStatus;
use postbox_core::ports::DeliveryTransport;
use postbox_core::queue::{FileRecordStore, MessageQueue, RetryPolicy};

#[derive(Debug, Parser)]
#[command(name = "postbox", version, about = "Queue and deliver transactional email")]
struct Cli {
    #[command(flatten)]
    config: RuntimeConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct RuntimeConfig {
    /// Deployment environment; only production delivers for real.
    #[arg(long = "env", env = "POSTBOX_ENV", default_value = "development")]
    environment: String,

    #[arg(long, env = "SENDGRID_API_KEY", hide_env_values = true)]
    sendgrid_api_key: Option<String>,

    #[arg(long, env = "SENDGRID_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    sendgrid_endpoint: String,

    /// In-flight delivery limit.
    #[arg(long, env = "POSTBOX_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Deliveries per message before dead-lettering; 0 retries forever.
    #[arg(long, env = "POSTBOX_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    #[arg(long, env = "POSTBOX_VISIBILITY_TIMEOUT_SECS", default_value_t = 30)]
    visibility_timeout_secs: u64,

    #[arg(long, env = "POSTBOX_SEND_TIMEOUT_SECS", default_value_t = 10)]
    send_timeout_secs: u64,

    /// Directory the queue spools messages to. Required in production;
    /// elsewhere the queue stays in memory when unset.
    #[arg(long, env = "POSTBOX_SPOOL_DIR")]
    spool_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish one email and wait until it is delivered or dead-lettered.
    Send(SendArgs),
}

#[derive(Debug, Args)]
struct SendArgs {
    /// Read the request as JSON from stdin instead of flags.
    #[arg(long, conflicts_with_all = ["from", "to", "subject", "text", "html"])]
    stdin: bool,

    #[arg(long, required_unless_present = "stdin")]
    from: Option<String>,

    #[arg(long, default_value = "")]
    from_name: String,

    #[arg(long, required_unless_present = "stdin")]
    to: Option<String>,

    #[arg(long, default_value = "")]
    to_name: String,

    #[arg(long)]
    subject: Option<String>,

    #[arg(long)]
    text: Option<String>,

    #[arg(long)]
    html: Option<String>,

    /// How long in-flight deliveries get to finish on shutdown.
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

impl SendArgs {
    fn params(&self) -> anyhow::Result<SendParams> {
        if self.stdin {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("read request from stdin")?;
            return serde_json::from_str(&raw).context("parse request JSON");
        }

        Ok(SendParams {
            from: Address::new(&self.from_name, self.from.clone().unwrap_or_default()),
            to: Address::new(&self.to_name, self.to.clone().unwrap_or_default()),
            subject: self.subject.clone().unwrap_or_default(),
            text: self.text.clone().unwrap_or_default(),
            html: self.html.clone().unwrap_or_default(),
        })
    }
}

impl RuntimeConfig {
    fn retry_policy(&self) -> RetryPolicy {
        match self.max_attempts {
            0 => RetryPolicy::default().unlimited(),
            n => RetryPolicy::default().with_max_attempts(n),
        }
    }

    fn transport(&self, policy: &EnvironmentPolicy) -> Result<Arc<dyn DeliveryTransport>, ConfigError> {
        if !policy.is_production() {
            // Never called outside production, but the dispatcher still needs one.
            return Ok(Arc::new(RecordingTransport::new()));
        }

        let api_key = self
            .sendgrid_api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing("SENDGRID_API_KEY"))?;

        let config = SendGridConfig {
            endpoint: self.sendgrid_endpoint.clone(),
            timeout: Duration::from_secs(self.send_timeout_secs),
            ..SendGridConfig::new(api_key)
        };
        let transport = SendGridTransport::new(config).map_err(|e| ConfigError::Invalid {
            name: "SENDGRID_API_KEY",
            reason: e.to_string(),
        })?;
        Ok(Arc::new(transport))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("POSTBOX_WORKERS", self.workers as u64),
            ("POSTBOX_VISIBILITY_TIMEOUT_SECS", self.visibility_timeout_secs),
            ("POSTBOX_SEND_TIMEOUT_SECS", self.send_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn build(&self) -> anyhow::Result<Postbox> {
        self.validate()?;

        let policy = EnvironmentPolicy::from_label(&self.environment)?;
        let transport = self.transport(&policy)?;

        let mut builder = PostboxBuilder::new()
            .policy(policy)
            .transport(transport)
            .retry_policy(self.retry_policy())
            .visibility_timeout(Duration::from_secs(self.visibility_timeout_secs))
            .send_timeout(Duration::from_secs(self.send_timeout_secs))
            .max_concurrency(self.workers);

        match &self.spool_dir {
            Some(dir) => {
                let store = FileRecordStore::open(dir)
                    .await
                    .with_context(|| format!("open spool {}", dir.display()))?;
                builder = builder.store(Arc::new(store));
            }
            None if policy.is_production() => {
                return Err(ConfigError::Missing("POSTBOX_SPOOL_DIR").into());
            }
            None => warn!("no spool directory set, queued messages are lost on exit"),
        }

        Ok(builder.build().await?)
    }
}

async fn wait_for_terminal(
    queue: &dyn MessageQueue,
    id: MessageId,
) -> anyhow::Result<MessageStatus> {
    loop {
        let status = queue
            .status(id)
            .await?
            .with_context(|| format!("message {id} vanished from the queue"))?;
        if status.state.is_terminal() {
            return Ok(status);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

async fn run_send(config: &RuntimeConfig, args: &SendArgs) -> anyhow::Result<()> {
    let params = args.params()?;
    let postbox = config.build().await?;
    info!(
        environment = %postbox.dispatcher().policy().environment(),
        workers = config.workers,
        "postbox starting"
    );

    let subscription = postbox.start().await?;
    let queue = postbox.queue();

    let response = postbox.publisher().send(&params).await?;

    let status = tokio::select! {
        res = wait_for_terminal(queue.as_ref(), response.message_id) => Some(res?),
        _ = tokio::signal::ctrl_c() => {
            warn!(message_id = %response.message_id, "interrupted before the message settled");
            None
        }
    };

    subscription.shutdown(Duration::from_secs(args.grace_secs)).await;
    queue.close().await;

    let status = match status {
        Some(status) => status,
        // Report whatever state the message was left in.
        None => queue
            .status(response.message_id)
            .await?
            .context("message vanished from the queue")?,
    };
    println!("{}", serde_json::to_string_pretty(&status)?);

    if status.state == DeliveryState::DeadLettered {
        bail!(
            "message {} was dead-lettered: {}",
            status.message_id,
            status.last_error.as_deref().unwrap_or("no error recorded")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a missing .env file is fine
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Send(args) => run_send(&cli.config, args).await,
    }
}

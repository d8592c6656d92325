//! cosign-gate CLI entry point.
//!
//! Provides `handle`, `verify`, and `lambda` subcommands for processing one
//! task state-change event, checking a single image, or running inside the
//! function runtime.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lambda_runtime::{service_fn, LambdaEvent};
use tokio::time::Instant;
use tracing::info;

use cosign_gate::aws::AccountScope;
use cosign_gate::config::GateConfig;
use cosign_gate::enforce::InvocationReport;
use cosign_gate::event::{ContainerImage, TaskEvent};
use cosign_gate::handler::{deadline_from_epoch_millis, Gate, InvocationError};
use cosign_gate::logging;
use cosign_gate::registry::ecr::parse_ecr_host;
use cosign_gate::registry::ImageReference;

/// cosign-gate: stops ECS tasks running images without a trusted signature.
#[derive(Parser)]
#[command(name = "cosign-gate", version, about)]
struct Cli {
    /// TOML config file; environment variables take precedence over it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Process one task state-change event and print the report.
    Handle {
        /// Event JSON file, or `-` for stdin.
        #[arg(long, default_value = "-")]
        event: String,
        /// Also write JSON logs to a daily-rotated file in this directory.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Verify one image and print the verdict, without enforcing anything.
    Verify {
        /// Image reference.
        image: String,
        /// Digest of the running image to evaluate instead of resolving the tag.
        #[arg(long)]
        digest: Option<String>,
        /// Account used to resolve an alias key (defaults to the ECR registry's).
        #[arg(long, requires = "region")]
        account: Option<String>,
        /// Region used to resolve an alias key (defaults to the ECR registry's).
        #[arg(long, requires = "account")]
        region: Option<String>,
    },
    /// Run as a function handler, one event per invocation.
    Lambda,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();

    match cli.command {
        Command::Handle { event, log_dir } => {
            handle_event(cli.config.as_deref(), &event, log_dir.as_deref()).await
        }
        Command::Verify {
            image,
            digest,
            account,
            region,
        } => {
            let scope = account.zip(region).map(|(a, r)| AccountScope::new(a, r));
            handle_verify(cli.config.as_deref(), image, digest, scope).await
        }
        Command::Lambda => handle_lambda(cli.config.as_deref()).await,
    }
}

/// Process one event read from a file or stdin.
async fn handle_event(
    config_path: Option<&Path>,
    source: &str,
    log_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let _logging_guard = match log_dir {
        Some(dir) => Some(
            logging::init_with_file(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?,
        ),
        None => {
            logging::init_cli();
            None
        }
    };

    let config = GateConfig::load(config_path).context("failed to load configuration")?;
    let payload = read_event(source)?;
    let event = TaskEvent::from_slice(&payload).context("failed to parse task event")?;

    let deadline = deadline_after(config.invocation_timeout);
    let gate = Gate::connect(config)
        .await
        .context("failed to build clients")?;

    match gate.handle(&event, deadline).await {
        Ok(report) => print_report(&report),
        Err(InvocationError::Unresolved { report }) => {
            print_report(&report)?;
            anyhow::bail!(
                "{} image(s) could not be verified; task left running",
                report.verification_errors()
            )
        }
        Err(e) => Err(e).context("invocation failed"),
    }
}

/// Verify a single image.
async fn handle_verify(
    config_path: Option<&Path>,
    image: String,
    digest: Option<String>,
    scope: Option<AccountScope>,
) -> anyhow::Result<()> {
    logging::init_cli();

    let config = GateConfig::load(config_path).context("failed to load configuration")?;
    let reference = ImageReference::parse(&image).context("invalid image reference")?;
    let scope = scope.or_else(|| {
        parse_ecr_host(reference.api_host()).map(|ecr| AccountScope::new(ecr.account, ecr.region))
    });

    let deadline = deadline_after(config.invocation_timeout);
    let gate = Gate::connect(config)
        .await
        .context("failed to build clients")?;

    let container = ContainerImage {
        name: "cli".to_owned(),
        image,
        image_digest: digest,
    };
    let verdict = gate
        .verify_image(&container, scope.as_ref(), deadline)
        .await
        .context("verification failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&verdict).context("failed to serialize verdict")?
    );
    if !verdict.is_verified() {
        anyhow::bail!("image {} is {}", container.image, verdict.label());
    }
    Ok(())
}

/// Run the function runtime loop.
async fn handle_lambda(config_path: Option<&Path>) -> anyhow::Result<()> {
    logging::init_json();

    let config = Arc::new(GateConfig::load(config_path).context("failed to load configuration")?);
    info!(
        key_source = config.key.kind(),
        topic = %config.notification_topic,
        "function runtime starting"
    );

    lambda_runtime::run(service_fn(move |event: LambdaEvent<serde_json::Value>| {
        let config = Arc::clone(&config);
        async move { invoke(&config, event).await }
    }))
    .await
    .map_err(|e| anyhow::anyhow!("function runtime stopped: {e}"))
}

/// One function invocation: fresh clients, one event.
async fn invoke(
    config: &GateConfig,
    event: LambdaEvent<serde_json::Value>,
) -> Result<InvocationReport, lambda_runtime::Error> {
    let LambdaEvent { payload, context } = event;
    info!(request_id = %context.request_id, "invocation received");

    let deadline = deadline_from_epoch_millis(context.deadline, config.invocation_timeout);
    let task_event = TaskEvent::from_value(payload).map_err(InvocationError::from)?;
    let gate = Gate::connect(config.clone()).await?;
    Ok(gate.handle(&task_event, deadline).await?)
}

fn read_event(source: &str) -> anyhow::Result<Vec<u8>> {
    if source == "-" {
        let mut payload = Vec::new();
        std::io::stdin()
            .read_to_end(&mut payload)
            .context("failed to read event from stdin")?;
        return Ok(payload);
    }
    std::fs::read(source).with_context(|| format!("failed to read event file {source}"))
}

fn print_report(report: &InvocationReport) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(report).context("failed to serialize report")?
    );
    Ok(())
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now)
}

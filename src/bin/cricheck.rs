//! cricheck - CRI conformance harness
//!
//! Runs the scenario library against a container runtime's CRI endpoints.
//!
//! ## Usage
//!
//! ```sh
//! cricheck --runtime-endpoint unix:///run/containerd/containerd.sock
//! cricheck --focus Conformance --skip Serial --parallel 4
//! cricheck --list --focus Image
//! ```
//!
//! ## Exit Codes
//!
//! - `0` - every selected scenario passed
//! - `1` - a scenario failed, or the harness could not start
//! - `2` - the focus or skip expression did not parse

use anyhow::{Context as _, Result};
use clap::Parser;
use cricheck::constants::{IMAGE_ENDPOINT_ENV, RUNTIME_ENDPOINT_ENV};
use cricheck::report::{EXIT_FAILURE, EXIT_FILTER_ERROR, EXIT_SUCCESS};
use cricheck::{
    scenarios, Config, Environment, Filter, GrpcTransport, ImageClient, Registry, RuntimeClient,
    Runner,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Conformance checks for Container Runtime Interface implementations.
#[derive(Parser, Debug)]
#[command(name = "cricheck", version, about)]
struct Args {
    /// TOML configuration file; flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Runtime service endpoint (unix:///path or /path).
    #[arg(long, env = RUNTIME_ENDPOINT_ENV)]
    runtime_endpoint: Option<String>,

    /// Image service endpoint; defaults to the runtime endpoint.
    #[arg(long, env = IMAGE_ENDPOINT_ENV)]
    image_endpoint: Option<String>,

    /// Per-call timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Only run scenarios whose path matches this regular expression.
    #[arg(long)]
    focus: Option<String>,

    /// Skip scenarios whose path matches this regular expression.
    #[arg(long)]
    skip: Option<String>,

    /// Number of scenarios run concurrently.
    #[arg(long)]
    parallel: Option<usize>,

    /// Runtime handler for RunPodSandbox.
    #[arg(long)]
    runtime_handler: Option<String>,

    /// Write a JSON report to this path.
    #[arg(long)]
    report_json: Option<PathBuf>,

    /// Print the selected scenarios and exit.
    #[arg(long)]
    list: bool,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(endpoint) = self.runtime_endpoint {
            config.runtime_endpoint = endpoint;
        }
        if let Some(endpoint) = self.image_endpoint {
            config.image_endpoint = Some(endpoint);
        }
        if let Some(timeout) = self.timeout {
            config.call_timeout_secs = timeout;
        }
        if self.focus.is_some() {
            config.focus = self.focus;
        }
        if self.skip.is_some() {
            config.skip = self.skip;
        }
        if let Some(parallel) = self.parallel {
            config.parallel = parallel;
        }
        if let Some(handler) = self.runtime_handler {
            config.runtime_handler = handler;
        }
        if self.report_json.is_some() {
            config.report_json = self.report_json;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    let list_only = args.list;
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let filter = match Filter::new(config.focus.as_deref(), config.skip.as_deref()) {
        Ok(filter) => filter,
        Err(e) => {
            error!("{}", e);
            return Ok(EXIT_FILTER_ERROR);
        }
    };

    let mut registry = Registry::new();
    scenarios::register_all(&mut registry);
    let plan = registry.plan(&filter);

    if list_only {
        for leaf in plan.iter().filter(|leaf| leaf.selected) {
            println!("{}", leaf.path);
        }
        return Ok(EXIT_SUCCESS);
    }

    let runtime = connect(&config).await?;
    runtime
        .preflight(&config.runtime_endpoint)
        .await
        .context("runtime is not ready")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling remaining scenarios");
            on_signal.cancel();
        }
    });

    let runner = Runner::new(Arc::new(Environment::new(runtime)))
        .with_parallelism(config.parallel)
        .with_cancellation(cancel);
    let report = runner.run(plan).await;

    print!("{}", report.summary());
    if let Some(path) = &config.report_json {
        report
            .write_json(path)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!("Wrote report to {}", path.display());
    }

    Ok(report.exit_code())
}

/// Connects both services, sharing the channel when they use one endpoint.
async fn connect(config: &Config) -> Result<RuntimeClient> {
    let timeout = config.call_timeout();
    let runtime_transport = GrpcTransport::connect(&config.runtime_endpoint, timeout)
        .await
        .with_context(|| format!("failed to connect to {}", config.runtime_endpoint))?;
    let image_transport = if config.image_endpoint() == config.runtime_endpoint {
        runtime_transport.clone()
    } else {
        GrpcTransport::connect(config.image_endpoint(), timeout)
            .await
            .with_context(|| format!("failed to connect to {}", config.image_endpoint()))?
    };
    info!(
        "Connected to runtime {} and image service {}",
        runtime_transport.endpoint(),
        image_transport.endpoint()
    );

    let images = ImageClient::new(Arc::new(image_transport)).with_call_timeout(timeout);
    Ok(RuntimeClient::new(Arc::new(runtime_transport), images)
        .with_call_timeout(timeout)
        .with_runtime_handler(config.runtime_handler.clone()))
}

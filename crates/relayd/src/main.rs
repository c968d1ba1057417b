use anyhow::Context;
use clap::{Parser, ValueEnum};
use relay_lifecycle::LifeCycle;
use relayd::config::RelayConfig;
use relayd::engine::Engine;
use relayd::inject::inject_file;
use relayd::logging::{JsonFileLogger, TracingLogger, TransactionLogger};
use relayd::queue::{MemoryQueue, QueueStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "relayd=info,rfc5321=info,egress_rules=info,throttle=info,\
                              dns_resolver=info,bounce_classify=info,relay_lifecycle=info";

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

#[derive(Debug, Parser)]
#[command(about = "outbound SMTP relay daemon")]
struct Opt {
    /// Configuration file to load
    #[arg(long, default_value = "relay.toml")]
    config: PathBuf,

    /// Directory where diagnostic log files will be placed.
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption. json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,

    /// JSON files holding arrays of messages to queue at startup
    #[arg(long)]
    inject: Vec<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let (non_blocking, _non_blocking_flusher);
    let log_writer = if let Some(log_dir) = &opts.diag_log_dir {
        let file_appender = tracing_appender::rolling::hourly(log_dir, "log");
        (non_blocking, _non_blocking_flusher) = tracing_appender::non_blocking(file_appender);
        BoxMakeWriter::new(non_blocking)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let layer = fmt::layer().with_thread_names(true).with_writer(log_writer);
    let layer = match opts.diag_format {
        DiagnosticFormat::Pretty => layer.pretty().boxed(),
        DiagnosticFormat::Full => layer.boxed(),
        DiagnosticFormat::Compact => layer.compact().boxed(),
        DiagnosticFormat::Json => layer.json().boxed(),
    };

    let env_filter = EnvFilter::try_new(
        std::env::var("RELAYD_LOG")
            .as_deref()
            .unwrap_or(DEFAULT_FILTER),
    )?;
    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .init();

    let config = RelayConfig::load(&opts.config)?;

    let logger: Arc<dyn TransactionLogger> = match &config.transaction_log {
        Some(params) => Arc::new(JsonFileLogger::new(params.clone())?),
        None => Arc::new(TracingLogger),
    };
    let queue: Arc<dyn QueueStore> = Arc::new(MemoryQueue::new());
    let engine = Arc::new(Engine::new(&config, Arc::clone(&queue), logger).await?);

    for path in &opts.inject {
        let response = inject_file(path, queue.as_ref()).await?;
        tracing::info!(
            "{}: queued {} messages, {} failed",
            path.display(),
            response.success_count,
            response.fail_count
        );
    }

    let mut life_cycle = LifeCycle::new();
    let pickup = engine.start(&life_cycle.handle());
    tracing::info!("relayd started using {}", opts.config.display());

    life_cycle
        .wait_for_shutdown(config.engine.shutdown_timeout)
        .await?;
    if let Err(err) = pickup.await {
        tracing::error!("pickup loop: {err:#}");
    }

    // after waiting for in-flight attempts, close sessions and logs
    engine.shutdown().await;

    println!("Shutdown completed OK!");
    Ok(())
}

use reels_pipeline::config::PipelineConfig;
use reels_pipeline::discovery;
use reels_pipeline::pipeline::{Orchestrator, ProcessorRegistry, RunOutcome};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run().await {
        Ok(RunOutcome::Completed) => ExitCode::SUCCESS,
        Ok(RunOutcome::PartiallyFailed) => ExitCode::from(2),
        Ok(RunOutcome::Interrupted) => ExitCode::from(3),
        Err(e) => {
            tracing::error!("❌ Pipeline run aborted: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> reels_pipeline::Result<RunOutcome> {
    let config = PipelineConfig::from_env()?;

    let items = match &config.items_path {
        Some(path) => discovery::load_items(path).await?,
        None => {
            tracing::warn!("⚠️ No items file configured (PIPELINE_ITEMS), resuming checkpointed items only");
            Vec::new()
        }
    };

    let registry = ProcessorRegistry::from_config(&config);
    let report_path = config.report_path.clone();
    let orchestrator = Orchestrator::new(config, registry);

    // Ctrl-C stops new attempts; in-flight ones are recorded before exit
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Interrupt received, finishing in-flight work...");
            cancel.cancel();
        }
    });

    let report = orchestrator.run(items).await?;

    for stage in &report.stages {
        tracing::info!(
            "📊 {}: {} completed, {} skipped, {} failed, {} pending, {} blocked",
            stage.stage,
            stage.completed,
            stage.skipped,
            stage.failed,
            stage.pending,
            stage.blocked
        );
    }
    for failure in &report.failures {
        tracing::warn!(
            "❌ {} failed at {} after {} attempt(s): {}",
            failure.id,
            failure.stage,
            failure.attempts,
            failure.error
        );
    }

    if let Some(path) = report_path {
        report.save(&path).await?;
    }

    Ok(report.outcome)
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "info,reels_pipeline=debug".to_string()
        } else {
            "info".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        // JSON logging for log aggregation
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("🎬 Reels pipeline starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Log level: {}", log_level);

    Ok(())
}

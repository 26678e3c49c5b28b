use anyhow::Result;
use permitgate::StatsReporter;
use permitgate_server::config::Config;
use permitgate_server::metrics::Metrics;
use permitgate_server::monitor::{self, MonitorState};
use permitgate_server::probe::SystemProbe;
use permitgate_server::tasks::BackgroundTasks;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let config = Config::from_env_and_args()?;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("permitgate={}", config.log_level).parse()?)
                .add_directive(format!("permitgate_server={}", config.log_level).parse()?),
        )
        .init();

    let gate = Arc::new(config.build_gate()?);
    let limiter = Arc::new(config.build_rate_limiter());
    let metrics = Arc::new(Metrics::new());

    let background = BackgroundTasks::start(
        &config,
        Arc::clone(&gate),
        Arc::clone(&limiter),
        Arc::new(SystemProbe::new()),
        Arc::clone(&metrics),
    );

    // Start the monitoring endpoint if enabled
    let monitor_task = match &config.monitor {
        Some(monitor_config) => {
            let listener = monitor::bind(monitor_config).await?;
            let state = Arc::new(MonitorState {
                reporter: StatsReporter::new(Arc::clone(&gate)).with_rate_limiter(limiter),
                metrics,
            });
            let shutdown = background.subscribe();
            Some(tokio::spawn(monitor::serve(
                listener,
                monitor::router(state),
                shutdown,
            )))
        }
        None => None,
    };

    let stats = gate.stats();
    tracing::info!(
        "permitgate started: global capacity {}, {} request types, identity limit {}",
        stats.global.capacity,
        stats.types.len(),
        stats.identity_limit
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, stopping background tasks");

    background.shutdown().await;
    if let Some(task) = monitor_task {
        match task.await {
            Ok(result) => result?,
            Err(e) => {
                tracing::error!("Monitoring task panicked: {}", e);
                return Err(anyhow::anyhow!("Monitoring task panicked"));
            }
        }
    }

    tracing::info!("permitgate stopped");
    Ok(())
}

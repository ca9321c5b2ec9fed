use anyhow::{Context, Result};
use clap::Parser;
use perpbot::config::AppConfig;
use perpbot::exchange::{ExchangeApi, OkxClient};
use perpbot::execution::{
    close_all_persisted, close_all_positions, global_stop_signal, ExecutionRouter, Executor, Scheduler,
    SimulatedAccount,
};
use perpbot::persistence::{MemoryPaperStore, PaperStore, RedisPaperStore};
use perpbot::risk::{OrderSizeCalculator, RiskControl};
use perpbot::strategy::dual_channel::DualChannelEngine;
use perpbot::strategy::ema_cross::EmaCrossStrategy;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(name = "perpbot", about = "USDT-margined perpetual swap trading engine")]
struct Args {
    /// Config file (without extension); defaults to config/default + config/local
    #[arg(long)]
    config: Option<String>,

    /// Cancel open orders, flatten every position, print the report and exit
    #[arg(long)]
    close_all: bool,

    /// Limit --close-all to one symbol
    #[arg(long, requires = "close_all")]
    symbol: Option<String>,

    /// Run a single scan cycle and exit
    #[arg(long)]
    once: bool,

    /// Flatten all positions after Ctrl+C
    #[arg(long)]
    close_on_exit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let run_mode = config.run_mode;

    tracing::info!("🚀 perpbot starting ({})", run_mode);
    tracing::info!("⚙️  {}", config);

    let exchange: Arc<dyn ExchangeApi> = Arc::new(OkxClient::new(config.okx_config()?)?);
    let account = SimulatedAccount::new(
        config.paper.initial_balance,
        config.paper.max_margin_ratio,
        config.trading.default_leverage,
    );
    let router = Arc::new(
        ExecutionRouter::new(exchange, run_mode, account, Arc::new(OrderSizeCalculator::new()))
            .context("Refusing to start")?
            .with_hedge_mode(config.trading.hedge_mode)
            .with_margin_mode(config.margin_mode()?),
    );

    let store = connect_paper_store(&config).await;

    if args.close_all {
        let result = close_all_persisted(&router, store.as_ref(), args.symbol.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!("Close-all failed: {}", e))?;
        println!("{}", result.to_table());
        if !result.success {
            anyhow::bail!("close-all finished with errors");
        }
        return Ok(());
    }

    let engine = DualChannelEngine::new(Box::new(EmaCrossStrategy::default()), config.execution_mode());
    let mut executor = Executor::new(
        router.clone(),
        engine,
        RiskControl::new(config.risk_limits()),
        config.executor_settings()?,
    )
    .with_store(store.clone());

    executor
        .initialize()
        .await
        .map_err(|e| anyhow::anyhow!("Initialization failed: {}", e))?;

    if args.once {
        let report = executor.run_cycle().await;
        tracing::info!("{}", report.summary_line());
        log_paper_status(&router);
        return Ok(());
    }

    let executor = Arc::new(Mutex::new(executor));
    let cycle_executor = executor.clone();
    let stop = global_stop_signal().clone();
    let handle = Scheduler::spawn(config.timeframe()?, config.scan_offset(), true, stop, move || {
        let executor = cycle_executor.clone();
        async move {
            let mut executor = executor.lock().await;
            let report = executor.run_cycle().await;
            tracing::info!("{}", report.summary_line());
            log_paper_status(executor.router());
        }
    });

    tracing::info!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    tracing::info!("⚠️  Received Ctrl+C, shutting down...");

    if !handle.stop().await {
        tracing::warn!("Scheduler did not stop cleanly; continuing shutdown");
    }

    if args.close_on_exit {
        let result = close_all_positions(&router, None).await;
        tracing::info!("\n{}", result.to_table());
    }

    if let Err(e) = router.save_paper_state(store.as_ref()).await {
        tracing::warn!("⚠️ Failed to save paper state on exit: {}", e);
    }

    tracing::info!("👋 perpbot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("perpbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_paper_store(config: &AppConfig) -> Arc<dyn PaperStore> {
    if config.paper.redis_url.is_empty() {
        tracing::info!("Paper state kept in memory (paper.redis_url not set)");
        return Arc::new(MemoryPaperStore::new());
    }

    match RedisPaperStore::new(&config.paper.redis_url, &config.paper.redis_prefix).await {
        Ok(store) => {
            tracing::info!("Paper state persisted to Redis at {}", config.paper.redis_url);
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!("⚠️ Redis unavailable ({}), paper state kept in memory", e);
            Arc::new(MemoryPaperStore::new())
        }
    }
}

fn log_paper_status(router: &ExecutionRouter) {
    if let Some(report) = router.paper_status_report() {
        tracing::info!("\n{}", report);
    }
}

//! Wiring & DI. Entry point: load config, bootstrap the session pool, run
//! the mirror service, map the report to an exit code.
//! No business logic here.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tg_mirror::adapters::telegram::{GrammersGatewayFactory, SessionStore};
use tg_mirror::shared::config::MirrorConfig;
use tg_mirror::usecases::{MirrorService, SessionPool, StatsCollector};

/// Exit code for a configuration problem (logged distinctly from partial
/// downloads, which also exit 1).
const CONFIG_ERROR: u8 = 1;

/// Exit code for user interruption.
const INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "configuration error");
            ExitCode::from(CONFIG_ERROR)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let config = MirrorConfig::load().map_err(|e| anyhow::anyhow!("load config: {e}"))?;
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            error!(problem = %problem, "configuration error");
        }
        anyhow::bail!("{} configuration problem(s), aborting before any work", problems.len());
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let api_id = config.api_id.ok_or_else(|| anyhow::anyhow!("api_id missing"))?;
    let store = SessionStore::new(config.session_dir_or_default());
    let available = store.available(&config.session_names);
    if available.is_empty() {
        anyhow::bail!(
            "none of the {} configured session(s) have usable credential files in {}",
            config.session_names.len(),
            config.session_dir_or_default()
        );
    }
    info!(
        available = available.len(),
        configured = config.session_names.len(),
        "session credentials located"
    );
    let factory = GrammersGatewayFactory::new(
        api_id,
        store,
        config.proxy.as_ref().map(|proxy| proxy.url()),
    );

    let pool = Arc::new(
        SessionPool::initialize(&factory, &available)
            .await
            .map_err(|e| anyhow::anyhow!("session pool: {e}"))?,
    );
    if let Err(e) = pool.start_all().await {
        pool.stop_all().await;
        anyhow::bail!("no sessions connected: {e}");
    }

    let stats = StatsCollector::new();
    let service = MirrorService::new(config, Arc::clone(&pool), stats, cancel.clone());
    let code = match service.run().await {
        Ok(report) => report.exit_code() as u8,
        Err(e) => {
            if cancel.is_cancelled() {
                warn!("run cancelled by user");
                INTERRUPTED
            } else {
                error!(error = %e, "run failed");
                CONFIG_ERROR
            }
        }
    };

    pool.stop_all().await;
    info!(exit_code = code, "shutdown complete");
    Ok(ExitCode::from(code))
}

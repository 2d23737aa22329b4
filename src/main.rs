//! EdgeBot - Multi-provider trading research and execution backend
//!
//! Wires the gateway session, persistent listeners, auto-linker,
//! recalibration loop and REST surface together, then serves until
//! shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edgebot_backend::api::{build_router, AppState};
use edgebot_backend::config::Config;
use edgebot_backend::ensemble::{BayesianRecalibrator, EnsembleEngine, WeightStore};
use edgebot_backend::gateway::broker::RequestBroker;
use edgebot_backend::gateway::session::SessionManager;
use edgebot_backend::linker::AutoLinker;
use edgebot_backend::orders::{attach_persistent_listeners, OrderPipeline};
use edgebot_backend::storage::TradeStore;

#[derive(Debug, Parser)]
#[command(name = "edgebot", about = "Trading research and execution backend")]
struct Args {
    /// REST listener port (overrides REST_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,edgebot_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(port) = args.port {
        config.rest.port = port;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    config.validate().context("validating configuration")?;
    let config = Arc::new(config);

    info!(
        gateway = format!("{}:{}", config.gateway.host, config.gateway.port),
        rest_port = config.rest.port,
        db = config.database_path,
        "🚀 edgebot starting"
    );

    let store = Arc::new(TradeStore::open(&config.database_path).context("opening trade store")?);
    let broker = Arc::new(RequestBroker::new());
    let session = SessionManager::new(config.gateway.clone(), Arc::clone(&broker));

    // Persistent listeners feed every status, fill and commission back
    // into the store, and hand executions to the linker.
    let (linker_tx, linker_rx) = mpsc::unbounded_channel();
    attach_persistent_listeners(&broker, Arc::clone(&store), linker_tx);

    let weights = Arc::new(
        WeightStore::new(
            Arc::clone(&store),
            &config.orchestrator.weights,
            config.orchestrator.penalty_k,
        )
        .context("loading ensemble weights")?,
    );
    let recalibrator = BayesianRecalibrator::new(
        &config.priors_path,
        Arc::clone(&store),
        Arc::clone(&weights),
    )
    .context("loading bayesian priors")?;

    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let linker = AutoLinker::new(Arc::clone(&store));
    linker.set_outcome_sink(outcome_tx.clone());

    // Catch positions that closed while we were offline before the
    // session starts delivering fresh events.
    let reconciled = linker.reconcile_offline()?;
    if reconciled > 0 {
        info!(reconciled, "recorded outcomes for positions closed offline");
    }

    tokio::spawn(Arc::clone(&session).run());
    tokio::spawn(Arc::clone(&linker).run(linker_rx));
    tokio::spawn(Arc::clone(&recalibrator).run(outcome_rx));

    let engine = Arc::new(EnsembleEngine::from_configs(
        &config.providers,
        Arc::clone(&weights),
        Arc::clone(&store),
        config.orchestrator.clone(),
        &config.auto_eval,
    ));
    let pipeline = Arc::new(OrderPipeline::new(
        Arc::clone(&session),
        Arc::clone(&store),
        config.gateway.clone(),
    ));

    let state = AppState {
        config: Arc::clone(&config),
        store,
        weights,
        engine,
        pipeline,
        session: Arc::clone(&session),
        recalibrator,
        outcome_tx,
    };

    let router = build_router(state);
    let listener = TcpListener::bind(("0.0.0.0", config.rest.port))
        .await
        .with_context(|| format!("binding REST port {}", config.rest.port))?;
    info!(port = config.rest.port, "REST listener up");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&session)))
        .await
        .context("serving REST")?;

    info!("edgebot stopped");
    Ok(())
}

async fn shutdown_signal(session: Arc<SessionManager>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    session.close();
}

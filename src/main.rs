mod api;
mod app;
mod connections;
mod error;
mod pairs;
mod prompts;
mod scheduler;
mod storage;
mod utils;
mod web;

#[cfg(test)]
mod test_utils;

use crate::api::events::Notifier;
use crate::api::gateway::EvolutionClient;
use crate::api::openai::OpenAiClient;
use crate::app::AppConfig;
use crate::connections::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::pairs::PairRegistry;
use crate::prompts::PromptLibrary;
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::storage::Store;
use crate::web::AppContext;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run().await {
        log::error!("maturador exited: {e}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> Result<()> {
    let config = AppConfig::load();
    let db_path = config
        .database_path()
        .ok_or_else(|| Error::Config("no data directory available for the database".into()))?;
    let store = Store::open(&db_path)?;
    log::info!("using database {}", db_path.display());

    let notifier = Notifier::default();
    let gateway = Arc::new(EvolutionClient::new(&config.gateway)?);
    let generator = Arc::new(OpenAiClient::new(&config.generator)?);
    if config.gateway.endpoint.trim().is_empty() || config.gateway.api_key.trim().is_empty() {
        log::warn!("Evolution API endpoint or key missing; connections cannot be created");
    }
    if config.generator.api_key.trim().is_empty() {
        log::warn!("OpenAI key missing; turns will fail until one is configured");
    }

    let scheduler = Scheduler::new(
        store.clone(),
        generator,
        gateway.clone(),
        notifier.clone(),
        SchedulerSettings::from(&config.maturation),
    );
    // Statuses left Running by a previous process have no timer behind them.
    scheduler.stop()?;

    let ctx = AppContext {
        connections: ConnectionRegistry::new(store.clone(), gateway, notifier.clone()),
        pairs: PairRegistry::new(store.clone(), scheduler.clone(), notifier.clone()),
        prompts: PromptLibrary::new(store),
        scheduler: scheduler.clone(),
        notifier,
    };

    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .map_err(|e| Error::Config(format!("cannot listen on {}: {e}", config.server.listen)))?;
    log::info!("listening on http://{}", config.server.listen);

    let served = web::serve(listener, ctx, async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("shutting down");
    })
    .await;
    scheduler.shutdown().await;
    served
}

use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use pbxlink::{
    cdr::{self, CdrProcessor},
    clients::{HttpCustomerClient, HttpIdentityClient, HttpRosterClient},
    config::AppConfig,
    db,
    events::EventBus,
    oncall::OnCallCache,
    routes::{self, AppContext},
    state::AppState,
    stores::overwrites,
    voicemail::{ImapMailGateway, SyncManager},
    workers,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        database_url = %config.redacted_database_url(),
        listen = %config.listen,
        cdr_mode = ?config.cdr_mode,
        "loaded configuration"
    );

    let pool = db::init_pool(&config.database_url)?;

    let idm = Arc::new(HttpIdentityClient::new(config.idm_url.clone()));
    let roster = Arc::new(HttpRosterClient::new(config.rosterd_url.clone()));
    let customer = Arc::new(HttpCustomerClient::new(config.customerd_url.clone()));
    let events = EventBus::new(config.events_service_url.clone());

    let listen_addr = config.listen_addr()?;

    let state = AppState::new(
        pool,
        config,
        idm,
        roster,
        customer,
        Arc::new(ImapMailGateway),
        events,
    );

    let cancel = CancellationToken::new();
    state.events.start_remote_listener(cancel.clone());

    // one on-call cache per configured inbound number
    {
        let numbers = {
            let mut conn = state.db().map_err(|err| anyhow::anyhow!("{err}"))?;
            overwrites::list_inbound_numbers(&mut conn)?
        };

        for number in numbers {
            let cache = OnCallCache::spawn(state.clone(), number.number.clone(), cancel.clone());
            state.caches.insert(cache);
        }
    }

    let manager = Arc::new(SyncManager::new(state.clone()));
    if let Err(err) = manager.start().await {
        tracing::error!(error = %err, "failed to start voicemail sync manager");
    }

    tokio::spawn(workers::customers::run(state.clone(), cancel.clone()));
    tokio::spawn(workers::notifications::run(
        state.clone(),
        manager.clone(),
        cancel.clone(),
    ));

    {
        let processor = CdrProcessor::new(state.clone(), None);
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = cdr::server::run(state, processor, cancel).await {
                tracing::error!(error = %err, "CDR server failed");
            }
        });
    }

    let router = routes::create_router(AppContext {
        state: state.clone(),
        manager: manager.clone(),
    });

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "HTTP server listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
            shutdown_cancel.cancel();
        })
        .await?;

    manager.dispose_all().await;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

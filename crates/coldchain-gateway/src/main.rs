use anyhow::{bail, Context};
use coldchain_gateway::{
    logging::init_logging, load_config, serve, Collaborators, Gateway, LogMailer, SqliteBackend,
    StaticTokenVerifier,
};
use coldchain_storage::ColdChainStore;
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;

    let store = if config.database == ":memory:" {
        ColdChainStore::open_in_memory()
    } else {
        ColdChainStore::open(&config.database)
    }
    .with_context(|| format!("opening database {}", config.database))?;
    let backend = Arc::new(SqliteBackend::new(store));

    let tokens = match &config.tokens {
        Some(path) => StaticTokenVerifier::load(path)?,
        None => {
            warn!(event = "no_tokens_configured");
            StaticTokenVerifier::default()
        }
    };
    if config.alert_recipients.is_empty() {
        warn!(
            event = "no_default_alert_recipients",
            "organizations without notification settings get push alerts only; \
             set --alert-recipient or COLDCHAIN_ALERT_RECIPIENTS to email them"
        );
    }

    let collaborators = Collaborators {
        tokens: Arc::new(tokens),
        directory: backend.clone(),
        instruments: backend.clone(),
        readings: backend.clone(),
        settings: backend,
        mailer: Arc::new(LogMailer::default()),
    };
    let gateway = Gateway::new(config.clone(), collaborators);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(event = "gateway_start", addr = %addr, database = %config.database);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "gateway_shutdown");
    };
    if let Err(err) = serve(listener, gateway, shutdown).await {
        error!(event = "gateway_error", error = %err);
        bail!("server stopped: {err}");
    }
    Ok(())
}

//! Process assembly: wires the registry, bus, key store, webhook proxy,
//! router, MCP service, and OAuth server into one axum application plus
//! the background tasks, and runs it.

pub mod ops;
pub mod routes;
pub mod state;
pub mod tasks;

use std::sync::Arc;

use {
    arachne_common::{Error, Result},
    arachne_config::Config,
    arachne_oauth::OAuthState,
    arachne_platform::{
        DiscordIdentityBroker, DiscordRest, IdentityBroker, PlatformApi, RestToolBackend,
        gateway::run_gateway,
    },
    arachne_registry::Registry,
    axum::Router,
    secrecy::{ExposeSecret, Secret},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tower_http::{
        catch_panic::CatchPanicLayer,
        cors::CorsLayer,
        request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
        trace::TraceLayer,
    },
    tracing::info,
};

pub use state::AppContext;

/// The full HTTP application: OAuth server routes merged with the MCP,
/// health, and dashboard routes, under the shared layer stack.
pub fn http(ctx: Arc<AppContext>, identity: Arc<dyn IdentityBroker>) -> Router {
    let oauth = Arc::new(OAuthState {
        registry: ctx.registry.clone(),
        identity,
        jwt_secret: Secret::new(ctx.config.jwt_secret.expose_secret().clone()),
        base_url: ctx.config.base_url.clone(),
    });

    arachne_oauth::router(oauth)
        .merge(routes::router(Arc::clone(&ctx)))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

/// Open everything and serve until ctrl-c. Database-open and bind
/// failures are fatal; the caller exits non-zero.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    std::fs::create_dir_all(&config.data_dir)
        .map_err(|e| Error::fatal("creating data directory", e))?;
    let registry = Registry::open(&config.db_path()).await?;

    let rest = Arc::new(DiscordRest::new(Secret::new(
        config.bot_token.expose_secret().clone(),
    )));
    let bot_user_id = rest.current_user_id().await?;
    info!(bot_user_id = %bot_user_id, "connected to platform REST");

    let ctx = AppContext::assemble(
        Arc::clone(&config),
        registry,
        Arc::clone(&rest) as Arc<dyn PlatformApi>,
        Arc::clone(&rest) as Arc<dyn RestToolBackend>,
        bot_user_id,
    );
    let identity = Arc::new(DiscordIdentityBroker::new(
        config.discord_client_id.clone(),
        Secret::new(config.discord_client_secret.expose_secret().clone()),
    ));
    let app = http(Arc::clone(&ctx), identity);

    let cancel = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(1024);
    let eviction = tasks::spawn_eviction(Arc::clone(&ctx), cancel.clone());
    let event_loop = tasks::spawn_event_loop(Arc::clone(&ctx), event_rx, cancel.clone());
    let gateway = tokio::spawn(run_gateway(
        Secret::new(config.bot_token.expose_secret().clone()),
        event_tx,
        cancel.clone(),
    ));

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::fatal(format!("binding {addr}"), e))?;
    info!(%addr, base_url = %config.base_url, "arachne listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .map_err(|e| Error::fatal("http server", e))?;

    cancel.cancel();
    let _ = eviction.await;
    let _ = event_loop.await;
    let _ = gateway.await;
    info!("shutdown complete");
    Ok(())
}

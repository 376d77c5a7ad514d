use marquee_api::AppState;
use marquee_common::Config;
use marquee_security::{AccessVerifier, CachedRoleStore, InMemoryRoleStore, JwtSessionResolver};
use marquee_sync::{InMemoryCollectionStore, Synchronizer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

fn seed_roles(config: &Config) -> InMemoryRoleStore {
    config
        .seed
        .users
        .iter()
        .fold(InMemoryRoleStore::new(), |store, user| {
            tracing::info!(identity = %user.identity, role = %user.role, "seeding role");
            store.with_user(user.identity.clone(), user.role)
        })
}

fn build_state(config: &Config) -> AppState {
    let roles = Arc::new(CachedRoleStore::new(
        Arc::new(seed_roles(config)),
        config.access.role_cache_ttl(),
    ));
    let sessions = Arc::new(JwtSessionResolver::from_config(&config.session));
    let verifier = Arc::new(AccessVerifier::new(sessions, roles.clone()));
    let synchronizer = Arc::new(Synchronizer::new(Arc::new(InMemoryCollectionStore::new())));

    AppState {
        verifier,
        roles,
        synchronizer,
    }
}

pub async fn run(config: Config) -> Result<(), anyhow::Error> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = Arc::new(build_state(&config));
    let routes = marquee_api::routes(state);

    let (bound, server) = warp::serve(routes).try_bind_with_graceful_shutdown(addr, async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(err) => tracing::error!("Signal error: {}", err),
        }
    })?;
    tracing::info!("HTTP listening on {}", bound);

    server.await;
    tracing::info!("Marquee stopped");
    Ok(())
}

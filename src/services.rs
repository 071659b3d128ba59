//! Wiring of stores, clients and workers into the two routers.

use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    counter_sync::HttpCounterSyncClient,
    counter_update::CounterUpdateHandler,
    credentials::CredentialService,
    http::{PostServiceState, UserServiceState, build_post_router, build_user_router},
    outbox::{OutboxHandle, spawn_dispatcher},
    post_mutation::{CounterDelivery, PostMutationService},
    store::{JsonPostStore, JsonUserStore},
};

/// Builds the post service. In outbox and compensate mode this also starts
/// the dispatcher, so it must run inside a tokio runtime.
pub fn post_service(config: &Config) -> anyhow::Result<Router> {
    let posts = Arc::new(
        JsonPostStore::load_or_init(&config.data_dir)
            .with_context(|| format!("load post store in {}", config.data_dir.display()))?,
    );
    let sync = Arc::new(
        HttpCounterSyncClient::new(&config.user_service_url, config.counter_sync_timeout())
            .context("build counter sync client")?,
    );

    let outbox = match config.counter_delivery {
        CounterDelivery::Outbox | CounterDelivery::Compensate => {
            spawn_dispatcher(posts.clone(), sync.clone(), config.dispatch_settings())
        }
        CounterDelivery::Direct => OutboxHandle::noop(),
    };
    if config.auth_token.is_empty() {
        tracing::warn!("auth token is empty; every protected route will answer 401");
    }

    info!(
        delivery = config.counter_delivery.as_str(),
        user_service_url = %config.user_service_url,
        "post service configured"
    );

    let state = PostServiceState {
        posts: posts.clone(),
        outbox_store: posts.clone(),
        mutations: PostMutationService::new(
            posts,
            sync,
            outbox.clone(),
            config.counter_delivery,
        ),
        outbox,
    };
    Ok(build_post_router(state, &config.auth_token).layer(TraceLayer::new_for_http()))
}

pub fn user_service(config: &Config) -> anyhow::Result<Router> {
    let users = Arc::new(
        JsonUserStore::load_or_init(&config.data_dir)
            .with_context(|| format!("load user store in {}", config.data_dir.display()))?,
    );

    info!(
        strategy = ?config.counter_update_strategy,
        "user service configured"
    );

    let state = UserServiceState {
        users: users.clone(),
        counters: CounterUpdateHandler::new(users.clone(), config.counter_update_strategy),
        credentials: CredentialService::new(users, config.hash_params())
            .context("prepare credential service")?,
    };
    Ok(build_user_router(state).layer(TraceLayer::new_for_http()))
}

/// Serves `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("serve http")?;
    Ok(())
}

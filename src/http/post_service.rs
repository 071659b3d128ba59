use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    middleware,
    routing::{delete, get, post},
};
use serde::Serialize;
use serde_json::{Value, json};

use super::{ApiError, ApiJson, BearerAuth, Items, bearer_auth, fallback_not_found};
use crate::{
    domain::{DeletePostInput, Post, PostId, PostInput, UserId},
    outbox::OutboxHandle,
    post_mutation::{MutationOutcome, PostMutationService},
    store::{OutboxEntry, OutboxStore, PostStore},
};

#[derive(Clone)]
pub struct PostServiceState {
    pub posts: Arc<dyn PostStore>,
    pub outbox_store: Arc<dyn OutboxStore>,
    pub mutations: PostMutationService,
    pub outbox: OutboxHandle,
}

pub fn build_post_router(state: PostServiceState, auth_token: &str) -> Router {
    let protected = Router::new()
        .route("/createPost", post(create_post))
        .route("/deletePost", delete(delete_post))
        .route("/posts/:post_id", get(get_post))
        .route("/owners/:user_id/post-count", get(owner_post_count))
        .route("/outbox", get(list_outbox))
        .route("/outbox/:outbox_id/retry", post(retry_outbox))
        .layer(middleware::from_fn_with_state(
            BearerAuth::new(auth_token),
            bearer_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .fallback(fallback_not_found)
        .layer(Extension(state))
}

#[derive(Serialize)]
struct MutationResponse {
    message: &'static str,
    #[serde(flatten)]
    outcome: MutationOutcome,
}

async fn create_post(
    Extension(state): Extension<PostServiceState>,
    ApiJson(input): ApiJson<PostInput>,
) -> Result<Json<MutationResponse>, ApiError> {
    let outcome = state.mutations.create(input).await?;
    Ok(Json(MutationResponse {
        message: "Post Created ...",
        outcome,
    }))
}

/// Undecodable bodies are answered with 500 here, matching the long-standing
/// contract of this route.
async fn delete_post(
    Extension(state): Extension<PostServiceState>,
    body: Result<Json<DeletePostInput>, JsonRejection>,
) -> Result<Json<MutationResponse>, ApiError> {
    let Json(input) = body.map_err(|e| ApiError::internal(e.to_string()))?;
    let outcome = state.mutations.delete(input).await?;
    Ok(Json(MutationResponse {
        message: "Post Deleted ...",
        outcome,
    }))
}

async fn get_post(
    Extension(state): Extension<PostServiceState>,
    Path(post_id): Path<PostId>,
) -> Result<Json<Post>, ApiError> {
    let post = state
        .posts
        .get_post(post_id)?
        .ok_or_else(|| ApiError::not_found(format!("post not found: {post_id}")))?;
    Ok(Json(post))
}

/// Live posts owned by a user, for comparison with the user service counter.
async fn owner_post_count(
    Extension(state): Extension<PostServiceState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Value>, ApiError> {
    let live_posts = state.posts.count_posts_by_owner(user_id)?;
    Ok(Json(json!({ "user_id": user_id, "live_posts": live_posts })))
}

async fn list_outbox(
    Extension(state): Extension<PostServiceState>,
) -> Result<Json<Items<OutboxEntry>>, ApiError> {
    Ok(Json(Items {
        items: state.outbox_store.list_outbox()?,
    }))
}

async fn retry_outbox(
    Extension(state): Extension<PostServiceState>,
    Path(outbox_id): Path<String>,
) -> Result<Json<OutboxEntry>, ApiError> {
    let entry = state
        .outbox_store
        .requeue_outbox(&outbox_id)?
        .ok_or_else(|| ApiError::not_found(format!("outbox entry not found: {outbox_id}")))?;
    state.outbox.notify();
    Ok(Json(entry))
}

async fn health(Extension(state): Extension<PostServiceState>) -> Result<Json<Value>, ApiError> {
    let entries = state.outbox_store.list_outbox()?;
    let pending = entries.iter().filter(|e| e.is_pending()).count();
    Ok(Json(json!({
        "status": "ok",
        "version": crate::version::VERSION,
        "counter_delivery": state.mutations.delivery().as_str(),
        "outbox": {
            "pending": pending,
            "failed": entries.len() - pending,
        }
    })))
}

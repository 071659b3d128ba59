use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::HeaderMap,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ApiError, ApiJson, fallback_not_found};
use crate::{
    counter_sync::IDEMPOTENCY_KEY_HEADER,
    counter_update::{CounterUpdateHandler, UpdateStrategy},
    credentials::CredentialService,
    domain::{CounterAdjustment, UserAccount, UserId},
    store::UserStore,
};

#[derive(Clone)]
pub struct UserServiceState {
    pub users: Arc<dyn UserStore>,
    pub counters: CounterUpdateHandler,
    pub credentials: CredentialService,
}

pub fn build_user_router(state: UserServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/updatepost", put(update_post_count))
        .route("/login", post(login))
        .route("/signup", post(signup))
        .route("/users/:user_id", get(get_user))
        .fallback(fallback_not_found)
        .layer(Extension(state))
}

#[derive(Serialize)]
struct CounterUpdateResponse {
    message: &'static str,
    user_id: UserId,
    post_count: i64,
    applied: bool,
}

async fn update_post_count(
    Extension(state): Extension<UserServiceState>,
    headers: HeaderMap,
    ApiJson(adjustment): ApiJson<CounterAdjustment>,
) -> Result<Json<CounterUpdateResponse>, ApiError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|v| {
            v.to_str()
                .map_err(|_| ApiError::invalid_request("Idempotency-Key must be visible ASCII"))
        })
        .transpose()?
        .filter(|k| !k.is_empty());

    let update = state.counters.update_count(adjustment, key)?;
    Ok(Json(CounterUpdateResponse {
        message: "PostCount Updated Successfully ...",
        user_id: update.user_id,
        post_count: update.post_count,
        applied: update.applied,
    }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default, alias = "Username")]
    username: Option<String>,
    #[serde(default, alias = "Email")]
    email: Option<String>,
    #[serde(default, alias = "Password")]
    password: String,
}

#[derive(Debug, Deserialize)]
struct SignupRequest {
    #[serde(alias = "Username")]
    username: String,
    #[serde(alias = "Email")]
    email: String,
    #[serde(alias = "Password")]
    password: String,
}

#[derive(Serialize)]
struct CredentialResponse {
    message: &'static str,
    user_id: UserId,
}

async fn login(
    Extension(state): Extension<UserServiceState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<Json<CredentialResponse>, ApiError> {
    // Hash verification is CPU-bound.
    let user = tokio::task::spawn_blocking(move || {
        state
            .credentials
            .login(req.username.as_deref(), req.email.as_deref(), &req.password)
    })
    .await
    .map_err(|e| ApiError::internal(format!("login task: {e}")))??;

    Ok(Json(CredentialResponse {
        message: "Successfully Logged In ...",
        user_id: user.id,
    }))
}

async fn signup(
    Extension(state): Extension<UserServiceState>,
    ApiJson(req): ApiJson<SignupRequest>,
) -> Result<Json<CredentialResponse>, ApiError> {
    let user = tokio::task::spawn_blocking(move || {
        state
            .credentials
            .signup(&req.username, &req.email, &req.password)
    })
    .await
    .map_err(|e| ApiError::internal(format!("signup task: {e}")))??;

    Ok(Json(CredentialResponse {
        message: "Successfully Signed In ...",
        user_id: user.id,
    }))
}

#[derive(Serialize)]
struct UserView {
    id: UserId,
    name: String,
    email: String,
    post_count: i64,
}

impl From<UserAccount> for UserView {
    fn from(user: UserAccount) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            post_count: user.post_count,
        }
    }
}

async fn get_user(
    Extension(state): Extension<UserServiceState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<UserView>, ApiError> {
    let user = state
        .users
        .get_user(user_id)?
        .ok_or_else(|| ApiError::not_found(format!("user not found: {user_id}")))?;
    Ok(Json(user.into()))
}

async fn health(Extension(state): Extension<UserServiceState>) -> Json<Value> {
    let strategy = match state.counters.strategy() {
        UpdateStrategy::Atomic => "atomic",
        UpdateStrategy::ReadModifyWrite => "read-modify-write",
    };
    Json(json!({
        "status": "ok",
        "version": crate::version::VERSION,
        "counter_update_strategy": strategy,
        "password_checks": state.credentials.password_checks(),
    }))
}

use axum::{
    Json,
    body::Body,
    extract::{FromRequest, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};

use crate::{
    counter_update::CounterError,
    credentials::CredentialError,
    domain::DomainError,
    post_mutation::MutationError,
    store::StoreError,
};

mod post_service;
mod user_service;


pub use post_service::{PostServiceState, build_post_router};
pub use user_service::{UserServiceState, build_user_router};

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("unauthorized", StatusCode::UNAUTHORIZED, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn counter_sync_failed(message: impl Into<String>) -> Self {
        Self::new("counter_sync_failed", StatusCode::BAD_GATEWAY, message)
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        let message = value.to_string();
        match value.code() {
            "conflict" => ApiError::conflict(message),
            "not_found" => ApiError::not_found(message),
            _ => ApiError::invalid_request(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(domain) => domain.into(),
            StoreError::Io(_)
            | StoreError::SerdeJson(_)
            | StoreError::SchemaVersionMismatch { .. }
            | StoreError::LockPoisoned(_) => {
                tracing::error!(error = %value, "store failure");
                ApiError::internal(value.to_string())
            }
        }
    }
}

impl From<MutationError> for ApiError {
    fn from(value: MutationError) -> Self {
        match value {
            MutationError::Store(e) => e.into(),
            MutationError::SyncFailed(e) => {
                ApiError::counter_sync_failed(format!("post write undone: {e}"))
                    .with_detail("compensated", true)
            }
            MutationError::CompensationFailed { .. } => {
                ApiError::counter_sync_failed(value.to_string()).with_detail("compensated", false)
            }
        }
    }
}

impl From<CounterError> for ApiError {
    fn from(value: CounterError) -> Self {
        match value {
            CounterError::NotFound { .. } => ApiError::not_found(value.to_string()),
            CounterError::Store(e) => e.into(),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(value: CredentialError) -> Self {
        match value {
            CredentialError::MissingIdentifier => ApiError::invalid_request(value.to_string()),
            CredentialError::InvalidCredentials => ApiError::unauthorized(value.to_string()),
            CredentialError::Store(e) => e.into(),
            CredentialError::Hash(_) => ApiError::internal(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// JSON body extractor whose rejections render as `invalid_request`.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Serialize)]
struct Items<T> {
    items: Vec<T>,
}

/// Shared-secret bearer check. Only digests are kept and compared.
#[derive(Clone)]
pub struct BearerAuth {
    expected: Option<[u8; 32]>,
}

impl BearerAuth {
    /// An empty token locks every protected route.
    pub fn new(token: &str) -> Self {
        let expected = (!token.is_empty()).then(|| Sha256::digest(token.as_bytes()).into());
        Self { expected }
    }

    fn verify(&self, presented: &str) -> bool {
        let Some(expected) = self.expected.as_ref() else {
            return false;
        };
        let presented: [u8; 32] = Sha256::digest(presented.as_bytes()).into();
        &presented == expected
    }
}

async fn bearer_auth(State(auth): State<BearerAuth>, req: Request<Body>, next: Next) -> Response {
    match extract_bearer_token(req.headers()) {
        Some(token) if auth.verify(&token) => next.run(req).await,
        _ => ApiError::unauthorized("missing or invalid authorization token").into_response(),
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?;
    let raw = raw.to_str().ok()?;
    let raw = raw.strip_prefix("Bearer ")?;
    Some(raw.to_string())
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}

//! Delivery of counter adjustments from the post service to the user service.

use std::{future::Future, pin::Pin, time::Duration};

use tracing::debug;

use crate::{
    counter_update::{CounterError, CounterUpdateHandler},
    domain::CounterAdjustment,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub const UPDATE_POST_PATH: &str = "/updatepost";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    Transport(String),
    Status { status: u16, body: String },
}

impl SyncError {
    /// True when resending the same adjustment can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Status { status: 400 | 404, .. })
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Status { status, body } => write!(f, "user service returned {status}: {body}"),
        }
    }
}

impl std::error::Error for SyncError {}

/// Sends one adjustment. Implementations do not retry.
pub trait CounterSync: Send + Sync {
    fn send<'a>(
        &'a self,
        adjustment: &'a CounterAdjustment,
        idempotency_key: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), SyncError>>;
}

#[derive(Clone)]
pub struct HttpCounterSyncClient {
    base: String,
    client: reqwest::Client,
}

impl HttpCounterSyncClient {
    /// `timeout` of `None` leaves the transport default in place.
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self, SyncError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| SyncError::Transport(format!("build client: {e}")))?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self) -> String {
        format!("{}{UPDATE_POST_PATH}", self.base)
    }
}

impl CounterSync for HttpCounterSyncClient {
    fn send<'a>(
        &'a self,
        adjustment: &'a CounterAdjustment,
        idempotency_key: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            let mut req = self.client.put(self.url()).json(adjustment);
            if let Some(key) = idempotency_key {
                req = req.header(IDEMPOTENCY_KEY_HEADER, key);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(SyncError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            debug!(
                user_id = adjustment.user_id,
                increment = adjustment.increment,
                "counter adjustment delivered"
            );
            Ok(())
        })
    }
}

/// Applies adjustments in-process against a `CounterUpdateHandler`, with the
/// same error contract as the HTTP client.
#[derive(Clone)]
pub struct LocalCounterSync {
    handler: CounterUpdateHandler,
}

impl LocalCounterSync {
    pub fn new(handler: CounterUpdateHandler) -> Self {
        Self { handler }
    }
}

impl CounterSync for LocalCounterSync {
    fn send<'a>(
        &'a self,
        adjustment: &'a CounterAdjustment,
        idempotency_key: Option<&'a str>,
    ) -> BoxFuture<'a, Result<(), SyncError>> {
        Box::pin(async move {
            self.handler
                .update_count(*adjustment, idempotency_key)
                .map(|_| ())
                .map_err(|err| match err {
                    CounterError::NotFound { .. } => SyncError::Status {
                        status: 404,
                        body: err.to_string(),
                    },
                    CounterError::Store(_) => SyncError::Status {
                        status: 500,
                        body: err.to_string(),
                    },
                })
        })
    }
}

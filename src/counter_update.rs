use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    domain::{CounterAdjustment, DomainError, UserId},
    store::{CounterStore, StoreError},
};

/// How a counter adjustment is written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UpdateStrategy {
    /// `post_count = post_count ± 1` as one store operation.
    #[default]
    Atomic,
    /// Read, compute, write back. Concurrent adjustments can lose updates.
    ReadModifyWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterUpdate {
    pub user_id: UserId,
    pub post_count: i64,
    /// False when the idempotency key had already been applied.
    pub applied: bool,
}

#[derive(Debug)]
pub enum CounterError {
    NotFound { user_id: UserId },
    Store(StoreError),
}

impl std::fmt::Display for CounterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { user_id } => write!(f, "no counter for user {user_id}"),
            Self::Store(e) => write!(f, "counter store: {e}"),
        }
    }
}

impl std::error::Error for CounterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NotFound { .. } => None,
            Self::Store(e) => Some(e),
        }
    }
}

impl From<StoreError> for CounterError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(DomainError::MissingUser { user_id }) => Self::NotFound { user_id },
            other => Self::Store(other),
        }
    }
}

/// Applies counter adjustments received from the post service.
#[derive(Clone)]
pub struct CounterUpdateHandler {
    store: Arc<dyn CounterStore>,
    strategy: UpdateStrategy,
}

impl CounterUpdateHandler {
    pub fn new(store: Arc<dyn CounterStore>, strategy: UpdateStrategy) -> Self {
        Self { store, strategy }
    }

    pub fn strategy(&self) -> UpdateStrategy {
        self.strategy
    }

    /// Increments or decrements the user's counter by one. An unknown user
    /// is reported as `NotFound` and no row is created.
    pub fn update_count(
        &self,
        adjustment: CounterAdjustment,
        idempotency_key: Option<&str>,
    ) -> Result<CounterUpdate, CounterError> {
        let user_id = adjustment.user_id;
        let delta = adjustment.delta();
        let update = match self.strategy {
            UpdateStrategy::Atomic => {
                let write = self.store.adjust_counter(user_id, delta, idempotency_key)?;
                CounterUpdate {
                    user_id,
                    post_count: write.post_count,
                    applied: write.applied,
                }
            }
            UpdateStrategy::ReadModifyWrite => {
                self.read_modify_write(user_id, delta, idempotency_key)?
            }
        };

        if update.applied {
            info!(
                user_id,
                delta,
                post_count = update.post_count,
                "post count updated"
            );
        } else {
            debug!(user_id, key = ?idempotency_key, "adjustment already applied");
        }
        Ok(update)
    }

    fn read_modify_write(
        &self,
        user_id: UserId,
        delta: i64,
        idempotency_key: Option<&str>,
    ) -> Result<CounterUpdate, CounterError> {
        if let Some(key) = idempotency_key
            && self.store.has_applied(key)?
        {
            let post_count = self
                .store
                .read_counter(user_id)?
                .ok_or(CounterError::NotFound { user_id })?;
            return Ok(CounterUpdate {
                user_id,
                post_count,
                applied: false,
            });
        }

        let current = self
            .store
            .read_counter(user_id)?
            .ok_or(CounterError::NotFound { user_id })?;
        let next = current.saturating_add(delta);
        self.store.write_counter(user_id, next, idempotency_key)?;
        Ok(CounterUpdate {
            user_id,
            post_count: next,
            applied: true,
        })
    }
}

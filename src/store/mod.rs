//! Row stores for both services.
//!
//! Each store is a JSON snapshot file that is rewritten atomically on every
//! mutation. There is no transaction spanning the post store and the user
//! store; the only multi-row atomic unit is a single snapshot write, which is
//! what lets a post row and its outbox entry commit together.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use crate::domain::{
    CounterAdjustment, DomainError, Post, PostId, PostInput, UserAccount, UserId,
};

mod posts;
mod users;

pub use posts::{JsonPostStore, OutboxEntry, OutboxStatus, PersistedPosts};
pub use users::{JsonUserStore, PersistedUsers};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    Domain(DomainError),
    SchemaVersionMismatch { expected: u32, got: u32 },
    LockPoisoned(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::Domain(e) => write!(f, "{e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
            Self::LockPoisoned(op) => write!(f, "store lock poisoned during {op}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::Domain(e) => Some(e),
            Self::SchemaVersionMismatch { .. } | Self::LockPoisoned(_) => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

/// Result of a post write. `outbox_entry` is set when an adjustment was
/// enqueued in the same snapshot write as the post row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostWrite {
    pub post: Post,
    pub outbox_entry: Option<OutboxEntry>,
}

pub trait PostStore: Send + Sync {
    /// Inserts a post. Fails with `DomainError::DuplicatePost` when the id is taken.
    fn insert_post(
        &self,
        input: &PostInput,
        enqueue: Option<CounterAdjustment>,
    ) -> Result<PostWrite, StoreError>;

    /// Deletes a post. Fails with `DomainError::MissingPost` when the id is unknown.
    fn delete_post(
        &self,
        post_id: PostId,
        enqueue: Option<CounterAdjustment>,
    ) -> Result<PostWrite, StoreError>;

    /// Puts back a previously deleted row, keeping its original timestamp.
    fn restore_post(&self, post: Post) -> Result<(), StoreError>;

    /// Queues an adjustment for an existing write under a caller-chosen id.
    /// The id is also the idempotency key the adjustment is delivered with.
    fn enqueue_adjustment(
        &self,
        id: &str,
        post_id: PostId,
        adjustment: CounterAdjustment,
    ) -> Result<OutboxEntry, StoreError>;

    fn get_post(&self, post_id: PostId) -> Result<Option<Post>, StoreError>;

    fn count_posts_by_owner(&self, user_id: UserId) -> Result<usize, StoreError>;
}

pub trait OutboxStore: Send + Sync {
    /// Pending entries, oldest first.
    fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    fn list_outbox(&self) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Removes a delivered entry. Returns false when it was already gone.
    fn complete_outbox(&self, id: &str) -> Result<bool, StoreError>;

    /// Records a failed delivery attempt; `give_up` parks the entry as failed.
    fn record_outbox_attempt(
        &self,
        id: &str,
        error: &str,
        give_up: bool,
    ) -> Result<Option<OutboxEntry>, StoreError>;

    /// Moves a failed entry back to pending with a fresh attempt budget.
    fn requeue_outbox(&self, id: &str) -> Result<Option<OutboxEntry>, StoreError>;
}

/// Outcome of a counter write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterWrite {
    pub post_count: i64,
    /// False when the idempotency key had already been applied.
    pub applied: bool,
}

pub trait CounterStore: Send + Sync {
    fn read_counter(&self, user_id: UserId) -> Result<Option<i64>, StoreError>;

    /// Unconditionally overwrites the counter. Fails with `MissingUser` when
    /// the row does not exist.
    fn write_counter(
        &self,
        user_id: UserId,
        value: i64,
        applied_key: Option<&str>,
    ) -> Result<(), StoreError>;

    /// `post_count = post_count + delta` as one step under the row lock.
    fn adjust_counter(
        &self,
        user_id: UserId,
        delta: i64,
        applied_key: Option<&str>,
    ) -> Result<CounterWrite, StoreError>;

    fn has_applied(&self, key: &str) -> Result<bool, StoreError>;
}

pub trait UserStore: Send + Sync {
    fn create_user(
        &self,
        name: String,
        email: String,
        password_hash: String,
    ) -> Result<UserAccount, StoreError>;

    fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>, StoreError>;

    fn find_user_by_name(&self, name: &str) -> Result<Option<UserAccount>, StoreError>;

    fn find_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, StoreError>;
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn check_schema_version(got: u32) -> Result<(), StoreError> {
    if got != SCHEMA_VERSION {
        return Err(StoreError::SchemaVersionMismatch {
            expected: SCHEMA_VERSION,
            got,
        });
    }
    Ok(())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        let _ = file.sync_all();
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

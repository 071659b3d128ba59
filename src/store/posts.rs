use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use super::{
    OutboxStore, PostStore, PostWrite, SCHEMA_VERSION, StoreError, check_schema_version,
    now_rfc3339, write_atomic,
};
use crate::{
    domain::{CounterAdjustment, DomainError, Post, PostId, PostInput, UserId},
    id::new_outbox_id,
};

pub const POSTS_FILE_NAME: &str = "posts.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Failed,
}

/// A counter adjustment waiting for delivery to the user service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: String,
    pub post_id: PostId,
    pub adjustment: CounterAdjustment,
    pub created_at: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub status: OutboxStatus,
}

impl OutboxEntry {
    fn new(post_id: PostId, adjustment: CounterAdjustment) -> Self {
        Self::with_id(new_outbox_id(), post_id, adjustment)
    }

    fn with_id(id: String, post_id: PostId, adjustment: CounterAdjustment) -> Self {
        Self {
            id,
            post_id,
            adjustment,
            created_at: now_rfc3339(),
            attempts: 0,
            last_error: None,
            status: OutboxStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedPosts {
    pub schema_version: u32,
    #[serde(default)]
    pub posts: BTreeMap<PostId, Post>,
    /// Keyed by ULID, so iteration is roughly creation order.
    #[serde(default)]
    pub outbox: BTreeMap<String, OutboxEntry>,
}

impl PersistedPosts {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            posts: BTreeMap::new(),
            outbox: BTreeMap::new(),
        }
    }

    fn next_post_id(&self) -> PostId {
        self.posts
            .keys()
            .next_back()
            .map(|id| id.saturating_add(1).max(1))
            .unwrap_or(1)
    }
}

/// Post store backed by `posts.json`. Posts and outbox entries live in the
/// same snapshot, so a post write and its enqueued adjustment are one atomic
/// file replacement.
pub struct JsonPostStore {
    path: Option<PathBuf>,
    state: Mutex<PersistedPosts>,
}

impl JsonPostStore {
    pub fn load_or_init(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(POSTS_FILE_NAME);
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            let state: PersistedPosts = serde_json::from_slice(&bytes)?;
            check_schema_version(state.schema_version)?;
            state
        } else {
            let state = PersistedPosts::empty();
            write_atomic(&path, &serde_json::to_vec_pretty(&state)?)?;
            state
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(PersistedPosts::empty()),
        }
    }

    pub fn snapshot(&self) -> Result<PersistedPosts, StoreError> {
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::LockPoisoned("snapshot"))?;
        Ok(state.clone())
    }

    /// Applies `f` to a copy of the state, persists the copy, then swaps it in.
    /// A failed save leaves the in-memory state untouched.
    fn mutate<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut PersistedPosts) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::LockPoisoned(op))?;
        let mut next = state.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            write_atomic(path, &serde_json::to_vec_pretty(&next)?)?;
        }
        *state = next;
        Ok(out)
    }

    fn read<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&PersistedPosts) -> T,
    ) -> Result<T, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned(op))?;
        Ok(f(&state))
    }
}

impl PostStore for JsonPostStore {
    fn insert_post(
        &self,
        input: &PostInput,
        enqueue: Option<CounterAdjustment>,
    ) -> Result<PostWrite, StoreError> {
        self.mutate("insert_post", |state| {
            let post_id = input.id.unwrap_or_else(|| state.next_post_id());
            if state.posts.contains_key(&post_id) {
                return Err(DomainError::DuplicatePost { post_id }.into());
            }

            let post = Post {
                id: post_id,
                owner_user_id: input.user_id,
                title: input.title.clone(),
                description: input.description.clone(),
                created_at: now_rfc3339(),
            };
            state.posts.insert(post_id, post.clone());

            let outbox_entry = enqueue.map(|adj| {
                let entry = OutboxEntry::new(post_id, adj);
                state.outbox.insert(entry.id.clone(), entry.clone());
                entry
            });
            Ok(PostWrite { post, outbox_entry })
        })
    }

    fn delete_post(
        &self,
        post_id: PostId,
        enqueue: Option<CounterAdjustment>,
    ) -> Result<PostWrite, StoreError> {
        self.mutate("delete_post", |state| {
            let post = state
                .posts
                .remove(&post_id)
                .ok_or(DomainError::MissingPost { post_id })?;

            let outbox_entry = enqueue.map(|adj| {
                let entry = OutboxEntry::new(post_id, adj);
                state.outbox.insert(entry.id.clone(), entry.clone());
                entry
            });
            Ok(PostWrite { post, outbox_entry })
        })
    }

    fn restore_post(&self, post: Post) -> Result<(), StoreError> {
        self.mutate("restore_post", |state| {
            if state.posts.contains_key(&post.id) {
                return Err(DomainError::DuplicatePost { post_id: post.id }.into());
            }
            state.posts.insert(post.id, post);
            Ok(())
        })
    }

    fn enqueue_adjustment(
        &self,
        id: &str,
        post_id: PostId,
        adjustment: CounterAdjustment,
    ) -> Result<OutboxEntry, StoreError> {
        self.mutate("enqueue_adjustment", |state| {
            let entry = state
                .outbox
                .entry(id.to_string())
                .or_insert_with(|| OutboxEntry::with_id(id.to_string(), post_id, adjustment));
            Ok(entry.clone())
        })
    }

    fn get_post(&self, post_id: PostId) -> Result<Option<Post>, StoreError> {
        self.read("get_post", |state| state.posts.get(&post_id).cloned())
    }

    fn count_posts_by_owner(&self, user_id: UserId) -> Result<usize, StoreError> {
        self.read("count_posts_by_owner", |state| {
            state
                .posts
                .values()
                .filter(|p| p.owner_user_id == user_id)
                .count()
        })
    }
}

impl OutboxStore for JsonPostStore {
    fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        self.read("pending_outbox", |state| {
            state
                .outbox
                .values()
                .filter(|e| e.is_pending())
                .take(limit)
                .cloned()
                .collect()
        })
    }

    fn list_outbox(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        self.read("list_outbox", |state| state.outbox.values().cloned().collect())
    }

    fn complete_outbox(&self, id: &str) -> Result<bool, StoreError> {
        self.mutate("complete_outbox", |state| Ok(state.outbox.remove(id).is_some()))
    }

    fn record_outbox_attempt(
        &self,
        id: &str,
        error: &str,
        give_up: bool,
    ) -> Result<Option<OutboxEntry>, StoreError> {
        self.mutate("record_outbox_attempt", |state| {
            let Some(entry) = state.outbox.get_mut(id) else {
                return Ok(None);
            };
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = Some(error.to_string());
            if give_up {
                entry.status = OutboxStatus::Failed;
            }
            Ok(Some(entry.clone()))
        })
    }

    fn requeue_outbox(&self, id: &str) -> Result<Option<OutboxEntry>, StoreError> {
        self.mutate("requeue_outbox", |state| {
            let Some(entry) = state.outbox.get_mut(id) else {
                return Ok(None);
            };
            entry.status = OutboxStatus::Pending;
            entry.attempts = 0;
            Ok(Some(entry.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn input(id: Option<PostId>, owner: UserId) -> PostInput {
        PostInput {
            id,
            user_id: owner,
            title: "hello".to_string(),
            description: "world".to_string(),
        }
    }

    #[test]
    fn bootstrap_creates_empty_posts_json() {
        let tmp = tempfile::tempdir().unwrap();
        let _store = JsonPostStore::load_or_init(tmp.path()).unwrap();

        let bytes = fs::read(tmp.path().join(POSTS_FILE_NAME)).unwrap();
        let state: PersistedPosts = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(state, PersistedPosts::empty());
    }

    #[test]
    fn duplicate_post_id_is_rejected_and_state_is_unchanged() {
        let store = JsonPostStore::in_memory();
        store.insert_post(&input(Some(100), 42), None).unwrap();

        let err = store
            .insert_post(&input(Some(100), 7), Some(CounterAdjustment::increment(7)))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::DuplicatePost { post_id: 100 })
        ));

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.posts[&100].owner_user_id, 42);
        assert!(snap.outbox.is_empty());
    }

    #[test]
    fn missing_id_allocates_next_free_id() {
        let store = JsonPostStore::in_memory();
        store.insert_post(&input(Some(10), 1), None).unwrap();
        let write = store.insert_post(&input(None, 1), None).unwrap();
        assert_eq!(write.post.id, 11);
    }

    #[test]
    fn post_and_outbox_entry_are_persisted_together() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonPostStore::load_or_init(tmp.path()).unwrap();
        let write = store
            .insert_post(&input(Some(5), 42), Some(CounterAdjustment::increment(42)))
            .unwrap();
        let entry = write.outbox_entry.unwrap();
        assert_eq!(entry.post_id, 5);
        drop(store);

        let store = JsonPostStore::load_or_init(tmp.path()).unwrap();
        assert!(store.get_post(5).unwrap().is_some());
        let pending = store.pending_outbox(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, entry.id);
        assert_eq!(pending[0].adjustment, CounterAdjustment::increment(42));
    }

    #[test]
    fn delete_unknown_post_is_not_found() {
        let store = JsonPostStore::in_memory();
        let err = store
            .delete_post(9, Some(CounterAdjustment::decrement(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::MissingPost { post_id: 9 })
        ));
        assert!(store.list_outbox().unwrap().is_empty());
    }

    #[test]
    fn restore_puts_back_deleted_row() {
        let store = JsonPostStore::in_memory();
        let created = store.insert_post(&input(Some(3), 1), None).unwrap().post;
        let deleted = store.delete_post(3, None).unwrap().post;
        assert_eq!(created, deleted);

        store.restore_post(deleted).unwrap();
        assert_eq!(store.get_post(3).unwrap(), Some(created));
    }

    #[test]
    fn outbox_attempts_fail_and_requeue() {
        let store = JsonPostStore::in_memory();
        let entry = store
            .insert_post(&input(Some(1), 1), Some(CounterAdjustment::increment(1)))
            .unwrap()
            .outbox_entry
            .unwrap();

        let updated = store
            .record_outbox_attempt(&entry.id, "connection refused", false)
            .unwrap()
            .unwrap();
        assert_eq!(updated.attempts, 1);
        assert!(updated.is_pending());

        let failed = store
            .record_outbox_attempt(&entry.id, "connection refused", true)
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, OutboxStatus::Failed);
        assert!(store.pending_outbox(10).unwrap().is_empty());

        let requeued = store.requeue_outbox(&entry.id).unwrap().unwrap();
        assert!(requeued.is_pending());
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.last_error.as_deref(), Some("connection refused"));

        assert!(store.complete_outbox(&entry.id).unwrap());
        assert!(!store.complete_outbox(&entry.id).unwrap());
    }

    #[test]
    fn counts_posts_by_owner() {
        let store = JsonPostStore::in_memory();
        store.insert_post(&input(Some(1), 42), None).unwrap();
        store.insert_post(&input(Some(2), 42), None).unwrap();
        store.insert_post(&input(Some(3), 7), None).unwrap();
        assert_eq!(store.count_posts_by_owner(42).unwrap(), 2);
        assert_eq!(store.count_posts_by_owner(99).unwrap(), 0);
    }

    #[test]
    fn enqueue_adjustment_keeps_the_caller_id_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonPostStore::load_or_init(tmp.path()).unwrap();
        store.insert_post(&input(Some(1), 42), None).unwrap();

        let key = new_outbox_id();
        let entry = store
            .enqueue_adjustment(&key, 1, CounterAdjustment::increment(42))
            .unwrap();
        assert_eq!(entry.id, key);
        assert!(entry.is_pending());
        store
            .enqueue_adjustment(&key, 1, CounterAdjustment::increment(42))
            .unwrap();

        let reloaded = JsonPostStore::load_or_init(tmp.path()).unwrap();
        let pending = reloaded.pending_outbox(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, key);
        assert_eq!(pending[0].adjustment, CounterAdjustment::increment(42));
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(POSTS_FILE_NAME),
            br#"{"schema_version": 99}"#,
        )
        .unwrap();
        let err = JsonPostStore::load_or_init(tmp.path()).err().unwrap();
        assert!(matches!(
            err,
            StoreError::SchemaVersionMismatch { expected: 1, got: 99 }
        ));
    }
}

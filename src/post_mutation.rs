use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    counter_sync::{CounterSync, SyncError},
    domain::{CounterAdjustment, DeletePostInput, Post, PostInput},
    id::new_outbox_id,
    outbox::OutboxHandle,
    store::{PostStore, StoreError},
};

/// Keyed sends per adjustment in compensate mode before the outcome is
/// treated as unknown.
const COMPENSATE_SEND_ATTEMPTS: u32 = 3;
const COMPENSATE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How a post mutation propagates its counter adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CounterDelivery {
    /// One synchronous send; failures are logged and reported but the post
    /// write stands.
    Direct,
    /// Synchronous keyed send, retried on transport errors. A rejection
    /// undoes the post write; an unknown outcome is handed to the outbox
    /// under the same key.
    Compensate,
    /// Adjustment is persisted with the post and delivered in the background.
    #[default]
    Outbox,
}

impl CounterDelivery {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Compensate => "compensate",
            Self::Outbox => "outbox",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "counter_sync", rename_all = "snake_case")]
pub enum CounterSyncStatus {
    Delivered,
    Failed {
        #[serde(rename = "counter_sync_error")]
        error: String,
    },
    Queued {
        outbox_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    pub post: Post,
    #[serde(flatten)]
    pub counter_sync: CounterSyncStatus,
}

#[derive(Debug)]
pub enum MutationError {
    Store(StoreError),
    /// The adjustment could not be delivered and the post write was undone.
    SyncFailed(SyncError),
    /// The adjustment was not settled and neither undoing the post write nor
    /// queueing the adjustment worked. The stores disagree until an operator
    /// intervenes.
    CompensationFailed { sync: SyncError, store: StoreError },
}

impl std::fmt::Display for MutationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "{e}"),
            Self::SyncFailed(e) => write!(f, "counter sync failed, post write undone: {e}"),
            Self::CompensationFailed { sync, store } => write!(
                f,
                "counter sync failed ({sync}) and post write could not be settled: {store}"
            ),
        }
    }
}

impl std::error::Error for MutationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::SyncFailed(e) => Some(e),
            Self::CompensationFailed { store, .. } => Some(store),
        }
    }
}

impl From<StoreError> for MutationError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

#[derive(Clone)]
pub struct PostMutationService {
    posts: Arc<dyn PostStore>,
    sync: Arc<dyn CounterSync>,
    outbox: OutboxHandle,
    delivery: CounterDelivery,
}

impl PostMutationService {
    pub fn new(
        posts: Arc<dyn PostStore>,
        sync: Arc<dyn CounterSync>,
        outbox: OutboxHandle,
        delivery: CounterDelivery,
    ) -> Self {
        Self {
            posts,
            sync,
            outbox,
            delivery,
        }
    }

    pub fn delivery(&self) -> CounterDelivery {
        self.delivery
    }

    pub async fn create(&self, input: PostInput) -> Result<MutationOutcome, MutationError> {
        let adjustment = CounterAdjustment::increment(input.user_id);
        let write = self.posts.insert_post(&input, self.enqueue(adjustment))?;
        let post = write.post;
        info!(post_id = post.id, user_id = post.owner_user_id, "post created");

        if let Some(entry) = write.outbox_entry {
            self.outbox.notify();
            return Ok(MutationOutcome {
                post,
                counter_sync: CounterSyncStatus::Queued {
                    outbox_id: entry.id,
                },
            });
        }

        if self.delivery == CounterDelivery::Compensate {
            return self.send_or_compensate(post, adjustment, Undo::Create).await;
        }

        match self.sync.send(&adjustment, None).await {
            Ok(()) => Ok(MutationOutcome {
                post,
                counter_sync: CounterSyncStatus::Delivered,
            }),
            Err(err) => {
                warn!(
                    post_id = post.id,
                    user_id = adjustment.user_id,
                    %err,
                    "counter increment not delivered; post kept"
                );
                Ok(MutationOutcome {
                    post,
                    counter_sync: CounterSyncStatus::Failed {
                        error: err.to_string(),
                    },
                })
            }
        }
    }

    /// Deletes the post and decrements the counter of the requesting user.
    /// An unknown post id fails before any adjustment is sent.
    pub async fn delete(&self, input: DeletePostInput) -> Result<MutationOutcome, MutationError> {
        let adjustment = CounterAdjustment::decrement(input.user_id);
        let write = self.posts.delete_post(input.id, self.enqueue(adjustment))?;
        let post = write.post;
        if post.owner_user_id != input.user_id {
            warn!(
                post_id = post.id,
                owner = post.owner_user_id,
                requested_by = input.user_id,
                "delete requested by a user other than the owner"
            );
        }
        info!(post_id = post.id, user_id = input.user_id, "post deleted");

        if let Some(entry) = write.outbox_entry {
            self.outbox.notify();
            return Ok(MutationOutcome {
                post,
                counter_sync: CounterSyncStatus::Queued {
                    outbox_id: entry.id,
                },
            });
        }

        if self.delivery == CounterDelivery::Compensate {
            return self.send_or_compensate(post, adjustment, Undo::Delete).await;
        }

        match self.sync.send(&adjustment, None).await {
            Ok(()) => Ok(MutationOutcome {
                post,
                counter_sync: CounterSyncStatus::Delivered,
            }),
            Err(err) => {
                warn!(
                    post_id = post.id,
                    user_id = adjustment.user_id,
                    %err,
                    "counter decrement not delivered; post stays deleted"
                );
                Ok(MutationOutcome {
                    post,
                    counter_sync: CounterSyncStatus::Failed {
                        error: err.to_string(),
                    },
                })
            }
        }
    }

    fn enqueue(&self, adjustment: CounterAdjustment) -> Option<CounterAdjustment> {
        (self.delivery == CounterDelivery::Outbox).then_some(adjustment)
    }

    /// Undoes the post write only when the user service rejected the
    /// adjustment. When the outcome is unknown the adjustment is queued under
    /// the key it was already sent with, so a late apply is not counted twice.
    async fn send_or_compensate(
        &self,
        post: Post,
        adjustment: CounterAdjustment,
        undo: Undo,
    ) -> Result<MutationOutcome, MutationError> {
        let key = new_outbox_id();
        let err = match self.send_keyed(&adjustment, &key).await {
            Ok(()) => {
                return Ok(MutationOutcome {
                    post,
                    counter_sync: CounterSyncStatus::Delivered,
                });
            }
            Err(err) => err,
        };

        if err.is_permanent() {
            return Err(match undo {
                Undo::Create => self.undo_create(&post, err),
                Undo::Delete => self.undo_delete(post, err),
            });
        }

        match self.posts.enqueue_adjustment(&key, post.id, adjustment) {
            Ok(entry) => {
                warn!(
                    post_id = post.id,
                    user_id = adjustment.user_id,
                    outbox_id = %entry.id,
                    %err,
                    "counter adjustment outcome unknown; handed to outbox"
                );
                self.outbox.notify();
                Ok(MutationOutcome {
                    post,
                    counter_sync: CounterSyncStatus::Queued {
                        outbox_id: entry.id,
                    },
                })
            }
            Err(store) => {
                error!(post_id = post.id, %err, %store, "could not queue counter adjustment");
                Err(MutationError::CompensationFailed { sync: err, store })
            }
        }
    }

    async fn send_keyed(&self, adjustment: &CounterAdjustment, key: &str) -> Result<(), SyncError> {
        let mut attempt = 1;
        loop {
            match self.sync.send(adjustment, Some(key)).await {
                Err(err) if !err.is_permanent() && attempt < COMPENSATE_SEND_ATTEMPTS => {
                    debug!(attempt, %err, "retrying counter adjustment");
                    tokio::time::sleep(COMPENSATE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                res => return res,
            }
        }
    }

    fn undo_create(&self, post: &Post, sync: SyncError) -> MutationError {
        match self.posts.delete_post(post.id, None) {
            Ok(_) => {
                warn!(post_id = post.id, %sync, "counter increment rejected; post creation undone");
                MutationError::SyncFailed(sync)
            }
            Err(store) => {
                error!(post_id = post.id, %sync, %store, "could not undo post creation");
                MutationError::CompensationFailed { sync, store }
            }
        }
    }

    fn undo_delete(&self, post: Post, sync: SyncError) -> MutationError {
        let post_id = post.id;
        match self.posts.restore_post(post) {
            Ok(()) => {
                warn!(post_id, %sync, "counter decrement rejected; post restored");
                MutationError::SyncFailed(sync)
            }
            Err(store) => {
                error!(post_id, %sync, %store, "could not restore deleted post");
                MutationError::CompensationFailed { sync, store }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Undo {
    Create,
    Delete,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        counter_sync::{BoxFuture, LocalCounterSync},
        counter_update::{CounterUpdateHandler, UpdateStrategy},
        domain::{DomainError, UserAccount},
        outbox::{DispatchSettings, dispatch_once},
        store::{CounterStore, JsonPostStore, JsonUserStore, OutboxStore},
    };

    /// Records adjustments and answers every send with the same result.
    struct RecordingSync {
        reply: Result<(), SyncError>,
        sent: Mutex<Vec<(CounterAdjustment, Option<String>)>>,
    }

    impl RecordingSync {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(()),
                sent: Mutex::default(),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Err(SyncError::Transport("connection refused".into())),
                sent: Mutex::default(),
            })
        }

        fn rejecting() -> Arc<Self> {
            Arc::new(Self {
                reply: Err(SyncError::Status {
                    status: 404,
                    body: "unknown user".into(),
                }),
                sent: Mutex::default(),
            })
        }

        fn sent(&self) -> Vec<(CounterAdjustment, Option<String>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CounterSync for RecordingSync {
        fn send<'a>(
            &'a self,
            adjustment: &'a CounterAdjustment,
            idempotency_key: Option<&'a str>,
        ) -> BoxFuture<'a, Result<(), SyncError>> {
            self.sent
                .lock()
                .unwrap()
                .push((*adjustment, idempotency_key.map(str::to_string)));
            let reply = self.reply.clone();
            Box::pin(async move { reply })
        }
    }

    /// Applies the adjustment, then reports a timeout as if the response
    /// was lost on the way back.
    struct AppliedThenTimedOut(LocalCounterSync);

    impl CounterSync for AppliedThenTimedOut {
        fn send<'a>(
            &'a self,
            adjustment: &'a CounterAdjustment,
            idempotency_key: Option<&'a str>,
        ) -> BoxFuture<'a, Result<(), SyncError>> {
            Box::pin(async move {
                if let Err(err) = self.0.send(adjustment, idempotency_key).await {
                    return Err(err);
                }
                Err(SyncError::Transport("operation timed out".into()))
            })
        }
    }

    fn seeded_users(post_count: i64) -> Arc<JsonUserStore> {
        let users = Arc::new(JsonUserStore::in_memory());
        users
            .insert_account(UserAccount {
                id: 42,
                name: "alice".into(),
                email: "alice@example.com".into(),
                password_hash: String::new(),
                post_count,
            })
            .unwrap();
        users
    }

    fn local_sync(users: &Arc<JsonUserStore>) -> LocalCounterSync {
        LocalCounterSync::new(CounterUpdateHandler::new(
            users.clone(),
            UpdateStrategy::Atomic,
        ))
    }

    fn input(id: i64, owner: i64) -> PostInput {
        PostInput {
            id: Some(id),
            user_id: owner,
            title: "hello".into(),
            description: "world".into(),
        }
    }

    fn delete_input(id: i64, owner: i64) -> DeletePostInput {
        DeletePostInput {
            id,
            user_id: owner,
            title: String::new(),
            description: String::new(),
        }
    }

    fn service(
        posts: Arc<JsonPostStore>,
        sync: Arc<dyn CounterSync>,
        delivery: CounterDelivery,
    ) -> PostMutationService {
        PostMutationService::new(posts, sync, OutboxHandle::noop(), delivery)
    }

    #[tokio::test]
    async fn direct_create_and_delete_send_one_adjustment_each() {
        let posts = Arc::new(JsonPostStore::in_memory());
        let sync = RecordingSync::ok();
        let svc = service(posts.clone(), sync.clone(), CounterDelivery::Direct);

        let created = svc.create(input(100, 42)).await.unwrap();
        assert_eq!(created.counter_sync, CounterSyncStatus::Delivered);
        assert!(posts.get_post(100).unwrap().is_some());

        svc.delete(delete_input(100, 42)).await.unwrap();
        assert!(posts.get_post(100).unwrap().is_none());

        assert_eq!(
            sync.sent(),
            vec![
                (CounterAdjustment::increment(42), None),
                (CounterAdjustment::decrement(42), None),
            ]
        );
    }

    #[tokio::test]
    async fn direct_sync_failure_keeps_post_and_reports_failed() {
        let posts = Arc::new(JsonPostStore::in_memory());
        let svc = service(posts.clone(), RecordingSync::failing(), CounterDelivery::Direct);

        let outcome = svc.create(input(1, 42)).await.unwrap();
        assert!(matches!(outcome.counter_sync, CounterSyncStatus::Failed { .. }));
        assert!(posts.get_post(1).unwrap().is_some());
    }

    #[tokio::test]
    async fn compensate_undoes_create_and_restores_delete_on_rejection() {
        let posts = Arc::new(JsonPostStore::in_memory());
        let sync = RecordingSync::rejecting();
        let svc = service(posts.clone(), sync.clone(), CounterDelivery::Compensate);

        let err = svc.create(input(1, 42)).await.unwrap_err();
        assert!(matches!(err, MutationError::SyncFailed(_)));
        assert!(posts.get_post(1).unwrap().is_none());

        posts.insert_post(&input(2, 42), None).unwrap();
        let before = posts.get_post(2).unwrap().unwrap();
        let err = svc.delete(delete_input(2, 42)).await.unwrap_err();
        assert!(matches!(err, MutationError::SyncFailed(_)));
        assert_eq!(posts.get_post(2).unwrap(), Some(before));

        // Rejections are final; each mutation sent exactly once.
        assert_eq!(sync.sent().len(), 2);
        assert!(posts.list_outbox().unwrap().is_empty());
    }

    #[tokio::test]
    async fn compensate_queues_under_the_sent_key_when_outcome_is_unknown() {
        let posts = Arc::new(JsonPostStore::in_memory());
        let sync = RecordingSync::failing();
        let svc = service(posts.clone(), sync.clone(), CounterDelivery::Compensate);

        let outcome = svc.create(input(1, 42)).await.unwrap();
        let CounterSyncStatus::Queued { outbox_id } = outcome.counter_sync else {
            panic!("expected queued, got {:?}", outcome.counter_sync);
        };
        assert!(posts.get_post(1).unwrap().is_some());

        let sent = sync.sent();
        assert_eq!(sent.len(), COMPENSATE_SEND_ATTEMPTS as usize);
        assert!(
            sent.iter()
                .all(|(adj, key)| *adj == CounterAdjustment::increment(42)
                    && key.as_deref() == Some(outbox_id.as_str()))
        );

        let entries = posts.list_outbox().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, outbox_id);
        assert_eq!(entries[0].post_id, 1);
    }

    #[tokio::test]
    async fn compensate_keeps_post_when_adjustment_landed_but_reply_was_lost() {
        let users = seeded_users(3);
        let posts = Arc::new(JsonPostStore::in_memory());
        let svc = service(
            posts.clone(),
            Arc::new(AppliedThenTimedOut(local_sync(&users))),
            CounterDelivery::Compensate,
        );

        let outcome = svc.create(input(100, 42)).await.unwrap();
        assert!(matches!(outcome.counter_sync, CounterSyncStatus::Queued { .. }));
        assert!(posts.get_post(100).unwrap().is_some());
        assert_eq!(posts.count_posts_by_owner(42).unwrap(), 1);
        assert_eq!(users.read_counter(42).unwrap(), Some(4));

        // Redelivering the queued entry must not count the post twice.
        let settings = DispatchSettings::default();
        let report = dispatch_once(posts.as_ref(), &local_sync(&users), &settings)
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert!(posts.list_outbox().unwrap().is_empty());
        assert_eq!(users.read_counter(42).unwrap(), Some(4));

        svc.delete(delete_input(100, 42)).await.unwrap();
        assert!(posts.get_post(100).unwrap().is_none());
        assert_eq!(users.read_counter(42).unwrap(), Some(3));
    }

    #[tokio::test]
    async fn outbox_mode_enqueues_with_the_post_and_sends_nothing_inline() {
        let posts = Arc::new(JsonPostStore::in_memory());
        let sync = RecordingSync::ok();
        let svc = service(posts.clone(), sync.clone(), CounterDelivery::Outbox);

        let outcome = svc.create(input(1, 42)).await.unwrap();
        let CounterSyncStatus::Queued { outbox_id } = outcome.counter_sync else {
            panic!("expected queued, got {:?}", outcome.counter_sync);
        };
        let entries = posts.list_outbox().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, outbox_id);
        assert_eq!(entries[0].adjustment, CounterAdjustment::increment(42));
        assert!(sync.sent().is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_fails_before_any_adjustment() {
        let posts = Arc::new(JsonPostStore::in_memory());
        let sync = RecordingSync::ok();
        let svc = service(posts, sync.clone(), CounterDelivery::Direct);

        svc.create(input(5, 1)).await.unwrap();
        let err = svc.create(input(5, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            MutationError::Store(StoreError::Domain(DomainError::DuplicatePost { post_id: 5 }))
        ));
        assert_eq!(sync.sent().len(), 1);
    }

    #[tokio::test]
    async fn delete_of_unknown_post_sends_nothing() {
        let posts = Arc::new(JsonPostStore::in_memory());
        let sync = RecordingSync::ok();
        let svc = service(posts, sync.clone(), CounterDelivery::Direct);

        let err = svc.delete(delete_input(404, 1)).await.unwrap_err();
        assert!(matches!(
            err,
            MutationError::Store(StoreError::Domain(DomainError::MissingPost { post_id: 404 }))
        ));
        assert!(sync.sent().is_empty());
    }

    #[tokio::test]
    async fn counter_tracks_create_then_delete() {
        let users = seeded_users(3);
        let sync = Arc::new(local_sync(&users));
        let svc = service(Arc::new(JsonPostStore::in_memory()), sync, CounterDelivery::Direct);

        svc.create(input(100, 42)).await.unwrap();
        assert_eq!(users.read_counter(42).unwrap(), Some(4));
        svc.delete(delete_input(100, 42)).await.unwrap();
        assert_eq!(users.read_counter(42).unwrap(), Some(3));
    }

    #[test]
    fn outcome_serializes_status_inline() {
        let post = Post {
            id: 1,
            owner_user_id: 2,
            title: "t".into(),
            description: "d".into(),
            created_at: "2024-01-01T00:00:00.000Z".into(),
        };
        let outcome = MutationOutcome {
            post,
            counter_sync: CounterSyncStatus::Queued {
                outbox_id: "adj_x".into(),
            },
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["counter_sync"], json!("queued"));
        assert_eq!(value["outbox_id"], json!("adj_x"));
        assert_eq!(value["post"]["UserId"], json!(2));

        let failed = serde_json::to_value(CounterSyncStatus::Failed {
            error: "boom".into(),
        })
        .unwrap();
        assert_eq!(
            failed,
            json!({ "counter_sync": "failed", "counter_sync_error": "boom" })
        );
    }
}

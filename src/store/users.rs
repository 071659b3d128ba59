use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use super::{
    CounterStore, CounterWrite, SCHEMA_VERSION, StoreError, UserStore, check_schema_version,
    now_rfc3339, write_atomic,
};
use crate::domain::{DomainError, UserAccount, UserId};

pub const USERS_FILE_NAME: &str = "users.json";

/// Applied idempotency keys older than this many entries are forgotten.
pub const APPLIED_KEYS_CAP: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedUsers {
    pub schema_version: u32,
    #[serde(default)]
    pub users: BTreeMap<UserId, UserAccount>,
    /// Idempotency key -> time it was applied.
    #[serde(default)]
    pub applied_keys: BTreeMap<String, String>,
}

impl PersistedUsers {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            users: BTreeMap::new(),
            applied_keys: BTreeMap::new(),
        }
    }

    fn next_user_id(&self) -> UserId {
        self.users
            .keys()
            .next_back()
            .map(|id| id.saturating_add(1).max(1))
            .unwrap_or(1)
    }

    fn remember_key(&mut self, key: Option<&str>) {
        let Some(key) = key else {
            return;
        };
        self.applied_keys.insert(key.to_string(), now_rfc3339());
        while self.applied_keys.len() > APPLIED_KEYS_CAP {
            let oldest = self
                .applied_keys
                .iter()
                .min_by(|a, b| a.1.cmp(b.1))
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.applied_keys.remove(&k);
                }
                None => break,
            }
        }
    }

    fn is_applied(&self, key: Option<&str>) -> bool {
        key.is_some_and(|k| self.applied_keys.contains_key(k))
    }
}

/// User store backed by `users.json`. Holds accounts, their post counters,
/// and the idempotency keys of adjustments already applied.
pub struct JsonUserStore {
    path: Option<PathBuf>,
    state: Mutex<PersistedUsers>,
}

impl JsonUserStore {
    pub fn load_or_init(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(USERS_FILE_NAME);
        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            let state: PersistedUsers = serde_json::from_slice(&bytes)?;
            check_schema_version(state.schema_version)?;
            state
        } else {
            let state = PersistedUsers::empty();
            write_atomic(&path, &serde_json::to_vec_pretty(&state)?)?;
            state
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(PersistedUsers::empty()),
        }
    }

    /// Inserts an account with a caller-chosen id. Used for seeding and by
    /// `create_user` after id allocation.
    pub fn insert_account(&self, account: UserAccount) -> Result<UserAccount, StoreError> {
        self.mutate("insert_account", |state| {
            insert_checked(state, account.clone())?;
            Ok(account)
        })
    }

    pub fn snapshot(&self) -> Result<PersistedUsers, StoreError> {
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::LockPoisoned("snapshot"))?;
        Ok(state.clone())
    }

    fn mutate<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut PersistedUsers) -> Result<T, StoreError>,
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
        f: impl FnOnce(&PersistedUsers) -> T,
    ) -> Result<T, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::LockPoisoned(op))?;
        Ok(f(&state))
    }
}

fn insert_checked(state: &mut PersistedUsers, account: UserAccount) -> Result<(), StoreError> {
    if state.users.contains_key(&account.id) {
        return Err(DomainError::DuplicateUserName { name: account.name }.into());
    }
    if state
        .users
        .values()
        .any(|u| u.name.eq_ignore_ascii_case(&account.name))
    {
        return Err(DomainError::DuplicateUserName { name: account.name }.into());
    }
    if state
        .users
        .values()
        .any(|u| u.email.eq_ignore_ascii_case(&account.email))
    {
        return Err(DomainError::DuplicateEmail {
            email: account.email,
        }
        .into());
    }
    state.users.insert(account.id, account);
    Ok(())
}

impl CounterStore for JsonUserStore {
    fn read_counter(&self, user_id: UserId) -> Result<Option<i64>, StoreError> {
        self.read("read_counter", |state| {
            state.users.get(&user_id).map(|u| u.post_count)
        })
    }

    fn write_counter(
        &self,
        user_id: UserId,
        value: i64,
        applied_key: Option<&str>,
    ) -> Result<(), StoreError> {
        self.mutate("write_counter", |state| {
            let user = state
                .users
                .get_mut(&user_id)
                .ok_or(DomainError::MissingUser { user_id })?;
            user.post_count = value;
            state.remember_key(applied_key);
            Ok(())
        })
    }

    fn adjust_counter(
        &self,
        user_id: UserId,
        delta: i64,
        applied_key: Option<&str>,
    ) -> Result<CounterWrite, StoreError> {
        self.mutate("adjust_counter", |state| {
            let replay = state.is_applied(applied_key);
            let user = state
                .users
                .get_mut(&user_id)
                .ok_or(DomainError::MissingUser { user_id })?;
            if replay {
                return Ok(CounterWrite {
                    post_count: user.post_count,
                    applied: false,
                });
            }
            user.post_count = user.post_count.saturating_add(delta);
            let post_count = user.post_count;
            state.remember_key(applied_key);
            Ok(CounterWrite {
                post_count,
                applied: true,
            })
        })
    }

    fn has_applied(&self, key: &str) -> Result<bool, StoreError> {
        self.read("has_applied", |state| state.applied_keys.contains_key(key))
    }
}

impl UserStore for JsonUserStore {
    fn create_user(
        &self,
        name: String,
        email: String,
        password_hash: String,
    ) -> Result<UserAccount, StoreError> {
        self.mutate("create_user", |state| {
            let account = UserAccount {
                id: state.next_user_id(),
                name,
                email,
                password_hash,
                post_count: 0,
            };
            insert_checked(state, account.clone())?;
            Ok(account)
        })
    }

    fn get_user(&self, user_id: UserId) -> Result<Option<UserAccount>, StoreError> {
        self.read("get_user", |state| state.users.get(&user_id).cloned())
    }

    fn find_user_by_name(&self, name: &str) -> Result<Option<UserAccount>, StoreError> {
        self.read("find_user_by_name", |state| {
            state
                .users
                .values()
                .find(|u| u.name.eq_ignore_ascii_case(name))
                .cloned()
        })
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, StoreError> {
        self.read("find_user_by_email", |state| {
            state
                .users
                .values()
                .find(|u| u.email.eq_ignore_ascii_case(email))
                .cloned()
        })
    }
}

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, info};

use crate::{
    domain::{DomainError, UserAccount, require_non_empty},
    password::{HashParams, hash_password, verify_password},
    store::{StoreError, UserStore},
};

#[derive(Debug)]
pub enum CredentialError {
    /// Neither a username nor an email was supplied.
    MissingIdentifier,
    /// Unknown identifier or wrong password. Deliberately indistinguishable.
    InvalidCredentials,
    Store(StoreError),
    Hash(String),
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingIdentifier => write!(f, "username or email is required"),
            Self::InvalidCredentials => write!(f, "invalid credentials"),
            Self::Store(e) => write!(f, "{e}"),
            Self::Hash(e) => write!(f, "password hashing failed: {e}"),
        }
    }
}

impl std::error::Error for CredentialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for CredentialError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<DomainError> for CredentialError {
    fn from(value: DomainError) -> Self {
        Self::Store(StoreError::Domain(value))
    }
}

/// Stand-in password for the hash that unknown logins are verified against.
const DUMMY_PASSWORD: &str = "postcount-unknown-user";

/// Signup and login against the user table.
#[derive(Clone)]
pub struct CredentialService {
    users: Arc<dyn UserStore>,
    params: HashParams,
    /// Verified against when the identifier matches no user, so both failure
    /// paths cost one argon2 verify at the configured params.
    dummy_hash: Arc<str>,
    password_checks: Arc<AtomicU64>,
}

impl CredentialService {
    pub fn new(users: Arc<dyn UserStore>, params: HashParams) -> Result<Self, CredentialError> {
        let dummy_hash = hash_password(DUMMY_PASSWORD, params).map_err(CredentialError::Hash)?;
        Ok(Self {
            users,
            params,
            dummy_hash: dummy_hash.into(),
            password_checks: Arc::default(),
        })
    }

    /// Number of argon2 verifications login has run.
    pub fn password_checks(&self) -> u64 {
        self.password_checks.load(Ordering::Relaxed)
    }

    pub fn signup(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<UserAccount, CredentialError> {
        require_non_empty("username", username)?;
        require_non_empty("email", email)?;
        require_non_empty("password", password)?;

        let hash = hash_password(password, self.params).map_err(CredentialError::Hash)?;
        let user = self
            .users
            .create_user(username.trim().to_string(), email.trim().to_string(), hash)?;
        info!(user_id = user.id, name = %user.name, "user signed up");
        Ok(user)
    }

    /// Looks the user up by username when one is given, otherwise by email.
    pub fn login(
        &self,
        username: Option<&str>,
        email: Option<&str>,
        password: &str,
    ) -> Result<UserAccount, CredentialError> {
        let username = username.map(str::trim).filter(|s| !s.is_empty());
        let email = email.map(str::trim).filter(|s| !s.is_empty());

        let found = match (username, email) {
            (Some(name), _) => self.users.find_user_by_name(name)?,
            (None, Some(email)) => self.users.find_user_by_email(email)?,
            (None, None) => return Err(CredentialError::MissingIdentifier),
        };

        let stored = found
            .as_ref()
            .map_or(&*self.dummy_hash, |user| user.password_hash.as_str());
        self.password_checks.fetch_add(1, Ordering::Relaxed);
        let verified = verify_password(password, stored);

        let Some(user) = found else {
            debug!(?username, ?email, "login for unknown user");
            return Err(CredentialError::InvalidCredentials);
        };
        if !verified {
            debug!(user_id = user.id, "login with wrong password");
            return Err(CredentialError::InvalidCredentials);
        }
        info!(user_id = user.id, "user logged in");
        Ok(user)
    }
}

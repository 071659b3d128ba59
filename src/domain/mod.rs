use serde::{Deserialize, Serialize};

pub type PostId = i64;
pub type UserId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    DuplicatePost { post_id: PostId },
    MissingPost { post_id: PostId },
    MissingUser { user_id: UserId },
    DuplicateUserName { name: String },
    DuplicateEmail { email: String },
    EmptyField { field: &'static str },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicatePost { .. }
            | Self::DuplicateUserName { .. }
            | Self::DuplicateEmail { .. } => "conflict",
            Self::MissingPost { .. } | Self::MissingUser { .. } => "not_found",
            Self::EmptyField { .. } => "invalid_request",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicatePost { post_id } => write!(f, "post already exists: {post_id}"),
            Self::MissingPost { post_id } => write!(f, "post not found: {post_id}"),
            Self::MissingUser { user_id } => write!(f, "user not found: {user_id}"),
            Self::DuplicateUserName { name } => write!(f, "user name already taken: {name}"),
            Self::DuplicateEmail { email } => write!(f, "email already registered: {email}"),
            Self::EmptyField { field } => write!(f, "{field} must not be empty"),
        }
    }
}

impl std::error::Error for DomainError {}

/// A stored post row. Wire names follow the public post API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Post {
    pub id: PostId,
    #[serde(rename = "UserId")]
    pub owner_user_id: UserId,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "created")]
    pub created_at: String,
}

/// Body of `POST /createPost`.
///
/// `id` is caller-chosen when present; when omitted the store allocates the
/// next free id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostInput {
    #[serde(default)]
    pub id: Option<PostId>,
    #[serde(rename = "UserId")]
    pub user_id: UserId,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Description")]
    pub description: String,
}

/// Body of `DELETE /deletePost`. Title and description are accepted but unused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletePostInput {
    pub id: PostId,
    #[serde(rename = "UserId")]
    pub user_id: UserId,
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "Description", default)]
    pub description: String,
}

/// Instruction sent from the post service to the user service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterAdjustment {
    #[serde(rename = "UserID", alias = "UserId")]
    pub user_id: UserId,
    #[serde(rename = "IncPostCount")]
    pub increment: bool,
}

impl CounterAdjustment {
    pub fn increment(user_id: UserId) -> Self {
        Self {
            user_id,
            increment: true,
        }
    }

    pub fn decrement(user_id: UserId) -> Self {
        Self {
            user_id,
            increment: false,
        }
    }

    pub fn delta(&self) -> i64 {
        if self.increment { 1 } else { -1 }
    }
}

/// A user row. `post_count` is denormalized from the post service and may go
/// negative if adjustments arrive out of step with the post store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAccount {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default)]
    pub post_count: i64,
}

pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::EmptyField { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn counter_adjustment_uses_user_service_wire_names() {
        let adj = CounterAdjustment::increment(42);
        assert_eq!(
            serde_json::to_value(adj).unwrap(),
            json!({ "UserID": 42, "IncPostCount": true })
        );

        let parsed: CounterAdjustment =
            serde_json::from_value(json!({ "UserId": 7, "IncPostCount": false })).unwrap();
        assert_eq!(parsed, CounterAdjustment::decrement(7));
        assert_eq!(parsed.delta(), -1);
    }

    #[test]
    fn post_input_requires_owner_title_and_description() {
        let err = serde_json::from_value::<PostInput>(json!({ "id": 1, "UserId": 2 }));
        assert!(err.is_err());

        let input: PostInput = serde_json::from_value(json!({
            "UserId": 2,
            "Title": "t",
            "Description": "d"
        }))
        .unwrap();
        assert_eq!(input.id, None);
    }

    #[test]
    fn delete_input_tolerates_missing_title() {
        let input: DeletePostInput =
            serde_json::from_value(json!({ "id": 100, "UserId": 42 })).unwrap();
        assert_eq!(input.id, 100);
        assert_eq!(input.title, "");
    }

    #[test]
    fn require_non_empty_rejects_whitespace() {
        assert_eq!(
            require_non_empty("username", "  "),
            Err(DomainError::EmptyField { field: "username" })
        );
        assert!(require_non_empty("username", "alice").is_ok());
    }
}

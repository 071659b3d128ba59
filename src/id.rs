use ulid::Ulid;

/// Outbox entry ids double as idempotency keys, so they must be unique per entry.
pub fn new_outbox_id() -> String {
    format!("adj_{}", Ulid::new())
}

pub fn is_outbox_id(s: &str) -> bool {
    s.strip_prefix("adj_")
        .is_some_and(|rest| Ulid::from_string(rest).is_ok())
}

pub mod config;
pub mod counter_sync;
pub mod counter_update;
pub mod credentials;
pub mod domain;
pub mod http;
pub mod id;
pub mod outbox;
pub mod password;
pub mod post_mutation;
pub mod services;
pub mod store;
pub mod version;

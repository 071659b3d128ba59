use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    counter_update::UpdateStrategy, outbox::DispatchSettings, password::HashParams,
    post_mutation::CounterDelivery,
};

pub const DEFAULT_POST_SERVICE_BIND: &str = "127.0.0.1:8002";
pub const DEFAULT_USER_SERVICE_BIND: &str = "127.0.0.1:8000";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "postcount",
    about = "Post and user services sharing a per-user post counter",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve createPost/deletePost and deliver counter adjustments.
    PostService,

    /// Serve updatepost, login and signup.
    UserService,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Listen address. Defaults to 127.0.0.1:8002 for the post service and
    /// 127.0.0.1:8000 for the user service.
    #[arg(long, global = true, env = "POSTCOUNT_BIND", value_name = "ADDR")]
    pub bind: Option<SocketAddr>,

    #[arg(
        long,
        global = true,
        env = "POSTCOUNT_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    /// Bearer token required by the post service. Empty rejects every request.
    #[arg(
        long,
        global = true,
        env = "POSTCOUNT_AUTH_TOKEN",
        value_name = "TOKEN",
        default_value = "",
        hide_env_values = true
    )]
    pub auth_token: String,

    #[arg(
        long,
        global = true,
        env = "POSTCOUNT_USER_SERVICE_URL",
        value_name = "ORIGIN",
        default_value = "http://127.0.0.1:8000"
    )]
    pub user_service_url: String,

    #[arg(
        long = "counter-delivery",
        global = true,
        env = "POSTCOUNT_COUNTER_DELIVERY",
        value_name = "MODE",
        default_value = "outbox",
        value_enum
    )]
    pub counter_delivery: CounterDelivery,

    /// Request timeout for counter adjustments. Unset keeps the client default.
    #[arg(
        long = "counter-sync-timeout-secs",
        global = true,
        env = "POSTCOUNT_COUNTER_SYNC_TIMEOUT_SECS",
        value_name = "SECS",
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub counter_sync_timeout_secs: Option<u64>,

    #[arg(
        long = "counter-update-strategy",
        global = true,
        env = "POSTCOUNT_COUNTER_UPDATE_STRATEGY",
        value_name = "STRATEGY",
        default_value = "atomic",
        value_enum
    )]
    pub counter_update_strategy: UpdateStrategy,

    #[arg(
        long = "outbox-poll-interval-secs",
        global = true,
        env = "POSTCOUNT_OUTBOX_POLL_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub outbox_poll_interval_secs: u64,

    #[arg(
        long = "outbox-max-attempts",
        global = true,
        env = "POSTCOUNT_OUTBOX_MAX_ATTEMPTS",
        value_name = "N",
        default_value_t = 10,
        value_parser = clap::value_parser!(u32).range(1..=1000)
    )]
    pub outbox_max_attempts: u32,

    #[arg(
        long = "outbox-batch-size",
        global = true,
        env = "POSTCOUNT_OUTBOX_BATCH_SIZE",
        value_name = "N",
        default_value_t = 64,
        value_parser = clap::value_parser!(u64).range(1..=1000)
    )]
    pub outbox_batch_size: u64,

    #[arg(
        long = "password-hash-memory-kib",
        global = true,
        env = "POSTCOUNT_PASSWORD_HASH_MEMORY_KIB",
        value_name = "KIB",
        default_value_t = 65_536,
        value_parser = clap::value_parser!(u32).range(8..=1_048_576)
    )]
    pub password_hash_memory_kib: u32,

    #[arg(
        long = "password-hash-iterations",
        global = true,
        env = "POSTCOUNT_PASSWORD_HASH_ITERATIONS",
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..=10)
    )]
    pub password_hash_iterations: u32,
}

impl Config {
    pub fn post_service_bind(&self) -> SocketAddr {
        self.bind.unwrap_or_else(|| default_bind(DEFAULT_POST_SERVICE_BIND))
    }

    pub fn user_service_bind(&self) -> SocketAddr {
        self.bind.unwrap_or_else(|| default_bind(DEFAULT_USER_SERVICE_BIND))
    }

    pub fn counter_sync_timeout(&self) -> Option<Duration> {
        self.counter_sync_timeout_secs.map(Duration::from_secs)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            poll_interval: Duration::from_secs(self.outbox_poll_interval_secs),
            max_attempts: self.outbox_max_attempts,
            batch_size: self.outbox_batch_size as usize,
        }
    }

    pub fn hash_params(&self) -> HashParams {
        HashParams {
            memory_kib: self.password_hash_memory_kib,
            iterations: self.password_hash_iterations,
        }
    }
}

fn default_bind(raw: &str) -> SocketAddr {
    raw.parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)))
}

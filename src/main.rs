use anyhow::Result;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use postcount::config::{Cli, Command, Config};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::PostService => run_post_service(cli.config).await,
        Command::UserService => run_user_service(cli.config).await,
    }
}

async fn run_post_service(config: Config) -> Result<()> {
    let app = postcount::services::post_service(&config)?;
    let bind = config.post_service_bind();
    info!(
        %bind,
        data_dir = %config.data_dir.display(),
        version = postcount::version::VERSION,
        "starting post service"
    );
    let listener = tokio::net::TcpListener::bind(bind).await?;
    postcount::services::serve(listener, app, shutdown_signal()).await
}

async fn run_user_service(config: Config) -> Result<()> {
    let app = postcount::services::user_service(&config)?;
    let bind = config.user_service_bind();
    info!(
        %bind,
        data_dir = %config.data_dir.display(),
        version = postcount::version::VERSION,
        "starting user service"
    );
    let listener = tokio::net::TcpListener::bind(bind).await?;
    postcount::services::serve(listener, app, shutdown_signal()).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

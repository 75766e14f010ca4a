use std::sync::Arc;

use anyhow::Context;
use dirsync_server::config::ServerConfig;
use dirsync_server::context::ServerContext;
use dirsync_server::dispatcher::Dispatcher;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dirsync_server=info".into()),
        )
        .with_target(false)
        .init();

    if std::env::args().skip(1).any(|arg| arg == "--help" || arg == "-h") {
        println!("Usage: dirsync-server");
        println!("  Configured through DIRSYNC_* environment variables (see .env)");
        return Ok(());
    }

    let config = ServerConfig::from_env()?;
    let ctx = Arc::new(ServerContext::bootstrap(&config).await?);
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(
        bind = %config.bind,
        storage_root = %ctx.storage.root().display(),
        "server listening"
    );

    let serve = dirsync_server::server::serve(listener, Arc::clone(&ctx), Arc::new(Dispatcher::default()));
    tokio::select! {
        res = serve => res.context("accept loop failed")?,
        res = tokio::signal::ctrl_c() => {
            res.context("failed waiting for shutdown signal")?;
            tracing::info!("shutting down");
        }
    }
    ctx.store.close().await;
    Ok(())
}

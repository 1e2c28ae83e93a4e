//! Siren Web 服务
//!
//! 启动: cargo run --bin siren-web --features web
//! 示例: curl -XPOST localhost:8080/chat -H 'content-type: application/json' -d '{"message":"I need an ambulance"}'

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use siren::agent::create_agent_components;
use siren::config::load_config_or_default;
use siren::http::{router, AppState};
use siren::observability;
use siren::session::SnapshotFile;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config_or_default(std::env::args().nth(1).map(Into::into));
    let components = Arc::new(create_agent_components(&cfg));

    let snapshot = cfg.session.snapshot_path.as_ref().map(SnapshotFile::new);
    if let Some(ref file) = snapshot {
        let sessions = file
            .load()
            .with_context(|| format!("failed to load snapshot {}", file.path().display()))?;
        let restored = components.sessions.restore(sessions).await;
        tracing::info!(restored, path = %file.path().display(), "sessions restored");
    }

    let shutdown = CancellationToken::new();
    let sweeper = components.sessions.spawn_sweeper(
        Duration::from_secs(cfg.session.sweep_interval_secs.max(1)),
        shutdown.clone(),
    );

    let app = router(AppState::new(Arc::clone(&components)));
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind))?;
    tracing::info!("Siren Web: http://{}", cfg.app.bind);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = sweeper.await;

    if let Some(ref file) = snapshot {
        let sessions = components.sessions.export().await;
        file.save(&sessions)
            .with_context(|| format!("failed to save snapshot {}", file.path().display()))?;
        tracing::info!(saved = sessions.len(), "sessions saved");
    }
    Ok(())
}

mod config;
mod exec;
mod frame;
mod router;
mod routes;
mod services;
mod state;
mod topic;

use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = config::Config::from_env().expect("invalid configuration");
    let port = config.port;

    let directory = Arc::new(services::directory::InMemoryDirectory::new(config.default_language.clone()));
    let backend = Arc::new(exec::ProcessBackend::new(config.exec.clone()));
    let state = state::AppState::new(config, directory, backend);

    // Spawn background sweep and flush tasks.
    let maintenance = services::maintenance::spawn_maintenance_tasks(&state);

    let app = routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "codecollab listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    maintenance.shutdown(&state).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

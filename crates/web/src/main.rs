use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use prdeploy_core::config::Config;
use prdeploy_github::CredentialProvider;
use prdeploy_notify::Notifier;
use prdeploy_runner::ActionRunner;
use prdeploy_web::{app, shutdown_signal, AppState};
use tokio::net::TcpListener;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = Arc::new(Config::from_env().expect("Failed to load configuration"));
    let credentials = Arc::new(
        CredentialProvider::from_config(&config.github)
            .expect("Failed to load GitHub App credentials"),
    );
    let notifier =
        Arc::new(Notifier::from_config(&config).expect("Failed to create mail transport"));
    let runner = Arc::new(ActionRunner::new(config.actions.clone()));

    let port = config.server.port;
    let state = AppState { config, credentials, runner, notifier };
    let router = app(state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("bind error");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    tracing::info!("Shut down gracefully");
}

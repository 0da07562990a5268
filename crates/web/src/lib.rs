pub mod handlers;

use std::{sync::Arc, time::Duration};

use axum::{
    extract::FromRef,
    http::header,
    routing::post,
    Router,
};
use prdeploy_core::config::Config;
use prdeploy_github::CredentialProvider;
use prdeploy_notify::Notifier;
use prdeploy_runner::ActionRunner;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialProvider>,
    pub runner: Arc<ActionRunner>,
    pub notifier: Arc<Notifier>,
}

pub fn app(state: AppState) -> Router {
    // Leave headroom over the action timeout so a slow script doesn't get
    // its request cut off mid-flight.
    let request_timeout = state.config.actions.timeout + Duration::from_secs(60);
    let sensitive_headers: Arc<[_]> = vec![header::AUTHORIZATION].into();
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::new(request_timeout));
    Router::new().route("/webhook", post(handlers::webhook)).with_state(state).layer(middleware)
}

pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("Failed to install ctrl-c handler");
    }
}

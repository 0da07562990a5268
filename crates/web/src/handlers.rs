use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use prdeploy_github::webhook::{GitHubEvent, PullRequestAction, PullRequestEvent};
use prdeploy_notify::CommentTarget;
use prdeploy_runner::ActionKind;
use serde_json::json;

use crate::AppState;

/// Webhook dispatcher. Verification happens in the `GitHubEvent` extractor;
/// this handler classifies the event, drives the deploy or cleanup flow,
/// and converts any failure into a terminal 500 with a generic body.
pub async fn webhook(
    State(state): State<AppState>,
    GitHubEvent { payload, delivery }: GitHubEvent,
) -> Response {
    let Some(event) = payload.pull_request_event() else {
        return message_response(StatusCode::OK, "No action taken");
    };
    tracing::info!(
        "Received pull request event {:?} for {}#{} (branch {})",
        event.action,
        event.repo,
        event.number,
        event.branch
    );
    match event.action {
        PullRequestAction::Opened | PullRequestAction::Synchronize | PullRequestAction::Reopened => {
            match deploy(&state, &event, delivery.as_deref()).await {
                Ok(()) => message_response(StatusCode::OK, "Deployment processed"),
                Err(e) => {
                    tracing::error!("Deployment failed: {e:?}");
                    message_response(StatusCode::INTERNAL_SERVER_ERROR, "Deployment failed")
                }
            }
        }
        // Cleanup runs regardless of merge status
        PullRequestAction::Closed => match cleanup(&state, &event, delivery.as_deref()).await {
            Ok(()) => message_response(StatusCode::OK, "Cleanup processed"),
            Err(e) => {
                tracing::error!("Cleanup failed: {e:?}");
                message_response(StatusCode::INTERNAL_SERVER_ERROR, "Cleanup failed")
            }
        },
        PullRequestAction::Other => message_response(StatusCode::OK, "No action taken"),
    }
}

fn message_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

async fn deploy(state: &AppState, event: &PullRequestEvent, delivery: Option<&str>) -> Result<()> {
    let token = state.credentials.installation_token(event.installation_id).await?;
    let target = CommentTarget { repo: event.repo.clone(), pr_number: event.number };

    state
        .notifier
        .post_comment(&target, "Deployment started for this pull request.", &token, None)
        .await;

    let result = state
        .runner
        .run(
            ActionKind::Deploy,
            &event.branch,
            event.number,
            delivery,
            &state.notifier,
            &token,
            &target,
        )
        .await?;

    // The outcome notice keys on whether a deployment URL was extracted,
    // not on the exit status.
    let message = match &result.deployment_url {
        Some(url) => format!("Deployment successful. [Deployed application]({url})."),
        None => "Deployment failed. Please check the logs.".to_string(),
    };
    state.notifier.post_comment(&target, &message, &token, None).await;

    state
        .notifier
        .send_log("Deployment Log", "Please find the attached deployment log.", &result.log_path)
        .await?;
    Ok(())
}

async fn cleanup(state: &AppState, event: &PullRequestEvent, delivery: Option<&str>) -> Result<()> {
    // The token is acquired up front so the runner can post its step table.
    let token = state.credentials.installation_token(event.installation_id).await?;
    let target = CommentTarget { repo: event.repo.clone(), pr_number: event.number };

    let result = state
        .runner
        .run(
            ActionKind::Cleanup,
            &event.branch,
            event.number,
            delivery,
            &state.notifier,
            &token,
            &target,
        )
        .await?;

    state
        .notifier
        .post_comment(&target, "Cleanup completed for this pull request.", &token, None)
        .await;

    state
        .notifier
        .send_log("Cleanup Log", "Please find the attached cleanup log.", &result.log_path)
        .await?;
    Ok(())
}

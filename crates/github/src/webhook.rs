use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hmac::{Hmac, Mac};
use prdeploy_core::config::Config;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

/// Verify an `X-Hub-Signature-256` header (`sha256=<hex>`) against the raw
/// request body. Comparison is constant time via `Mac::verify_slice`.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(signature) = header.and_then(|value| value.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature) else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// The subset of GitHub's pull-request webhook schema this service reads.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub pull_request: Option<PullRequestPayload>,
    #[serde(default)]
    pub repository: Option<RepositoryPayload>,
    #[serde(default)]
    pub installation: Option<InstallationPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestPayload {
    pub number: u64,
    pub head: HeadRef,
    #[serde(default)]
    pub merged: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadRef {
    #[serde(rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryPayload {
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallationPayload {
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullRequestAction {
    Opened,
    Synchronize,
    Reopened,
    Closed,
    Other,
}

impl From<&str> for PullRequestAction {
    fn from(value: &str) -> Self {
        match value {
            "opened" => PullRequestAction::Opened,
            "synchronize" => PullRequestAction::Synchronize,
            "reopened" => PullRequestAction::Reopened,
            "closed" => PullRequestAction::Closed,
            _ => PullRequestAction::Other,
        }
    }
}

/// A classified pull-request lifecycle event. Constructed once per request,
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct PullRequestEvent {
    pub action: PullRequestAction,
    pub number: u64,
    pub repo: String,
    pub branch: String,
    pub installation_id: u64,
    pub merged: bool,
}

impl WebhookPayload {
    /// Classify the payload. Events without a `pull_request` object (or
    /// without a repository or installation) are not for us.
    pub fn pull_request_event(&self) -> Option<PullRequestEvent> {
        let pull_request = self.pull_request.as_ref()?;
        let repository = self.repository.as_ref()?;
        let installation = self.installation.as_ref()?;
        Some(PullRequestEvent {
            action: self
                .action
                .as_deref()
                .map(PullRequestAction::from)
                .unwrap_or(PullRequestAction::Other),
            number: pull_request.number,
            repo: repository.full_name.clone(),
            branch: pull_request.head.git_ref.clone(),
            installation_id: installation.id,
            merged: pull_request.merged.unwrap_or(false),
        })
    }
}

/// Verify and extract a GitHub event payload.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub payload: WebhookPayload,
    /// `X-GitHub-Delivery` id, used to disambiguate log artifacts.
    pub delivery: Option<String>,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let config = <Arc<Config>>::from_ref(state);
        let delivery = req
            .headers()
            .get("X-GitHub-Delivery")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let signature = req
            .headers()
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = Bytes::from_request(req, state).await.map_err(|_| {
            tracing::error!("Failed to read webhook body");
            (StatusCode::BAD_REQUEST, "error reading body").into_response()
        })?;
        if !verify_signature(&config.github.webhook_secret, &body, signature.as_deref()) {
            tracing::warn!("Rejected webhook delivery: invalid signature");
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "message": "Invalid signature" })),
            )
                .into_response());
        }
        let payload: WebhookPayload = serde_json::from_slice(&body).map_err(|e| {
            tracing::error!("Failed to parse webhook payload: {e}");
            (StatusCode::BAD_REQUEST, "error parsing body").into_response()
        })?;
        Ok(GitHubEvent { payload, delivery })
    }
}

#[cfg(test)]
mod tests {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    use super::{verify_signature, PullRequestAction, WebhookPayload};

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signature_round_trip() {
        let body = br#"{"action":"opened"}"#;
        let header = sign("s3cr3t", body);
        assert!(verify_signature("s3cr3t", body, Some(&header)));
    }

    #[test]
    fn test_verify_signature_rejects_tampering() {
        let body = br#"{"action":"opened"}"#.to_vec();
        let header = sign("s3cr3t", &body);
        // Flip one bit in the body
        let mut tampered = body.clone();
        tampered[0] ^= 1;
        assert!(!verify_signature("s3cr3t", &tampered, Some(&header)));
        // Flip one nibble in the signature
        let mut bad_header = header.clone();
        let last = bad_header.pop().unwrap();
        bad_header.push(if last == '0' { '1' } else { '0' });
        assert!(!verify_signature("s3cr3t", &body, Some(&bad_header)));
        // Wrong secret
        assert!(!verify_signature("other", &body, Some(&header)));
    }

    #[test]
    fn test_verify_signature_rejects_missing_or_malformed_header() {
        let body = b"payload";
        assert!(!verify_signature("s3cr3t", body, None));
        assert!(!verify_signature("s3cr3t", body, Some("sha1=abcdef")));
        assert!(!verify_signature("s3cr3t", body, Some("sha256=nothex")));
    }

    #[test]
    fn test_classify_pull_request_event() {
        let payload: WebhookPayload = serde_json::from_str(
            r#"{
                "action": "opened",
                "pull_request": { "number": 42, "head": { "ref": "feature-x" }, "merged": false },
                "repository": { "full_name": "org/app" },
                "installation": { "id": 7 }
            }"#,
        )
        .unwrap();
        let event = payload.pull_request_event().unwrap();
        assert_eq!(event.action, PullRequestAction::Opened);
        assert_eq!(event.number, 42);
        assert_eq!(event.repo, "org/app");
        assert_eq!(event.branch, "feature-x");
        assert_eq!(event.installation_id, 7);
        assert!(!event.merged);
    }

    #[test]
    fn test_classify_ignores_non_pull_request_payloads() {
        let payload: WebhookPayload =
            serde_json::from_str(r#"{ "action": "created", "comment": { "id": 1 } }"#).unwrap();
        assert!(payload.pull_request_event().is_none());
    }

    #[test]
    fn test_unrecognized_action_maps_to_other() {
        assert_eq!(PullRequestAction::from("labeled"), PullRequestAction::Other);
        assert_eq!(PullRequestAction::from("closed"), PullRequestAction::Closed);
    }
}

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{Context, Result};
use prdeploy_core::{
    config::ActionConfig,
    models::{StepReport, StepStatus},
};
use prdeploy_github::InstallationToken;
use prdeploy_notify::{CommentTarget, Notifier};
use regex::Regex;
use tokio::{process::Command, time::timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Deploy,
    Cleanup,
}

impl ActionKind {
    fn log_prefix(&self) -> &'static str {
        match self {
            ActionKind::Deploy => "deployment",
            ActionKind::Cleanup => "cleanup",
        }
    }

    fn step_label(&self) -> &'static str {
        match self {
            ActionKind::Deploy => "Deployment script",
            ActionKind::Cleanup => "Cleanup script",
        }
    }

    fn report_heading(&self) -> &'static str {
        match self {
            ActionKind::Deploy => "Deployment process details:",
            ActionKind::Cleanup => "Cleanup process details:",
        }
    }

    fn script<'a>(&self, config: &'a ActionConfig) -> &'a Path {
        match self {
            ActionKind::Deploy => &config.deploy_script,
            ActionKind::Cleanup => &config.cleanup_script,
        }
    }
}

/// Outcome of one external action invocation. The log file survives as a
/// filesystem side-effect and is always present, success or failure, so the
/// caller can attach it to an email.
#[derive(Debug)]
pub struct ActionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub container_name: Option<String>,
    pub deployment_url: Option<String>,
    pub log_path: PathBuf,
}

/// Invokes the external deploy/cleanup script for a branch and PR, captures
/// its output into a log artifact, and posts a step table to the PR.
pub struct ActionRunner {
    config: ActionConfig,
}

impl ActionRunner {
    pub fn new(config: ActionConfig) -> Self {
        Self { config }
    }

    /// Run one action synchronously (bounded by the configured timeout).
    ///
    /// A non-zero exit, spawn failure, or timeout yields a failed
    /// `ActionResult`, not an error; only filesystem problems (log dir or
    /// log file) propagate. The step report is posted through the notifier
    /// before returning; a reporting failure never masks the action result.
    pub async fn run(
        &self,
        kind: ActionKind,
        branch: &str,
        pr_number: u64,
        delivery: Option<&str>,
        notifier: &Notifier,
        token: &InstallationToken,
        target: &CommentTarget,
    ) -> Result<ActionResult> {
        let log_path = self.log_path(kind, branch, pr_number, delivery);
        tokio::fs::create_dir_all(&self.config.log_dir).await.with_context(|| {
            format!("Failed to create log directory {}", self.config.log_dir.display())
        })?;

        let script = kind.script(&self.config);
        tracing::info!(
            "Running {} script {} for branch {branch} (PR #{pr_number})",
            kind.log_prefix(),
            script.display()
        );
        let mut command = Command::new(script);
        command.arg(branch).arg(pr_number.to_string()).kill_on_drop(true);

        let (success, stdout, stderr) = match timeout(self.config.timeout, command.output()).await
        {
            Ok(Ok(output)) => (
                output.status.success(),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ),
            Ok(Err(e)) => (
                false,
                String::new(),
                format!("Failed to start {} script: {e}", kind.log_prefix()),
            ),
            Err(_) => (
                false,
                String::new(),
                format!(
                    "{} timed out after {}s",
                    kind.step_label(),
                    self.config.timeout.as_secs()
                ),
            ),
        };

        let mut result = ActionResult {
            success,
            stdout,
            stderr,
            container_name: None,
            deployment_url: None,
            log_path,
        };

        let mut report = StepReport::new();
        if result.success {
            tokio::fs::write(&result.log_path, &result.stdout).await.with_context(|| {
                format!("Failed to write log file {}", result.log_path.display())
            })?;
            match kind {
                ActionKind::Deploy => {
                    result.container_name = extract_container_name(&result.stdout);
                    result.deployment_url = extract_deployment_url(&result.stdout);
                    // The milestone messages claim success narratively even
                    // when pattern extraction found nothing. Long-standing
                    // behavior, kept until product signs off on a change.
                    let container = result.container_name.as_deref().unwrap_or("unknown");
                    let url = result.deployment_url.as_deref().unwrap_or("unknown");
                    report.push(
                        "Clone repository",
                        StepStatus::Success,
                        "Repository cloned successfully.",
                    );
                    report.push(
                        "Checkout branch",
                        StepStatus::Success,
                        format!("Checked out branch {branch}."),
                    );
                    report.push(
                        "Pull latest changes",
                        StepStatus::Success,
                        format!("Pulled latest changes for branch {branch}."),
                    );
                    report.push(
                        "Build Docker image",
                        StepStatus::Success,
                        format!("Docker image built successfully for container {container}."),
                    );
                    report.push(
                        "Run Docker container",
                        StepStatus::Success,
                        format!("Container {container} running at {url}."),
                    );
                }
                ActionKind::Cleanup => {
                    report.push(
                        kind.step_label(),
                        StepStatus::Success,
                        "Cleanup script executed successfully.",
                    );
                }
            }
        } else {
            let error_text =
                format!("{} failed with error: {}", kind.step_label(), result.stderr);
            tracing::error!("{error_text}");
            tokio::fs::write(&result.log_path, &error_text).await.with_context(|| {
                format!("Failed to write log file {}", result.log_path.display())
            })?;
            report.push(kind.step_label(), StepStatus::Failed, result.stderr.clone());
        }

        // Reporting is part of the action; its failure modes are already
        // swallowed inside post_comment and cannot mask the result.
        notifier.post_comment(target, kind.report_heading(), token, Some(&report)).await;

        Ok(result)
    }

    fn log_path(
        &self,
        kind: ActionKind,
        branch: &str,
        pr_number: u64,
        delivery: Option<&str>,
    ) -> PathBuf {
        // The delivery id keeps concurrent deliveries for the same branch
        // from racing on one file.
        let name = match delivery {
            Some(id) => format!(
                "{}_log_{}_{}_{}.txt",
                kind.log_prefix(),
                sanitize(branch),
                pr_number,
                sanitize(id)
            ),
            None => format!("{}_log_{}_{}.txt", kind.log_prefix(), sanitize(branch), pr_number),
        };
        self.config.log_dir.join(name)
    }
}

/// Make a branch name or delivery id safe for use in a file name.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '-' })
        .collect()
}

fn extract_container_name(stdout: &str) -> Option<String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(r"Container name: ([^\s]+)").unwrap())
        .captures(stdout)
        .map(|caps| caps[1].to_string())
}

fn extract_deployment_url(stdout: &str) -> Option<String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(r"Deployment complete: (http://[^\s]+)").unwrap())
        .captures(stdout)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use std::{
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    };

    use async_trait::async_trait;
    use httpmock::{Method::POST, MockServer};
    use prdeploy_core::config::{ActionConfig, GitHubConfig, MailConfig};
    use prdeploy_github::InstallationToken;
    use prdeploy_notify::{CommentTarget, MailTransport, Notifier};

    use super::{
        extract_container_name, extract_deployment_url, sanitize, ActionKind, ActionRunner,
    };

    struct NullTransport;

    #[async_trait]
    impl MailTransport for NullTransport {
        async fn deliver(&self, _message: lettre::Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_setup(dir: &Path, api_base: String) -> (ActionRunner, Notifier) {
        let config = ActionConfig {
            deploy_script: dir.join("deploy.sh"),
            cleanup_script: dir.join("cleanup.sh"),
            log_dir: dir.join("logs"),
            timeout: Duration::from_secs(5),
        };
        let github = GitHubConfig {
            app_id: 1,
            private_key_path: "/dev/null".into(),
            webhook_secret: "s3cr3t".into(),
            api_base,
        };
        let mail = MailConfig {
            smtp_server: "localhost".into(),
            smtp_port: 587,
            smtp_username: "bot@example.com".into(),
            smtp_password: "hunter2".into(),
            recipient: "ops@example.com".into(),
        };
        let notifier = Notifier::new(&github, &mail, Arc::new(NullTransport));
        (ActionRunner::new(config), notifier)
    }

    fn target() -> CommentTarget {
        CommentTarget { repo: "org/app".into(), pr_number: 42 }
    }

    #[test]
    fn test_extract_patterns() {
        let stdout = "building...\nContainer name: app-42\nDeployment complete: http://host:8042\n";
        assert_eq!(extract_container_name(stdout).as_deref(), Some("app-42"));
        assert_eq!(extract_deployment_url(stdout).as_deref(), Some("http://host:8042"));
        assert_eq!(extract_container_name("no markers here"), None);
        assert_eq!(extract_deployment_url("Deployment complete: https://host"), None);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("feature/login v2"), "feature-login-v2");
        assert_eq!(sanitize("release-1.2_rc"), "release-1.2_rc");
    }

    #[tokio::test]
    async fn test_deploy_success_posts_five_step_table() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "deploy.sh",
            "#!/bin/sh\necho \"Container name: app-42\"\necho \"Deployment complete: http://host:8042\"\n",
        );
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/repos/org/app/issues/42/comments")
                    .body_contains("Deployment process details:")
                    .body_contains("| Clone repository | Success | Repository cloned successfully. |")
                    .body_contains("| Checkout branch | Success | Checked out branch feature-x. |")
                    .body_contains(
                        "| Pull latest changes | Success | Pulled latest changes for branch feature-x. |",
                    )
                    .body_contains(
                        "| Build Docker image | Success | Docker image built successfully for container app-42. |",
                    )
                    .body_contains(
                        "| Run Docker container | Success | Container app-42 running at http://host:8042. |",
                    );
                then.status(201).json_body(serde_json::json!({ "id": 1 }));
            })
            .await;
        let (runner, notifier) = test_setup(dir.path(), server.base_url());
        let result = runner
            .run(
                ActionKind::Deploy,
                "feature-x",
                42,
                Some("d-1"),
                &notifier,
                &InstallationToken::new("ghs_test"),
                &target(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.container_name.as_deref(), Some("app-42"));
        assert_eq!(result.deployment_url.as_deref(), Some("http://host:8042"));
        assert_eq!(
            result.log_path.file_name().unwrap().to_str().unwrap(),
            "deployment_log_feature-x_42_d-1.txt"
        );
        let log = std::fs::read_to_string(&result.log_path).unwrap();
        assert!(log.contains("Container name: app-42"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deploy_success_without_patterns_still_claims_success() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "#!/bin/sh\necho \"nothing to see\"\n");
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/repos/org/app/issues/42/comments")
                    .body_contains("| Run Docker container | Success | Container unknown running at unknown. |");
                then.status(201).json_body(serde_json::json!({ "id": 1 }));
            })
            .await;
        let (runner, notifier) = test_setup(dir.path(), server.base_url());
        let result = runner
            .run(
                ActionKind::Deploy,
                "feature-x",
                42,
                None,
                &notifier,
                &InstallationToken::new("ghs_test"),
                &target(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.container_name, None);
        assert_eq!(result.deployment_url, None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_deploy_failure_posts_single_failed_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "#!/bin/sh\necho \"boom\" >&2\nexit 1\n");
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/repos/org/app/issues/42/comments")
                    .body_contains("| Deployment script | Failed | boom");
                then.status(201).json_body(serde_json::json!({ "id": 1 }));
            })
            .await;
        let (runner, notifier) = test_setup(dir.path(), server.base_url());
        let result = runner
            .run(
                ActionKind::Deploy,
                "feature-x",
                42,
                None,
                &notifier,
                &InstallationToken::new("ghs_test"),
                &target(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.container_name, None);
        assert_eq!(result.deployment_url, None);
        // Log artifact still exists for the email attachment
        let log = std::fs::read_to_string(&result.log_path).unwrap();
        assert!(log.contains("Deployment script failed with error: boom"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_timeout_is_a_failed_action() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "deploy.sh", "#!/bin/sh\nsleep 30\n");
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/repos/org/app/issues/42/comments");
                then.status(201).json_body(serde_json::json!({ "id": 1 }));
            })
            .await;
        let (mut runner, notifier) = test_setup(dir.path(), server.base_url());
        runner.config.timeout = Duration::from_millis(200);
        let result = runner
            .run(
                ActionKind::Deploy,
                "feature-x",
                42,
                None,
                &notifier,
                &InstallationToken::new("ghs_test"),
                &target(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cleanup_posts_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "cleanup.sh", "#!/bin/sh\necho \"torn down\"\n");
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/repos/org/app/issues/42/comments")
                    .body_contains("Cleanup process details:")
                    .body_contains("| Cleanup script | Success | Cleanup script executed successfully. |");
                then.status(201).json_body(serde_json::json!({ "id": 1 }));
            })
            .await;
        let (runner, notifier) = test_setup(dir.path(), server.base_url());
        let result = runner
            .run(
                ActionKind::Cleanup,
                "feature-x",
                42,
                None,
                &notifier,
                &InstallationToken::new("ghs_test"),
                &target(),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(
            result.log_path.file_name().unwrap().to_str().unwrap(),
            "cleanup_log_feature-x_42.txt"
        );
        mock.assert_async().await;
    }
}

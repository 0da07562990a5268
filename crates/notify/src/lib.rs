use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use prdeploy_core::{
    config::{Config, GitHubConfig, MailConfig},
    models::StepReport,
};
use prdeploy_github::{InstallationToken, ACCEPT_GITHUB_JSON, USER_AGENT};
use reqwest::{header, StatusCode};
use serde_json::json;

/// The pull-request discussion thread a comment is posted to.
#[derive(Debug, Clone)]
pub struct CommentTarget {
    pub repo: String,
    pub pr_number: u64,
}

/// Mail delivery seam. The production implementation speaks SMTP; tests
/// substitute a recording transport.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: Message) -> Result<()>;
}

pub struct SmtpMailTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailTransport {
    /// STARTTLS relay with credentials, per the configured mail host.
    pub fn from_config(config: &MailConfig) -> Result<Self> {
        let credentials =
            Credentials::new(config.smtp_username.clone(), config.smtp_password.clone());
        let inner = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
            .context("Failed to create SMTP transport")?
            .port(config.smtp_port)
            .credentials(credentials)
            .build();
        Ok(Self { inner })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn deliver(&self, message: Message) -> Result<()> {
        self.inner.send(message).await.context("Failed to send email via SMTP")?;
        Ok(())
    }
}

/// Posts human-readable status to pull requests and delivers log artifacts
/// by email.
pub struct Notifier {
    api_base: String,
    http: reqwest::Client,
    mail: MailConfig,
    transport: Arc<dyn MailTransport>,
}

impl Notifier {
    pub fn new(
        github: &GitHubConfig,
        mail: &MailConfig,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            api_base: github.api_base.clone(),
            http: reqwest::Client::new(),
            mail: mail.clone(),
            transport,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = Arc::new(SmtpMailTransport::from_config(&config.mail)?);
        Ok(Self::new(&config.github, &config.mail, transport))
    }

    /// Post a comment on the pull request's discussion thread, optionally
    /// appending a step table. Comment delivery failure is non-fatal: any
    /// error is logged at warn and swallowed.
    pub async fn post_comment(
        &self,
        target: &CommentTarget,
        message: &str,
        token: &InstallationToken,
        details: Option<&StepReport>,
    ) {
        let mut body = message.to_string();
        if let Some(report) = details {
            body.push_str("\n\n");
            body.push_str(&report.to_markdown());
        }
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_base, target.repo, target.pr_number
        );
        let result = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, format!("token {}", token.as_str()))
            .header(header::ACCEPT, ACCEPT_GITHUB_JSON)
            .header(header::USER_AGENT, USER_AGENT)
            .json(&json!({ "body": body }))
            .send()
            .await;
        match result {
            Ok(response) if response.status() == StatusCode::CREATED => {}
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                tracing::warn!(
                    "Failed to comment on {}#{}: {status} {text}",
                    target.repo,
                    target.pr_number
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to comment on {}#{}: {e}",
                    target.repo,
                    target.pr_number
                );
            }
        }
    }

    /// Email a log file to the configured recipient: plain-text body plus
    /// the file as a base64 binary attachment. Failure here propagates;
    /// mail delivery is fatal to the enclosing flow.
    pub async fn send_log(&self, subject: &str, body: &str, attachment_path: &Path) -> Result<()> {
        let from: Mailbox =
            self.mail.smtp_username.parse().context("Invalid sender email address")?;
        let to: Mailbox = self.mail.recipient.parse().context("Invalid recipient email address")?;
        let filename = attachment_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("log.txt")
            .to_string();
        let content = tokio::fs::read(attachment_path).await.with_context(|| {
            format!("Failed to read log file {}", attachment_path.display())
        })?;
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .multipart(
                MultiPart::mixed()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(body.to_string()),
                    )
                    .singlepart(Attachment::new(filename).body(
                        content,
                        ContentType::parse("application/octet-stream")
                            .expect("static content type"),
                    )),
            )
            .context("Failed to build email message")?;
        self.transport.deliver(message).await
    }
}

//! Outbound feedback via the WhatsApp bridge send API
//!
//! The bridge exposes a small REST surface: `POST /api/send` with an
//! optional `reply_to` message id for threaded replies. The notifier routes
//! by project name through the configured table; there is no default
//! destination, so a missing route is a hard error rather than a message in
//! the wrong group. A failed threaded reply falls back exactly once to a
//! plain group post with the same content.

use crate::config::Config;
use crate::{Error, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct SendResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// REST client for the bridge's send endpoints.
pub struct BridgeClient {
    http: reqwest::Client,
    base_url: String,
}

impl BridgeClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Plain group post.
    pub async fn send(&self, recipient: &str, message: &str) -> Result<()> {
        self.post(json!({ "recipient": recipient, "message": message }))
            .await
    }

    /// Threaded reply to an earlier message.
    pub async fn send_reply(&self, recipient: &str, message: &str, reply_to: &str) -> Result<()> {
        self.post(json!({
            "recipient": recipient,
            "message": message,
            "reply_to": reply_to,
        }))
        .await
    }

    async fn post(&self, body: serde_json::Value) -> Result<()> {
        let url = format!("{}/api/send", self.base_url);
        let response = self.http.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            return Err(Error::Send(format!("bridge returned {}", response.status())));
        }
        let parsed: SendResponse = response.json().await?;
        if !parsed.success {
            return Err(Error::Send(
                parsed.message.unwrap_or_else(|| "unknown bridge error".to_string()),
            ));
        }
        Ok(())
    }
}

/// What became of a feedback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendDisposition {
    Sent,
    /// Dry run: the intended send was logged only.
    Previewed,
    /// Project routing entry exists but is disabled.
    SkippedDisabled,
}

/// Seam over the outbound side: feedback logic is tested against an
/// in-memory sender, the binaries plug in the bridge-backed [`Notifier`].
#[allow(async_fn_in_trait)]
pub trait FeedbackSender {
    /// Deliver `text` to the project's group, threading onto `reply_to`
    /// when available.
    async fn send_feedback(
        &self,
        project: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SendDisposition>;
}

/// Routes feedback messages into the right project group.
pub struct Notifier<'a> {
    client: BridgeClient,
    config: &'a Config,
    dry_run: bool,
}

impl<'a> Notifier<'a> {
    pub fn new(config: &'a Config, dry_run: bool) -> Result<Self> {
        Ok(Self {
            client: BridgeClient::new(&config.bridge_url)?,
            config,
            dry_run,
        })
    }
}

impl FeedbackSender for Notifier<'_> {
    /// On a failed threaded send, falls back once to a plain post (the
    /// fallback replaces the attempt; the notification is never dropped
    /// silently and never doubled).
    async fn send_feedback(
        &self,
        project: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<SendDisposition> {
        let route = self.config.project(project)?;
        if !route.enabled {
            warn!("Project {} is disabled; not sending feedback", project);
            return Ok(SendDisposition::SkippedDisabled);
        }

        if self.dry_run {
            info!(
                "DRY RUN: would send to {} ({}): {}",
                route.group_name, route.group_jid, text
            );
            return Ok(SendDisposition::Previewed);
        }

        if let Some(reply_id) = reply_to {
            match self.client.send_reply(&route.group_jid, text, reply_id).await {
                Ok(()) => {
                    info!("Reply sent to {}", route.group_name);
                    return Ok(SendDisposition::Sent);
                }
                Err(e) => {
                    warn!(
                        "Threaded reply to {} failed ({}), falling back to group post",
                        route.group_name, e
                    );
                }
            }
        }

        self.client.send(&route.group_jid, text).await?;
        info!("Feedback sent to {}", route.group_name);
        Ok(SendDisposition::Sent)
    }
}

/// Feedback message listing the checklist steps still outstanding.
pub fn format_feedback_message(
    drop_number: &str,
    missing_steps: &[&str],
    project: &str,
    agent: &str,
) -> String {
    let mut message = format!(
        "QA REVIEW INCOMPLETE - {drop_number}\n\n\
         The following photos/steps need to be updated in 1MAP:\n\n"
    );
    for step in missing_steps {
        message.push_str(&format!("- {step}\n"));
    }
    let agent = if agent.is_empty() { "Not specified" } else { agent };
    message.push_str(&format!(
        "\nProject: {project}\nAssigned Agent: {agent}\n\n\
         Please update the missing photos in 1MAP and resubmit.\n\
         Once updated, the QA team will re-review the installation."
    ));
    message
}

/// Note appended to installation and review records on resubmission.
pub fn format_resubmission_note(contractor: &str, message_content: &str) -> String {
    let excerpt: String = message_content.chars().take(100).collect();
    format!("Photos updated by {contractor} in 1MAP.\nMessage: {excerpt}")
}

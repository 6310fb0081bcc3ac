//! Terminal-event notifications.
//!
//! The `stdout` channel is product output, independent of the tracing
//! subscriber. `slack` posts to an incoming webhook and `github` comments on
//! the current pull request through the `gh` CLI. Delivery failures are
//! reported to the caller, which logs them and carries on; a notifier never
//! changes a pipeline verdict.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::core::policy::Notifications;
use crate::io::process::run_with_timeout;

const SLACK_TIMEOUT: Duration = Duration::from_secs(10);
const GH_TIMEOUT: Duration = Duration::from_secs(30);
const GH_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyEvent {
    Deploy,
    Block,
    Notify,
    Rollback,
}

impl NotifyEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyEvent::Deploy => "deploy",
            NotifyEvent::Block => "block",
            NotifyEvent::Notify => "notify",
            NotifyEvent::Rollback => "rollback",
        }
    }

    fn severity(self) -> &'static str {
        match self {
            NotifyEvent::Deploy => "info",
            NotifyEvent::Notify => "warning",
            NotifyEvent::Rollback => "error",
            NotifyEvent::Block => "critical",
        }
    }
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra key/value details attached to a notification.
pub type NotifyContext = BTreeMap<String, String>;

pub trait Notifier: Send + Sync {
    fn notify(&self, event: NotifyEvent, message: &str, context: &NotifyContext) -> Result<()>;
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
    fn notify(&self, event: NotifyEvent, message: &str, context: &NotifyContext) -> Result<()> {
        (**self).notify(event, message, context)
    }
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: NotifyEvent, _message: &str, _context: &NotifyContext) -> Result<()> {
        Ok(())
    }
}

/// Prints one line per notification to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutNotifier;

impl Notifier for StdoutNotifier {
    fn notify(&self, event: NotifyEvent, message: &str, context: &NotifyContext) -> Result<()> {
        let line = format_line(event, message, context);
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}").context("write notification to stdout")?;
        stdout.flush().context("flush stdout")
    }
}

/// `[dockcheck/EVENT] message | key=value, key=value`
pub fn format_line(event: NotifyEvent, message: &str, context: &NotifyContext) -> String {
    let mut line = format!("[dockcheck/{}] {message}", event.as_str().to_uppercase());
    if !context.is_empty() {
        let details: Vec<String> = context.iter().map(|(k, v)| format!("{k}={v}")).collect();
        line.push_str(" | ");
        line.push_str(&details.join(", "));
    }
    line
}

/// Posts to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    webhook_url: Option<String>,
}

impl SlackNotifier {
    /// A missing URL is accepted here and reported on every `notify`.
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url: webhook_url.filter(|url| !url.trim().is_empty()),
        }
    }
}

impl Notifier for SlackNotifier {
    fn notify(&self, event: NotifyEvent, message: &str, context: &NotifyContext) -> Result<()> {
        let Some(url) = self.webhook_url.as_deref() else {
            bail!("no webhook_url configured for slack channel");
        };
        let payload = slack_payload(event, message, context);
        let agent = ureq::AgentBuilder::new().timeout(SLACK_TIMEOUT).build();
        match agent
            .post(url)
            .set("Content-Type", "application/json")
            .send_string(&payload.to_string())
        {
            Ok(response) => {
                info!(event = %event, status = response.status(), "slack notification sent");
                Ok(())
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(anyhow!("slack webhook returned HTTP {code}: {body}"))
            }
            Err(err) => Err(anyhow!("slack webhook request failed: {err}")),
        }
    }
}

/// Block Kit payload: a header and body section, plus one field per context entry.
pub fn slack_payload(event: NotifyEvent, message: &str, context: &NotifyContext) -> Value {
    let severity = event.severity();
    let icon = match severity {
        "warning" => ":warning:",
        "error" => ":x:",
        "critical" => ":rotating_light:",
        _ => ":information_source:",
    };
    let title = title(event);
    let mut blocks = vec![
        json!({"type": "section", "text": {"type": "mrkdwn", "text": format!("{icon} *{title}*")}}),
        json!({"type": "section", "text": {"type": "mrkdwn", "text": message}}),
    ];
    if !context.is_empty() {
        let fields: Vec<Value> = context
            .iter()
            .map(|(k, v)| json!({"type": "mrkdwn", "text": format!("*{k}*: {v}")}))
            .collect();
        blocks.push(json!({"type": "section", "fields": fields}));
    }
    json!({
        "blocks": blocks,
        "text": format!("{}: {title}", severity.to_uppercase()),
    })
}

/// Comments on the pull request of the current branch with `gh pr comment`.
#[derive(Debug, Clone)]
pub struct GithubCommentNotifier {
    program: String,
}

impl Default for GithubCommentNotifier {
    fn default() -> Self {
        Self {
            program: "gh".to_string(),
        }
    }
}

impl GithubCommentNotifier {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Notifier for GithubCommentNotifier {
    fn notify(&self, event: NotifyEvent, message: &str, context: &NotifyContext) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(github_comment_args(event, message, context));
        let output = match run_with_timeout(cmd, GH_TIMEOUT, GH_OUTPUT_LIMIT_BYTES) {
            Ok(output) => output,
            Err(err)
                if err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) =>
            {
                bail!("'{}' CLI not found on PATH; GitHub notification skipped", self.program);
            }
            Err(err) => return Err(err.context("run gh pr comment")),
        };
        if output.timed_out {
            bail!("gh pr comment timed out after {}s", GH_TIMEOUT.as_secs());
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            let detail = if stderr.trim().is_empty() {
                output.stdout_text()
            } else {
                stderr
            };
            bail!(
                "gh pr comment failed (exit {:?}): {}",
                output.status.code(),
                detail.trim()
            );
        }
        info!(event = %event, "github comment posted");
        Ok(())
    }
}

/// Arguments for `gh`: `pr comment --body <markdown>`.
pub fn github_comment_args(event: NotifyEvent, message: &str, context: &NotifyContext) -> Vec<String> {
    let mut lines = vec![format!("### {}", title(event)), String::new(), message.to_string()];
    if !context.is_empty() {
        lines.push(String::new());
        lines.push("**Details:**".to_string());
        lines.extend(context.iter().map(|(k, v)| format!("- **{k}**: {v}")));
    }
    vec![
        "pr".to_string(),
        "comment".to_string(),
        "--body".to_string(),
        lines.join("\n"),
    ]
}

fn title(event: NotifyEvent) -> String {
    format!("dockcheck: {}", event.as_str())
}

/// Fans a notification out to the channels a policy configures, honouring its
/// per-event switches.
pub struct PolicyNotifier {
    on_deploy: bool,
    on_block: bool,
    on_rollback: bool,
    channels: Vec<Box<dyn Notifier>>,
}

impl PolicyNotifier {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn wants(&self, event: NotifyEvent) -> bool {
        match event {
            NotifyEvent::Deploy => self.on_deploy,
            NotifyEvent::Block => self.on_block,
            NotifyEvent::Rollback => self.on_rollback,
            NotifyEvent::Notify => true,
        }
    }
}

impl Notifier for PolicyNotifier {
    fn notify(&self, event: NotifyEvent, message: &str, context: &NotifyContext) -> Result<()> {
        if !self.wants(event) {
            debug!(event = %event, "notification disabled by policy");
            return Ok(());
        }
        let mut first_err = None;
        for channel in &self.channels {
            if let Err(err) = channel.notify(event, message, context) {
                warn!(event = %event, err = %format!("{err:#}"), "notification channel failed");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Build the notifier described by a policy's `notifications` section.
///
/// Channel types `stdout`, `slack` and `github` are delivered; anything else
/// is logged as unsupported and skipped.
pub fn notifier_from_policy(notifications: &Notifications) -> PolicyNotifier {
    let mut channels: Vec<Box<dyn Notifier>> = Vec::new();
    for channel in &notifications.channels {
        match channel.kind.as_str() {
            "stdout" => channels.push(Box::new(StdoutNotifier)),
            "slack" => channels.push(Box::new(SlackNotifier::new(channel.webhook_url.clone()))),
            "github" => channels.push(Box::new(GithubCommentNotifier::default())),
            other => warn!(channel = other, "unsupported notification channel; skipping"),
        }
    }
    PolicyNotifier {
        on_deploy: notifications.on_deploy,
        on_block: notifications.on_block,
        on_rollback: notifications.on_rollback,
        channels,
    }
}

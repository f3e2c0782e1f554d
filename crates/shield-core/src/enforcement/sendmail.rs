use super::{Notification, Notifier};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Maps usernames to email addresses
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    domain: Option<String>,
    external: HashMap<String, String>,
}

impl AddressBook {
    pub fn new(domain: Option<String>, external: HashMap<String, String>) -> Self {
        let domain = domain
            .map(|d| d.trim().trim_start_matches('@').to_string())
            .filter(|d| !d.is_empty());
        Self { domain, external }
    }

    /// Explicit external address first, then `user@domain`
    pub fn address_for(&self, user: &str) -> Option<String> {
        if let Some(address) = self.external.get(user) {
            return Some(address.clone());
        }
        self.domain.as_ref().map(|d| format!("{user}@{d}"))
    }
}

/// Delivers mail through a local `sendmail -t`
pub struct SendmailNotifier {
    sendmail_path: PathBuf,
    sender: String,
    reply_to: Option<String>,
    timeout: Duration,
}

impl SendmailNotifier {
    pub fn new(
        sendmail_path: impl Into<PathBuf>,
        sender: impl Into<String>,
        reply_to: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            sendmail_path: sendmail_path.into(),
            sender: sender.into(),
            reply_to,
            timeout,
        }
    }

    /// RFC 5322 message with a monospace HTML body
    pub fn render_message(&self, notification: &Notification) -> String {
        let mut message = format!(
            "From: {}\nTo: {}\nSubject: {}\n",
            self.sender, notification.to, notification.subject
        );
        if let Some(reply_to) = &self.reply_to {
            message.push_str(&format!("Reply-To: {reply_to}\n"));
        }
        message.push_str("MIME-Version: 1.0\nContent-Type: text/html; charset=utf-8\n\n");
        message.push_str(&format!(
            "<html><head></head><body><font face=\"Courier New, Courier, monospace\"><pre>{}</pre></font></body></html>\n",
            escape_html(&notification.body)
        ));
        message
    }

    async fn send(&self, message: String) -> Result<()> {
        let mut child = Command::new(&self.sendmail_path)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run {}", self.sendmail_path.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .context("Failed to write message to sendmail")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for sendmail")?;
        if !output.status.success() {
            bail!(
                "sendmail exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        debug!(to = %notification.to, subject = %notification.subject, "Sending email");
        let message = self.render_message(notification);
        tokio::time::timeout(self.timeout, self.send(message))
            .await
            .with_context(|| format!("sendmail timed out after {:?}", self.timeout))?
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

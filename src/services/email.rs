use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use lettre::message::{header, Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

use crate::core::config::EmailSettings;

const OUTBOX_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EmailMessage {
    pub(crate) to: Vec<String>,
    pub(crate) subject: String,
    pub(crate) body: String,
    pub(crate) html: bool,
}

impl EmailMessage {
    pub(crate) fn text(to: &[String], subject: &str, body: &str) -> Self {
        Self { to: to.to_vec(), subject: subject.to_string(), body: body.to_string(), html: false }
    }

    pub(crate) fn html(to: &[String], subject: &str, body: &str) -> Self {
        Self { html: true, ..Self::text(to, subject, body) }
    }
}

/// SMTP delivery when configured, plus an in-process outbox of recent messages.
pub(crate) struct Mailer {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: String,
    outbox: Mutex<VecDeque<EmailMessage>>,
}

impl Mailer {
    /// No SMTP host (or testing mode) means messages are only logged and kept.
    pub(crate) fn new(settings: &EmailSettings, testing: bool) -> anyhow::Result<Self> {
        let transport = if testing || settings.host.trim().is_empty() {
            None
        } else {
            let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
                .with_context(|| format!("Failed to create SMTP transport for '{}'", settings.host))?
                .port(settings.port);
            if !settings.user.is_empty() {
                builder = builder.credentials(Credentials::new(settings.user.clone(), settings.pass.clone()));
            }
            Some(builder.build())
        };

        Ok(Self { transport, from: settings.from.clone(), outbox: Mutex::new(VecDeque::new()) })
    }

    pub(crate) fn disabled() -> Self {
        Self { transport: None, from: String::new(), outbox: Mutex::new(VecDeque::new()) }
    }

    pub(crate) async fn send(&self, message: EmailMessage) -> anyhow::Result<()> {
        if message.to.is_empty() {
            return Ok(());
        }

        if let Some(transport) = &self.transport {
            let email = self.build(&message)?;
            transport
                .send(email)
                .await
                .with_context(|| format!("Failed to send email '{}'", message.subject))?;
            tracing::debug!(subject = %message.subject, recipients = message.to.len(), "Sent email");
        } else {
            tracing::info!(subject = %message.subject, to = ?message.to, "Email delivery is disabled, keeping message");
        }

        let mut outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        if outbox.len() >= OUTBOX_CAPACITY {
            outbox.pop_front();
        }
        outbox.push_back(message);
        Ok(())
    }

    /// Messages sent so far, oldest first.
    pub(crate) fn outbox(&self) -> Vec<EmailMessage> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    pub(crate) fn clear_outbox(&self) {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn build(&self, message: &EmailMessage) -> anyhow::Result<Message> {
        let from: Mailbox = self.from.parse().with_context(|| format!("invalid sender '{}'", self.from))?;
        let mut builder = Message::builder().from(from).subject(message.subject.clone());
        for to in &message.to {
            let mailbox: Mailbox = to.parse().with_context(|| format!("invalid recipient '{to}'"))?;
            builder = builder.to(mailbox);
        }

        let content_type = if message.html { header::ContentType::TEXT_HTML } else { header::ContentType::TEXT_PLAIN };
        Ok(builder.header(content_type).body(message.body.clone())?)
    }
}

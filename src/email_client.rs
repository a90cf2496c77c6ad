use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::env;

/// Thin SMTP wrapper for operator alerts. Reads its settings from the
/// environment and degrades to a logged no-op when unconfigured, so alert
/// call sites never have to care whether mail is wired up.
pub struct EmailClient {
    smtp_host: Option<String>,
    smtp_username: Option<String>,
    smtp_password: Option<String>,
    from_address: Option<String>,
    to_address: Option<String>,
}

impl EmailClient {
    pub fn new() -> Self {
        Self {
            smtp_host: env::var("SMTP_HOST").ok().filter(|v| !v.is_empty()),
            smtp_username: env::var("SMTP_USERNAME").ok().filter(|v| !v.is_empty()),
            smtp_password: env::var("SMTP_PASSWORD").ok().filter(|v| !v.is_empty()),
            from_address: env::var("ALERT_EMAIL_FROM").ok().filter(|v| !v.is_empty()),
            to_address: env::var("ALERT_EMAIL_TO").ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn send(&self, subject: &str, body: &str) {
        let (Some(host), Some(username), Some(password), Some(from), Some(to)) = (
            self.smtp_host.as_ref(),
            self.smtp_username.as_ref(),
            self.smtp_password.as_ref(),
            self.from_address.as_ref(),
            self.to_address.as_ref(),
        ) else {
            log::debug!("[ALERT] email not configured; skipping '{}'", subject);
            return;
        };

        let from_mailbox: Mailbox = match from.parse() {
            Ok(mailbox) => mailbox,
            Err(err) => {
                log::warn!("[ALERT] invalid ALERT_EMAIL_FROM '{}': {}", from, err);
                return;
            }
        };
        let to_mailbox: Mailbox = match to.parse() {
            Ok(mailbox) => mailbox,
            Err(err) => {
                log::warn!("[ALERT] invalid ALERT_EMAIL_TO '{}': {}", to, err);
                return;
            }
        };
        let message = match Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .body(body.to_string())
        {
            Ok(message) => message,
            Err(err) => {
                log::warn!("[ALERT] failed to build email '{}': {}", subject, err);
                return;
            }
        };

        let transport = match SmtpTransport::relay(host) {
            Ok(builder) => builder
                .credentials(Credentials::new(username.clone(), password.clone()))
                .build(),
            Err(err) => {
                log::warn!("[ALERT] failed to build SMTP transport for {}: {}", host, err);
                return;
            }
        };

        if let Err(err) = transport.send(&message) {
            log::warn!("[ALERT] failed to send '{}': {}", subject, err);
        }
    }
}

impl Default for EmailClient {
    fn default() -> Self {
        Self::new()
    }
}

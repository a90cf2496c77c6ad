use crate::email_client::EmailClient;
use once_cell::sync::Lazy;

static OPS_NOTIFIER: Lazy<OpsNotifier> = Lazy::new(OpsNotifier::new);

/// Page the operator: an automated unwind exhausted every escalation and a
/// position may still be open.
pub fn notify_manual_intervention(symbol: &str, detail: &str) {
    OPS_NOTIFIER.notify_manual_intervention(symbol, detail);
}

/// Surface repeated HTTP 429s so a dying API key does not fail silently.
pub fn notify_rate_limit(context: &str, detail: &str) {
    OPS_NOTIFIER.notify_rate_limit(context, detail);
}

struct OpsNotifier {
    pair_tag: String,
}

impl OpsNotifier {
    fn new() -> Self {
        let a = std::env::var("INSTRUMENT_A").unwrap_or_default();
        let b = std::env::var("INSTRUMENT_B").unwrap_or_default();
        let pair_tag = if a.is_empty() || b.is_empty() {
            String::new()
        } else {
            format!("{}/{}", a, b)
        };
        Self { pair_tag }
    }

    fn subject(&self, kind: &str, context: &str) -> String {
        if self.pair_tag.is_empty() {
            format!("[{}] {}", kind, context)
        } else {
            format!("[{}] {} - {}", self.pair_tag, kind, context)
        }
    }

    fn notify_manual_intervention(&self, symbol: &str, detail: &str) {
        let subject = self.subject("ManualIntervention", symbol);
        let body = format!(
            "Automated unwind could not verify a flat position on {}.\nDetail: {}\n\
             Automated cycling is halted until the account is inspected.",
            symbol, detail
        );
        EmailClient::new().send(&subject, &body);
        log::error!(
            "[ALERT] manual intervention notification sent for {} (detail: {})",
            symbol,
            detail
        );
    }

    fn notify_rate_limit(&self, context: &str, detail: &str) {
        let subject = self.subject("RateLimit", context);
        let body = format!(
            "HTTP 429 Too Many Requests detected while {}.\nDetail: {}",
            context, detail
        );
        EmailClient::new().send(&subject, &body);
        log::warn!(
            "[ALERT] rate limit notification sent for '{}' (detail: {})",
            context,
            detail
        );
    }
}

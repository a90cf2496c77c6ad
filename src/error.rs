use crate::exchange::ExchangeError;
use rust_decimal::Decimal;
use std::fmt;

/// Domain failure taxonomy. Transport problems stay inside the execution
/// engine's bounded retries; everything here is a decision the caller must
/// see. `PositionMismatch` and `InvariantViolation` are never absorbed
/// silently — they halt new BUILDs until resolved.
#[derive(Debug)]
pub enum TradeError {
    /// Both the stream and the REST fallback failed; the current cycle
    /// attempt aborts before any order is placed.
    DataUnavailable(String),
    /// The venue refused the order outright (would-cross post-only, bad
    /// size). Not retried blindly; the caller decides on a new intent.
    OrderRejected(String),
    /// No fill within the policy timeout.
    OrderExpired(String),
    /// The authoritative position disagrees with what an operation claimed.
    PositionMismatch {
        symbol: String,
        expected: Decimal,
        actual: Decimal,
        context: String,
    },
    /// Escalation exhausted without verified closure. An operator has to
    /// look at the account before automated cycling may continue.
    ManualInterventionRequired { symbol: String, detail: String },
    /// A structural guarantee broke (e.g. both legs same direction). Fatal
    /// for the run: flatten and halt.
    InvariantViolation(String),
    Exchange(ExchangeError),
}

impl fmt::Display for TradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeError::DataUnavailable(m) => write!(f, "market data unavailable: {}", m),
            TradeError::OrderRejected(m) => write!(f, "order rejected: {}", m),
            TradeError::OrderExpired(m) => write!(f, "order expired: {}", m),
            TradeError::PositionMismatch {
                symbol,
                expected,
                actual,
                context,
            } => write!(
                f,
                "position mismatch on {} ({}): expected {} actual {}",
                symbol, context, expected, actual
            ),
            TradeError::ManualInterventionRequired { symbol, detail } => {
                write!(f, "manual intervention required on {}: {}", symbol, detail)
            }
            TradeError::InvariantViolation(m) => write!(f, "invariant violation: {}", m),
            TradeError::Exchange(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TradeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TradeError::Exchange(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ExchangeError> for TradeError {
    fn from(err: ExchangeError) -> TradeError {
        TradeError::Exchange(err)
    }
}

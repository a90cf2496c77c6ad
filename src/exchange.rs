use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::fmt;
use tokio::sync::mpsc;

/// Side of an order. Positions are signed quantities instead (positive =
/// long, negative = short), so there is no separate position direction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Sign contributed to a position by a fill on this side.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Wire-level order style understood by the venue. The execution engine's
/// pricing policies map onto these; venues that lack a style reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitKind {
    /// Rest on the book; the venue must reject the order if it would cross.
    PostOnly,
    /// Fill immediately what the limit allows, cancel the remainder.
    Ioc,
    /// Fill the full size immediately or nothing at all.
    FillOrKill,
    /// Plain limit order resting until filled or cancelled.
    Limit,
}

/// Static per-contract metadata, loaded once at startup and immutable after.
#[derive(Debug, Clone)]
pub struct InstrumentMeta {
    pub symbol: String,
    pub tick_size: Decimal,
    pub size_step: Decimal,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub min_order: Option<Decimal>,
}

/// Best bid/ask for one instrument at one moment. `exchange_ts_ms` is the
/// venue's own update timestamp; `received_at` is our monotonic receipt time
/// and is what staleness checks use.
#[derive(Debug, Clone)]
pub struct QuoteSnapshot {
    pub symbol: String,
    pub bid: Decimal,
    pub bid_size: Decimal,
    pub ask: Decimal,
    pub ask_size: Decimal,
    pub exchange_ts_ms: i64,
    pub received_at: std::time::Instant,
}

impl QuoteSnapshot {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }

    /// A crossed snapshot (ask below bid) is transport garbage, not a market.
    pub fn is_valid(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask >= self.bid
    }

    pub fn spread_bps(&self) -> Decimal {
        let mid = self.mid();
        if mid <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.ask - self.bid) / mid * Decimal::from(10_000)
    }

    pub fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// One update pushed by the venue's streaming feed.
#[derive(Debug, Clone)]
pub struct QuoteEvent {
    pub snapshot: QuoteSnapshot,
}

/// Identifier pair returned on submission. Some venues echo an internal id
/// alongside the client id; fills may be keyed by either.
#[derive(Debug, Clone)]
pub struct OrderHandle {
    pub order_id: String,
    pub exchange_order_id: Option<String>,
    pub ordered_price: Decimal,
    pub ordered_size: Decimal,
}

/// Point-in-time view of one order as the venue reports it.
#[derive(Debug, Clone)]
pub struct OrderStatusReport {
    pub order_id: String,
    pub is_open: bool,
    pub filled_size: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub rejected: bool,
    pub reject_reason: Option<String>,
}

#[derive(Debug)]
pub enum ExchangeError {
    Rejected(String),
    RateLimited(String),
    Connectivity(String),
    UnknownOrder(String),
    UnknownSymbol(String),
    Other(String),
}

impl ExchangeError {
    /// Transient failures are worth a bounded local retry; logical
    /// rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited(_) | ExchangeError::Connectivity(_)
        )
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Rejected(m) => write!(f, "order rejected: {}", m),
            ExchangeError::RateLimited(m) => write!(f, "rate limited: {}", m),
            ExchangeError::Connectivity(m) => write!(f, "connectivity: {}", m),
            ExchangeError::UnknownOrder(m) => write!(f, "unknown order: {}", m),
            ExchangeError::UnknownSymbol(m) => write!(f, "unknown symbol: {}", m),
            ExchangeError::Other(m) => write!(f, "exchange error: {}", m),
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Capability interface one venue adapter implements. The core never talks
/// to a venue except through this trait, and never caches what it returns
/// for `get_position` — positions are ground truth, re-queried per decision.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn start(&self) -> Result<(), ExchangeError>;

    async fn stop(&self) -> Result<(), ExchangeError>;

    async fn instrument_meta(&self, symbol: &str) -> Result<InstrumentMeta, ExchangeError>;

    /// Synchronous quote query, used as the fallback when the stream is
    /// stale or disconnected.
    async fn get_quote_rest(&self, symbol: &str) -> Result<QuoteSnapshot, ExchangeError>;

    /// Streaming top-of-book updates for the given symbols. The receiver is
    /// owned by the market-data cache's single feed-consumer task.
    async fn quote_stream(
        &self,
        symbols: &[String],
    ) -> Result<mpsc::Receiver<QuoteEvent>, ExchangeError>;

    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        kind: SubmitKind,
    ) -> Result<OrderHandle, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, ExchangeError>;

    /// Signed position for one instrument, straight from the venue.
    async fn get_position(&self, symbol: &str) -> Result<Decimal, ExchangeError>;
}

use crate::error::TradeError;
use crate::exchange::{ExchangeApi, QuoteSnapshot, Side};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Resting quantity at the best price level of one side. `confirmed` is
/// false when no depth information was available at all — callers must not
/// read an unknown book as an empty one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthAtTouch {
    pub quantity: rust_decimal::Decimal,
    pub confirmed: bool,
}

impl DepthAtTouch {
    pub fn unknown() -> Self {
        Self {
            quantity: rust_decimal::Decimal::ZERO,
            confirmed: false,
        }
    }
}

/// Latest top-of-book per instrument. A single feed-consumer task is the
/// only writer; readers clone the current snapshot out of a watch channel,
/// so a reader can never observe a half-updated quote.
pub struct MarketDataCache {
    exchange: Arc<dyn ExchangeApi>,
    staleness: Duration,
    channels: HashMap<String, watch::Receiver<Option<QuoteSnapshot>>>,
    feed_task: JoinHandle<()>,
}

impl MarketDataCache {
    pub async fn start(
        exchange: Arc<dyn ExchangeApi>,
        symbols: &[String],
        staleness: Duration,
    ) -> Result<Self, TradeError> {
        let mut senders: HashMap<String, watch::Sender<Option<QuoteSnapshot>>> = HashMap::new();
        let mut channels = HashMap::new();
        for symbol in symbols {
            let (tx, rx) = watch::channel(None);
            senders.insert(symbol.clone(), tx);
            channels.insert(symbol.clone(), rx);
        }

        let mut stream = exchange.quote_stream(symbols).await?;
        let feed_task = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                let snapshot = event.snapshot;
                if !snapshot.is_valid() {
                    log::debug!(
                        "[MARKET] dropping crossed/empty quote {} bid={} ask={}",
                        snapshot.symbol,
                        snapshot.bid,
                        snapshot.ask
                    );
                    continue;
                }
                if let Some(tx) = senders.get(&snapshot.symbol) {
                    let _ = tx.send(Some(snapshot));
                }
            }
            log::warn!("[MARKET] quote stream ended; cache now serves REST fallback only");
        });

        Ok(Self {
            exchange,
            staleness,
            channels,
            feed_task,
        })
    }

    fn cached(&self, symbol: &str) -> Option<QuoteSnapshot> {
        self.channels
            .get(symbol)
            .and_then(|rx| rx.borrow().clone())
    }

    /// Latest snapshot for `symbol`. A stale cached quote triggers a
    /// synchronous REST refresh before giving up; only when both sources
    /// fail does this surface `DataUnavailable`.
    pub async fn get_quote(&self, symbol: &str) -> Result<QuoteSnapshot, TradeError> {
        if let Some(snapshot) = self.cached(symbol) {
            if snapshot.received_at.elapsed() <= self.staleness {
                return Ok(snapshot);
            }
            log::debug!(
                "[MARKET] {} cached quote stale ({}ms); falling back to REST",
                symbol,
                snapshot.received_at.elapsed().as_millis()
            );
        }
        match self.exchange.get_quote_rest(symbol).await {
            Ok(snapshot) if snapshot.is_valid() => Ok(snapshot),
            Ok(snapshot) => Err(TradeError::DataUnavailable(format!(
                "{} REST quote invalid (bid={} ask={})",
                symbol, snapshot.bid, snapshot.ask
            ))),
            Err(err) => Err(TradeError::DataUnavailable(format!(
                "{} stream stale and REST failed: {}",
                symbol, err
            ))),
        }
    }

    /// Quantity resting at the touch on `side`. Missing data yields
    /// `DepthAtTouch::unknown()`, never an error and never a confirmed zero.
    pub async fn get_depth_at_touch(&self, symbol: &str, side: Side) -> DepthAtTouch {
        let snapshot = match self.get_quote(symbol).await {
            Ok(s) => s,
            Err(_) => return DepthAtTouch::unknown(),
        };
        let quantity = match side {
            Side::Buy => snapshot.bid_size,
            Side::Sell => snapshot.ask_size,
        };
        DepthAtTouch {
            quantity,
            confirmed: true,
        }
    }
}

impl Drop for MarketDataCache {
    fn drop(&mut self) {
        self.feed_task.abort();
    }
}

use crate::exchange::{
    ExchangeApi, ExchangeError, InstrumentMeta, OrderHandle, OrderStatusReport, QuoteEvent,
    QuoteSnapshot, Side, SubmitKind,
};
use crate::ops_notifier::notify_rate_limit;
use crate::ports::paper_exchange::PaperExchange;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;

/// Venue selection behind one box. Every venue is a thin adapter over the
/// same capability trait; the core never branches on the venue name outside
/// this constructor.
pub struct ExchangeBox {
    pub inner: Box<dyn ExchangeApi>,
}

/// Contract metadata and a seed book for the simulated venue. Live venues
/// serve these from their metadata endpoints instead.
fn paper_instrument(symbol: &str) -> (InstrumentMeta, Decimal, Decimal) {
    match symbol {
        "ETH" => (
            InstrumentMeta {
                symbol: symbol.to_string(),
                tick_size: dec!(0.10),
                size_step: dec!(0.001),
                maker_fee_rate: dec!(0.0002),
                taker_fee_rate: dec!(0.0005),
                min_order: Some(dec!(0.001)),
            },
            dec!(2258.10),
            dec!(2258.20),
        ),
        "BTC" => (
            InstrumentMeta {
                symbol: symbol.to_string(),
                tick_size: dec!(1),
                size_step: dec!(0.0001),
                maker_fee_rate: dec!(0.0002),
                taker_fee_rate: dec!(0.0005),
                min_order: Some(dec!(0.0001)),
            },
            dec!(67412),
            dec!(67413),
        ),
        "SOL" => (
            InstrumentMeta {
                symbol: symbol.to_string(),
                tick_size: dec!(0.01),
                size_step: dec!(0.1),
                maker_fee_rate: dec!(0.0002),
                taker_fee_rate: dec!(0.0005),
                min_order: Some(dec!(0.1)),
            },
            dec!(95.10),
            dec!(95.15),
        ),
        _ => (
            InstrumentMeta {
                symbol: symbol.to_string(),
                tick_size: dec!(0.01),
                size_step: dec!(0.01),
                maker_fee_rate: dec!(0.0002),
                taker_fee_rate: dec!(0.0005),
                min_order: None,
            },
            dec!(99.99),
            dec!(100.01),
        ),
    }
}

impl ExchangeBox {
    pub async fn create(venue: &str, symbols: &[String]) -> Result<Self, ExchangeError> {
        match venue {
            "paper" => {
                let mut instruments = Vec::new();
                let mut seeds = Vec::new();
                for symbol in symbols {
                    let (meta, bid, ask) = paper_instrument(symbol);
                    instruments.push(meta);
                    seeds.push((symbol.clone(), bid, ask));
                }
                let paper = PaperExchange::new(instruments);
                for (symbol, bid, ask) in seeds {
                    paper.set_quote(&symbol, bid, ask, dec!(50), dec!(50));
                }
                Ok(ExchangeBox {
                    inner: Box::new(paper),
                })
            }
            _ => Err(ExchangeError::Other(format!(
                "Unsupported venue '{}'",
                venue
            ))),
        }
    }

    fn report_rate_limit(&self, operation: &str, detail: &str, err: &ExchangeError) {
        let err_text = err.to_string();
        if matches!(err, ExchangeError::RateLimited(_))
            || err_text.contains("429")
            || err_text.contains("Too Many Requests")
        {
            let context = format!("{} ({})", operation, detail);
            notify_rate_limit(&context, &err_text);
        }
    }
}

#[async_trait]
impl ExchangeApi for ExchangeBox {
    async fn start(&self) -> Result<(), ExchangeError> {
        let result = self.inner.start().await;
        if let Err(ref err) = result {
            self.report_rate_limit("start", "exchange", err);
        }
        result
    }

    async fn stop(&self) -> Result<(), ExchangeError> {
        let result = self.inner.stop().await;
        if let Err(ref err) = result {
            self.report_rate_limit("stop", "exchange", err);
        }
        result
    }

    async fn instrument_meta(&self, symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
        let result = self.inner.instrument_meta(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("instrument_meta", symbol, err);
        }
        result
    }

    async fn get_quote_rest(&self, symbol: &str) -> Result<QuoteSnapshot, ExchangeError> {
        let result = self.inner.get_quote_rest(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_quote_rest", symbol, err);
        }
        result
    }

    async fn quote_stream(
        &self,
        symbols: &[String],
    ) -> Result<mpsc::Receiver<QuoteEvent>, ExchangeError> {
        let result = self.inner.quote_stream(symbols).await;
        if let Err(ref err) = result {
            self.report_rate_limit("quote_stream", &symbols.join(","), err);
        }
        result
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        kind: SubmitKind,
    ) -> Result<OrderHandle, ExchangeError> {
        let result = self
            .inner
            .submit_order(symbol, side, quantity, price, kind)
            .await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "submit_order",
                &format!("{} | side={} size={}", symbol, side, quantity),
                err,
            );
        }
        result
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let result = self.inner.cancel_order(symbol, order_id).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "cancel_order",
                &format!("{} | order_id={}", symbol, order_id),
                err,
            );
        }
        result
    }

    async fn order_status(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, ExchangeError> {
        let result = self.inner.order_status(symbol, order_id).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "order_status",
                &format!("{} | order_id={}", symbol, order_id),
                err,
            );
        }
        result
    }

    async fn get_position(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.inner.get_position(symbol).await
    }
}

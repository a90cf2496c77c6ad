use crate::exchange::{
    ExchangeApi, ExchangeError, InstrumentMeta, OrderHandle, OrderStatusReport, QuoteEvent,
    QuoteSnapshot, Side, SubmitKind,
};
use async_trait::async_trait;
use lazy_static::lazy_static;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

lazy_static! {
    static ref FILLED_PROBABILITY_IN_EMULATION: Decimal = {
        match env::var("FILLED_PROBABILITY_IN_EMULATION") {
            Ok(val) => val.parse::<Decimal>().unwrap_or(Decimal::new(1, 0)),
            Err(_) => Decimal::new(1, 0),
        }
    };
}

#[derive(Debug, Clone)]
struct PaperBook {
    bid: Decimal,
    bid_size: Decimal,
    ask: Decimal,
    ask_size: Decimal,
}

#[derive(Debug, Clone)]
struct PaperOrder {
    filled: Decimal,
    avg_price: Option<Decimal>,
    open: bool,
    rejected: bool,
    reject_reason: Option<String>,
}

#[derive(Debug, Default)]
struct PaperState {
    books: HashMap<String, PaperBook>,
    orders: HashMap<String, PaperOrder>,
    positions: HashMap<String, Decimal>,
    next_id: u64,
}

/// Simulated venue for dry runs and tests: top-of-book per symbol, order
/// matching that honors post-only/IOC/FOK semantics, and real signed
/// positions driven by fills. Resting orders fill with a configurable
/// probability so timeout and cancel paths can be exercised.
pub struct PaperExchange {
    instruments: HashMap<String, InstrumentMeta>,
    state: Arc<Mutex<PaperState>>,
    fill_probability: Mutex<Decimal>,
    stream_interval: Duration,
}

impl PaperExchange {
    pub fn new(instruments: Vec<InstrumentMeta>) -> Self {
        let instruments: HashMap<String, InstrumentMeta> = instruments
            .into_iter()
            .map(|i| (i.symbol.clone(), i))
            .collect();
        Self {
            instruments,
            state: Arc::new(Mutex::new(PaperState::default())),
            fill_probability: Mutex::new(*FILLED_PROBABILITY_IN_EMULATION),
            stream_interval: Duration::from_millis(250),
        }
    }

    pub fn set_quote(
        &self,
        symbol: &str,
        bid: Decimal,
        ask: Decimal,
        bid_size: Decimal,
        ask_size: Decimal,
    ) {
        let mut state = self.state.lock().unwrap();
        state.books.insert(
            symbol.to_string(),
            PaperBook {
                bid,
                bid_size,
                ask,
                ask_size,
            },
        );
    }

    pub fn set_fill_probability(&self, probability: Decimal) {
        *self.fill_probability.lock().unwrap() = probability;
    }

    pub fn position(&self, symbol: &str) -> Decimal {
        self.state
            .lock()
            .unwrap()
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    fn snapshot_of(book: &PaperBook, symbol: &str) -> QuoteSnapshot {
        QuoteSnapshot {
            symbol: symbol.to_string(),
            bid: book.bid,
            bid_size: book.bid_size,
            ask: book.ask,
            ask_size: book.ask_size,
            exchange_ts_ms: QuoteSnapshot::now_ms(),
            received_at: Instant::now(),
        }
    }

    fn roll_fill(&self) -> bool {
        let probability = *self.fill_probability.lock().unwrap();
        if probability >= Decimal::ONE {
            return true;
        }
        if probability <= Decimal::ZERO {
            return false;
        }
        rand::random::<f64>() < probability.to_f64().unwrap_or(1.0)
    }

    fn apply_fill(state: &mut PaperState, symbol: &str, side: Side, quantity: Decimal) {
        *state.positions.entry(symbol.to_string()).or_default() += side.sign() * quantity;
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    async fn start(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    async fn instrument_meta(&self, symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
        self.instruments
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_quote_rest(&self, symbol: &str) -> Result<QuoteSnapshot, ExchangeError> {
        let state = self.state.lock().unwrap();
        let book = state
            .books
            .get(symbol)
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;
        Ok(Self::snapshot_of(book, symbol))
    }

    async fn quote_stream(
        &self,
        symbols: &[String],
    ) -> Result<mpsc::Receiver<QuoteEvent>, ExchangeError> {
        let (tx, rx) = mpsc::channel(64);
        let state = self.state.clone();
        let symbols: Vec<String> = symbols.to_vec();
        let interval = self.stream_interval;
        let ticks: HashMap<String, Decimal> = symbols
            .iter()
            .filter_map(|s| self.instruments.get(s).map(|i| (s.clone(), i.tick_size)))
            .collect();
        tokio::spawn(async move {
            loop {
                for symbol in &symbols {
                    let snapshot = {
                        let mut state = state.lock().unwrap();
                        let Some(book) = state.books.get_mut(symbol) else {
                            continue;
                        };
                        // one-tick random walk keeps dry runs from trading
                        // a frozen book
                        if let Some(tick) = ticks.get(symbol) {
                            let step = match rand::random::<u8>() % 3 {
                                0 => -*tick,
                                1 => Decimal::ZERO,
                                _ => *tick,
                            };
                            if book.bid + step > Decimal::ZERO {
                                book.bid += step;
                                book.ask += step;
                            }
                        }
                        Self::snapshot_of(book, symbol)
                    };
                    if tx.send(QuoteEvent { snapshot }).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });
        Ok(rx)
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        kind: SubmitKind,
    ) -> Result<OrderHandle, ExchangeError> {
        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::Rejected("non-positive size".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        let book = state
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::UnknownSymbol(symbol.to_string()))?;
        let (far_price, far_size) = match side {
            Side::Buy => (book.ask, book.ask_size),
            Side::Sell => (book.bid, book.bid_size),
        };
        let crosses = match (side, price) {
            (_, None) => true,
            (Side::Buy, Some(limit)) => limit >= far_price,
            (Side::Sell, Some(limit)) => limit <= far_price,
        };

        let order = match kind {
            SubmitKind::PostOnly => {
                if crosses {
                    return Err(ExchangeError::Rejected(format!(
                        "post-only order would cross the spread ({:?} {} vs {})",
                        side,
                        price.unwrap_or_default(),
                        far_price
                    )));
                }
                if self.roll_fill() {
                    // a marketable counterparty arrived and lifted us
                    let fill_price = price.unwrap_or(far_price);
                    Self::apply_fill(&mut state, symbol, side, quantity);
                    PaperOrder {
                        filled: quantity,
                        avg_price: Some(fill_price),
                        open: false,
                        rejected: false,
                        reject_reason: None,
                    }
                } else {
                    PaperOrder {
                        filled: Decimal::ZERO,
                        avg_price: None,
                        open: true,
                        rejected: false,
                        reject_reason: None,
                    }
                }
            }
            SubmitKind::Ioc => {
                let filled = if crosses {
                    quantity.min(far_size)
                } else {
                    Decimal::ZERO
                };
                if filled > Decimal::ZERO {
                    Self::apply_fill(&mut state, symbol, side, filled);
                }
                PaperOrder {
                    filled,
                    avg_price: if filled > Decimal::ZERO {
                        Some(far_price)
                    } else {
                        None
                    },
                    open: false,
                    rejected: false,
                    reject_reason: None,
                }
            }
            SubmitKind::FillOrKill => {
                let can_fill = crosses && far_size >= quantity;
                if can_fill {
                    Self::apply_fill(&mut state, symbol, side, quantity);
                }
                PaperOrder {
                    filled: if can_fill { quantity } else { Decimal::ZERO },
                    avg_price: if can_fill { Some(far_price) } else { None },
                    open: false,
                    rejected: false,
                    reject_reason: None,
                }
            }
            SubmitKind::Limit => {
                if crosses {
                    let filled = quantity.min(far_size);
                    if filled > Decimal::ZERO {
                        Self::apply_fill(&mut state, symbol, side, filled);
                    }
                    PaperOrder {
                        filled,
                        avg_price: Some(far_price),
                        open: filled < quantity,
                        rejected: false,
                        reject_reason: None,
                    }
                } else {
                    PaperOrder {
                        filled: Decimal::ZERO,
                        avg_price: None,
                        open: true,
                        rejected: false,
                        reject_reason: None,
                    }
                }
            }
        };

        state.next_id += 1;
        let order_id = format!("paper-{}", state.next_id);
        let handle = OrderHandle {
            order_id: order_id.clone(),
            exchange_order_id: None,
            ordered_price: price.unwrap_or(far_price),
            ordered_size: quantity,
        };
        state.orders.insert(order_id, order);
        Ok(handle)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().unwrap();
        match state.orders.get_mut(order_id) {
            Some(order) => {
                order.open = false;
                Ok(())
            }
            None => Err(ExchangeError::UnknownOrder(order_id.to_string())),
        }
    }

    async fn order_status(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<OrderStatusReport, ExchangeError> {
        let state = self.state.lock().unwrap();
        let order = state
            .orders
            .get(order_id)
            .ok_or_else(|| ExchangeError::UnknownOrder(order_id.to_string()))?;
        Ok(OrderStatusReport {
            order_id: order_id.to_string(),
            is_open: order.open,
            filled_size: order.filled,
            avg_fill_price: order.avg_price,
            rejected: order.rejected,
            reject_reason: order.reject_reason.clone(),
        })
    }

    async fn get_position(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.position(symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eth() -> InstrumentMeta {
        InstrumentMeta {
            symbol: "ETH".to_string(),
            tick_size: dec!(0.10),
            size_step: dec!(0.001),
            maker_fee_rate: dec!(0.0002),
            taker_fee_rate: dec!(0.0005),
            min_order: None,
        }
    }

    fn venue() -> PaperExchange {
        let venue = PaperExchange::new(vec![eth()]);
        venue.set_quote("ETH", dec!(2258.10), dec!(2258.20), dec!(2), dec!(3));
        venue
    }

    #[tokio::test]
    async fn post_only_crossing_is_rejected() {
        let venue = venue();
        let err = venue
            .submit_order("ETH", Side::Buy, dec!(0.05), Some(dec!(2258.20)), SubmitKind::PostOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
        assert_eq!(venue.position("ETH"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn post_only_at_touch_rests_or_fills_as_maker() {
        let venue = venue();
        venue.set_fill_probability(Decimal::ONE);
        let handle = venue
            .submit_order("ETH", Side::Buy, dec!(0.05), Some(dec!(2258.10)), SubmitKind::PostOnly)
            .await
            .unwrap();
        let report = venue.order_status("ETH", &handle.order_id).await.unwrap();
        assert!(!report.is_open);
        assert_eq!(report.filled_size, dec!(0.05));
        assert_eq!(report.avg_fill_price, Some(dec!(2258.10)));
        assert_eq!(venue.position("ETH"), dec!(0.05));
    }

    #[tokio::test]
    async fn post_only_with_zero_probability_rests_open() {
        let venue = venue();
        venue.set_fill_probability(Decimal::ZERO);
        let handle = venue
            .submit_order("ETH", Side::Sell, dec!(0.05), Some(dec!(2258.20)), SubmitKind::PostOnly)
            .await
            .unwrap();
        let report = venue.order_status("ETH", &handle.order_id).await.unwrap();
        assert!(report.is_open);
        assert_eq!(report.filled_size, Decimal::ZERO);
        venue.cancel_order("ETH", &handle.order_id).await.unwrap();
        let report = venue.order_status("ETH", &handle.order_id).await.unwrap();
        assert!(!report.is_open);
    }

    #[tokio::test]
    async fn ioc_fills_up_to_resting_size() {
        let venue = venue();
        let handle = venue
            .submit_order("ETH", Side::Buy, dec!(5), Some(dec!(2258.20)), SubmitKind::Ioc)
            .await
            .unwrap();
        let report = venue.order_status("ETH", &handle.order_id).await.unwrap();
        // only 3 rest at the ask
        assert_eq!(report.filled_size, dec!(3));
        assert!(!report.is_open);
        assert_eq!(venue.position("ETH"), dec!(3));
    }

    #[tokio::test]
    async fn fok_is_all_or_none() {
        let venue = venue();
        let handle = venue
            .submit_order("ETH", Side::Buy, dec!(5), Some(dec!(2258.20)), SubmitKind::FillOrKill)
            .await
            .unwrap();
        let report = venue.order_status("ETH", &handle.order_id).await.unwrap();
        assert_eq!(report.filled_size, Decimal::ZERO);
        assert_eq!(venue.position("ETH"), Decimal::ZERO);

        let handle = venue
            .submit_order("ETH", Side::Buy, dec!(2), Some(dec!(2258.20)), SubmitKind::FillOrKill)
            .await
            .unwrap();
        let report = venue.order_status("ETH", &handle.order_id).await.unwrap();
        assert_eq!(report.filled_size, dec!(2));
    }

    #[tokio::test]
    async fn fills_move_signed_positions() {
        let venue = venue();
        venue
            .submit_order("ETH", Side::Buy, dec!(1), None, SubmitKind::Ioc)
            .await
            .unwrap();
        venue
            .submit_order("ETH", Side::Sell, dec!(2), None, SubmitKind::Ioc)
            .await
            .unwrap();
        assert_eq!(venue.position("ETH"), dec!(-1));
    }
}

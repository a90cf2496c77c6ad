use crate::error::TradeError;
use crate::exchange::{ExchangeApi, InstrumentMeta, Side};
use crate::execution::{quantize_size_ceil, ExecutionEngine, OrderOutcome};
use crate::ops_notifier::notify_manual_intervention;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// One bounded-retry-with-escalation policy, shared by every unwind path
/// instead of per-instrument hand-rolled loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Additional ticks the price may cross the spread on each successive
    /// attempt. Attempt 1 is conservative (no extra ticks).
    pub escalation_ticks: u32,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Wait before reading a position back, for exchange-side settlement.
    pub settlement_delay: Duration,
    /// Absolute quantity tolerance. Percentage tolerances break down near
    /// zero, which is exactly where this check runs.
    pub position_tolerance: Decimal,
    pub verify_attempts: u32,
    pub retry: RetryPolicy,
    /// Fixed larger cross used by the fill-or-kill last resort.
    pub final_cross_ticks: u32,
}

/// Observed state of one leg-pair attempt, for diagnostics at every
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegPairState {
    Pending,
    BothFilled,
    OneFilled,
    NoneFilled,
    VerifiedClosed,
    VerificationFailed,
    Closed,
    ManualInterventionRequired,
}

#[derive(Debug)]
pub enum ReconcileResult {
    /// Both legs filled and both positions verified against the exchange.
    BothVerified,
    /// The pair failed one-sided; every filled leg was force-closed and
    /// verified flat.
    EmergencyClosed { closed: Vec<ClosedLeg> },
    /// Neither leg holds anything; nothing to do.
    NothingFilled,
}

/// What a force close actually executed, for the accounting.
#[derive(Debug, Clone)]
pub struct CloseReport {
    pub closed_quantity: Decimal,
    pub avg_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ClosedLeg {
    pub symbol: String,
    pub close_side: Side,
    pub report: CloseReport,
}

/// One executed leg as the orchestrator saw it: the instrument, the side it
/// traded, and the terminal outcome.
#[derive(Debug)]
pub struct LegExecution {
    pub instrument: InstrumentMeta,
    pub side: Side,
    pub outcome: OrderOutcome,
}

/// Sign-agnostic flatness check against an absolute tolerance.
pub fn is_position_closed(position: Decimal, tolerance: Decimal) -> bool {
    position.abs() < tolerance
}

/// Verifies what the exchange actually holds after every execution and
/// drives bounded, escalating closes when reality disagrees with the order
/// reports. Never trusts an order's success flag as evidence of a position.
pub struct Reconciler {
    exchange: Arc<dyn ExchangeApi>,
    execution: Arc<ExecutionEngine>,
    cfg: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        execution: Arc<ExecutionEngine>,
        cfg: ReconcileConfig,
    ) -> Self {
        Self {
            exchange,
            execution,
            cfg,
        }
    }

    pub fn position_tolerance(&self) -> Decimal {
        self.cfg.position_tolerance
    }

    /// Query the authoritative position and compare against `expected`
    /// within the absolute tolerance. Waits the settlement delay first so
    /// just-executed fills have landed.
    pub async fn verify_position(
        &self,
        symbol: &str,
        expected: Decimal,
    ) -> Result<bool, TradeError> {
        sleep(self.cfg.settlement_delay).await;
        let actual = self.exchange.get_position(symbol).await?;
        let ok = (actual - expected).abs() < self.cfg.position_tolerance;
        log::info!(
            "[POSITION] verify {} expected={} actual={} ok={}",
            symbol,
            expected,
            actual,
            ok
        );
        Ok(ok)
    }

    async fn verify_with_retries(
        &self,
        symbol: &str,
        expected: Decimal,
        context: &str,
    ) -> Result<(), TradeError> {
        for attempt in 1..=self.cfg.verify_attempts {
            if self.verify_position(symbol, expected).await? {
                return Ok(());
            }
            log::warn!(
                "[POSITION] {} state={:?} ({}) attempt {}/{}",
                symbol,
                LegPairState::VerificationFailed,
                context,
                attempt,
                self.cfg.verify_attempts
            );
            sleep(self.cfg.retry.backoff).await;
        }
        let actual = self.exchange.get_position(symbol).await?;
        Err(TradeError::PositionMismatch {
            symbol: symbol.to_string(),
            expected,
            actual,
            context: context.to_string(),
        })
    }

    /// Bounded-retry verification that a position is flat.
    pub(crate) async fn verify_flat_with_retries(
        &self,
        symbol: &str,
        context: &str,
    ) -> Result<(), TradeError> {
        self.verify_with_retries(symbol, Decimal::ZERO, context).await
    }

    /// Decide what a just-executed leg pair left on the exchange and fix
    /// it. Both outcomes must already be terminal — this is never called
    /// with only one leg known.
    pub async fn reconcile_after_build(
        &self,
        leg_a: &LegExecution,
        leg_b: &LegExecution,
    ) -> Result<ReconcileResult, TradeError> {
        let state = match (leg_a.outcome.is_effective(), leg_b.outcome.is_effective()) {
            (true, true) => LegPairState::BothFilled,
            (false, false) if !leg_a.outcome.any_fill() && !leg_b.outcome.any_fill() => {
                LegPairState::NoneFilled
            }
            _ => LegPairState::OneFilled,
        };
        log::info!(
            "[RECONCILE] {}/{} state={:?} filled_a={} filled_b={}",
            leg_a.instrument.symbol,
            leg_b.instrument.symbol,
            state,
            leg_a.outcome.filled_quantity(),
            leg_b.outcome.filled_quantity()
        );

        match state {
            LegPairState::BothFilled => {
                for leg in [leg_a, leg_b] {
                    let expected = leg.side.sign() * leg.outcome.filled_quantity();
                    self.verify_with_retries(&leg.instrument.symbol, expected, "post-build")
                        .await?;
                }
                log::info!(
                    "[RECONCILE] {}/{} both legs verified against exchange",
                    leg_a.instrument.symbol,
                    leg_b.instrument.symbol
                );
                Ok(ReconcileResult::BothVerified)
            }
            LegPairState::NoneFilled => Ok(ReconcileResult::NothingFilled),
            _ => {
                // One-sided (or partially one-sided) build: unhedged
                // directional exposure, closed immediately with the filled
                // direction and quantity taken from the outcome itself, not
                // from a position query that may still be settling.
                let mut closed = Vec::new();
                for leg in [leg_a, leg_b] {
                    if !leg.outcome.any_fill() {
                        continue;
                    }
                    log::warn!(
                        "[UNWIND] {} one-sided fill qty={} side={}; force-closing",
                        leg.instrument.symbol,
                        leg.outcome.filled_quantity(),
                        leg.side
                    );
                    let close_side = leg.side.opposite();
                    let report = self
                        .force_close(&leg.instrument, close_side, leg.outcome.filled_quantity())
                        .await?;
                    closed.push(ClosedLeg {
                        symbol: leg.instrument.symbol.clone(),
                        close_side,
                        report,
                    });
                }
                Ok(ReconcileResult::EmergencyClosed { closed })
            }
        }
    }

    /// Close `quantity` of `instrument` in direction `close_side`, with
    /// bounded escalation: each attempt may cross the spread by more ticks
    /// than the last, then a fill-or-kill at a fixed larger cross, and only
    /// then — still unverified — an operator is paged. This function never
    /// reports success without an independent position check.
    pub async fn force_close(
        &self,
        instrument: &InstrumentMeta,
        close_side: Side,
        quantity: Decimal,
    ) -> Result<CloseReport, TradeError> {
        let symbol = instrument.symbol.as_str();
        let before = self.exchange.get_position(symbol).await?;
        let mut remaining = quantize_size_ceil(quantity, instrument.size_step);
        let mut closed_quantity = Decimal::ZERO;
        let mut closed_notional = Decimal::ZERO;
        log::warn!(
            "[UNWIND] {} force close side={} qty={} position_before={}",
            symbol,
            close_side,
            remaining,
            before
        );

        for attempt in 1..=self.cfg.retry.max_attempts {
            let extra_ticks = (attempt - 1) * self.cfg.retry.escalation_ticks;
            let outcome = self
                .execution
                .place_close_ioc(instrument, close_side, remaining, extra_ticks)
                .await?;
            let filled = outcome.filled_quantity();
            if filled > Decimal::ZERO {
                closed_quantity += filled;
                if let Some(px) = outcome.avg_fill_price() {
                    closed_notional += filled * px;
                }
            }
            remaining = (remaining - filled).max(Decimal::ZERO);
            log::warn!(
                "[UNWIND] {} close attempt {}/{} extra_ticks={} filled={} remaining={}",
                symbol,
                attempt,
                self.cfg.retry.max_attempts,
                extra_ticks,
                outcome.filled_quantity(),
                remaining
            );
            if remaining < self.cfg.position_tolerance {
                if self.verify_position(symbol, Decimal::ZERO).await? {
                    let after = self.exchange.get_position(symbol).await?;
                    log::info!(
                        "[UNWIND] {} state={:?} position_before={} position_after={}",
                        symbol,
                        LegPairState::VerifiedClosed,
                        before,
                        after
                    );
                    return Ok(CloseReport {
                        closed_quantity,
                        avg_price: if closed_quantity > Decimal::ZERO {
                            Some(closed_notional / closed_quantity)
                        } else {
                            None
                        },
                    });
                }
                // The venue says something is still there; fall through to
                // another attempt against what it reports.
                let actual = self.exchange.get_position(symbol).await?;
                remaining = quantize_size_ceil(actual.abs(), instrument.size_step);
                log::warn!(
                    "[UNWIND] {} fills complete but position not flat (actual={}); continuing",
                    symbol,
                    actual
                );
            }
            sleep(self.cfg.retry.backoff).await;
        }

        if remaining >= self.cfg.position_tolerance {
            log::warn!(
                "[UNWIND] {} escalation exhausted, last resort FOK cross={} ticks qty={}",
                symbol,
                self.cfg.final_cross_ticks,
                remaining
            );
            let outcome = self
                .execution
                .place_close_fok(instrument, close_side, remaining, self.cfg.final_cross_ticks)
                .await?;
            let filled = outcome.filled_quantity();
            if filled > Decimal::ZERO {
                closed_quantity += filled;
                if let Some(px) = outcome.avg_fill_price() {
                    closed_notional += filled * px;
                }
            }
            remaining = (remaining - filled).max(Decimal::ZERO);
        }

        if remaining < self.cfg.position_tolerance
            && self.verify_position(symbol, Decimal::ZERO).await?
        {
            let after = self.exchange.get_position(symbol).await?;
            log::info!(
                "[UNWIND] {} state={:?} (FOK fallback) position_before={} position_after={}",
                symbol,
                LegPairState::Closed,
                before,
                after
            );
            return Ok(CloseReport {
                closed_quantity,
                avg_price: if closed_quantity > Decimal::ZERO {
                    Some(closed_notional / closed_quantity)
                } else {
                    None
                },
            });
        }

        let actual = self.exchange.get_position(symbol).await.unwrap_or(remaining);
        let detail = format!(
            "force close exhausted; residual position {} after {} attempts + FOK",
            actual, self.cfg.retry.max_attempts
        );
        log::error!("[UNWIND] {} {}", symbol, detail);
        log::error!(
            "[UNWIND] {} state={:?}",
            symbol,
            LegPairState::ManualInterventionRequired
        );
        notify_manual_intervention(symbol, &detail);
        Err(TradeError::ManualInterventionRequired {
            symbol: symbol.to_string(),
            detail,
        })
    }

    /// Pre-BUILD cleanliness gate: refuse to open anything while either
    /// instrument already holds a position beyond tolerance. This check is
    /// the backpressure that stops silent fill failures from compounding
    /// across cycles.
    pub async fn refuse_build_if_unclean(&self, symbols: &[&str]) -> Result<(), TradeError> {
        for symbol in symbols {
            let actual = self.exchange.get_position(symbol).await?;
            if !is_position_closed(actual, self.cfg.position_tolerance) {
                log::error!(
                    "[POSITION] refusing BUILD: {} holds {} (tolerance {})",
                    symbol,
                    actual,
                    self.cfg.position_tolerance
                );
                return Err(TradeError::PositionMismatch {
                    symbol: symbol.to_string(),
                    expected: Decimal::ZERO,
                    actual,
                    context: "pre-build cleanliness check".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Flatten whatever either instrument holds, regardless of how it got
    /// there. Used at startup and on invariant violations.
    pub async fn flatten_all(&self, instruments: &[InstrumentMeta]) -> Result<(), TradeError> {
        for instrument in instruments {
            let actual = self.exchange.get_position(&instrument.symbol).await?;
            if is_position_closed(actual, self.cfg.position_tolerance) {
                continue;
            }
            let close_side = if actual > Decimal::ZERO {
                Side::Sell
            } else {
                Side::Buy
            };
            self.force_close(instrument, close_side, actual.abs()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{
        ExchangeError, OrderHandle, OrderStatusReport, QuoteEvent, QuoteSnapshot, SubmitKind,
    };
    use crate::execution::{ExecutionConfig, FillRole, OrderOutcome};
    use crate::market::MarketDataCache;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

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

    fn sol() -> InstrumentMeta {
        InstrumentMeta {
            symbol: "SOL".to_string(),
            tick_size: dec!(0.01),
            size_step: dec!(0.1),
            maker_fee_rate: dec!(0.0002),
            taker_fee_rate: dec!(0.0005),
            min_order: None,
        }
    }

    #[derive(Debug, Clone)]
    struct CloseOrder {
        symbol: String,
        side: Side,
        quantity: Decimal,
        kind: SubmitKind,
    }

    /// Venue with real signed positions. Orders fill per `fill_portion` and
    /// move the position, so force-close escalation is observable.
    struct StatefulExchange {
        positions: Mutex<HashMap<String, Decimal>>,
        fill_portion: Mutex<Decimal>,
        submitted: Mutex<Vec<CloseOrder>>,
        position_queries: Mutex<u32>,
        next_id: Mutex<u64>,
    }

    impl StatefulExchange {
        fn with_positions(entries: &[(&str, Decimal)]) -> Self {
            Self {
                positions: Mutex::new(
                    entries
                        .iter()
                        .map(|(s, q)| (s.to_string(), *q))
                        .collect(),
                ),
                fill_portion: Mutex::new(Decimal::ONE),
                submitted: Mutex::new(Vec::new()),
                position_queries: Mutex::new(0),
                next_id: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ExchangeApi for StatefulExchange {
        async fn start(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn instrument_meta(&self, symbol: &str) -> Result<InstrumentMeta, ExchangeError> {
            Err(ExchangeError::UnknownSymbol(symbol.to_string()))
        }
        async fn get_quote_rest(&self, symbol: &str) -> Result<QuoteSnapshot, ExchangeError> {
            Ok(QuoteSnapshot {
                symbol: symbol.to_string(),
                bid: dec!(2258.10),
                bid_size: dec!(10),
                ask: dec!(2258.20),
                ask_size: dec!(10),
                exchange_ts_ms: QuoteSnapshot::now_ms(),
                received_at: std::time::Instant::now(),
            })
        }
        async fn quote_stream(
            &self,
            _symbols: &[String],
        ) -> Result<mpsc::Receiver<QuoteEvent>, ExchangeError> {
            let (tx, rx) = mpsc::channel(1);
            std::mem::forget(tx);
            Ok(rx)
        }
        async fn submit_order(
            &self,
            symbol: &str,
            side: Side,
            quantity: Decimal,
            _price: Option<Decimal>,
            kind: SubmitKind,
        ) -> Result<OrderHandle, ExchangeError> {
            self.submitted.lock().unwrap().push(CloseOrder {
                symbol: symbol.to_string(),
                side,
                quantity,
                kind,
            });
            let portion = *self.fill_portion.lock().unwrap();
            let filled = match kind {
                SubmitKind::FillOrKill if portion < Decimal::ONE => Decimal::ZERO,
                _ => quantity * portion,
            };
            if filled > Decimal::ZERO {
                let mut positions = self.positions.lock().unwrap();
                *positions.entry(symbol.to_string()).or_default() += side.sign() * filled;
            }
            let id = {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                format!("close-{}", *next)
            };
            Ok(OrderHandle {
                order_id: id,
                exchange_order_id: None,
                ordered_price: dec!(2258.20),
                ordered_size: filled,
            })
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn order_status(
            &self,
            _symbol: &str,
            order_id: &str,
        ) -> Result<OrderStatusReport, ExchangeError> {
            // ordered_size carried the fill through submit
            let filled = self
                .submitted
                .lock()
                .unwrap()
                .last()
                .map(|o| o.quantity)
                .unwrap_or_default();
            let portion = *self.fill_portion.lock().unwrap();
            let last_kind = self.submitted.lock().unwrap().last().map(|o| o.kind);
            let effective = match last_kind {
                Some(SubmitKind::FillOrKill) if portion < Decimal::ONE => Decimal::ZERO,
                _ => filled * portion,
            };
            Ok(OrderStatusReport {
                order_id: order_id.to_string(),
                is_open: false,
                filled_size: effective,
                avg_fill_price: Some(dec!(2258.20)),
                rejected: false,
                reject_reason: None,
            })
        }
        async fn get_position(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
            *self.position_queries.lock().unwrap() += 1;
            Ok(self
                .positions
                .lock()
                .unwrap()
                .get(symbol)
                .copied()
                .unwrap_or(Decimal::ZERO))
        }
    }

    async fn reconciler_for(exchange: Arc<StatefulExchange>) -> Reconciler {
        let market = Arc::new(
            MarketDataCache::start(
                exchange.clone(),
                &["ETH".to_string(), "SOL".to_string()],
                Duration::from_millis(1500),
            )
            .await
            .unwrap(),
        );
        let execution = Arc::new(ExecutionEngine::new(
            exchange.clone(),
            market,
            ExecutionConfig {
                poll_interval: Duration::from_millis(1),
                ioc_timeout: Duration::from_millis(20),
                ..ExecutionConfig::default()
            },
        ));
        Reconciler::new(
            exchange,
            execution,
            ReconcileConfig {
                settlement_delay: Duration::from_millis(1),
                position_tolerance: dec!(0.001),
                verify_attempts: 2,
                retry: RetryPolicy {
                    max_attempts: 3,
                    backoff: Duration::from_millis(1),
                    escalation_ticks: 2,
                },
                final_cross_ticks: 10,
            },
        )
    }

    fn filled_outcome(qty: Decimal, price: Decimal) -> OrderOutcome {
        OrderOutcome::settle(qty, qty, Some(price), FillRole::Taker, dec!(0.95), None)
    }

    #[test]
    fn tolerance_boundary_is_sign_agnostic() {
        let tol = dec!(0.001);
        assert!(is_position_closed(dec!(0.0009), tol));
        assert!(!is_position_closed(dec!(0.0010), tol));
        assert!(is_position_closed(dec!(-0.0009), tol));
    }

    #[tokio::test]
    async fn verify_position_is_idempotent() {
        let exchange = Arc::new(StatefulExchange::with_positions(&[("ETH", dec!(0.05))]));
        let reconciler = reconciler_for(exchange.clone()).await;
        let first = reconciler.verify_position("ETH", dec!(0.05)).await.unwrap();
        let second = reconciler.verify_position("ETH", dec!(0.05)).await.unwrap();
        assert_eq!(first, second);
        assert!(first);
        // each call re-queried the exchange rather than trusting a cache
        assert_eq!(*exchange.position_queries.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn one_sided_fill_forces_close_of_filled_leg() {
        // ETH bought 0.05 and landed; SOL expired with zero fill.
        let exchange = Arc::new(StatefulExchange::with_positions(&[("ETH", dec!(0.05))]));
        let reconciler = reconciler_for(exchange.clone()).await;
        let leg_a = LegExecution {
            instrument: eth(),
            side: Side::Buy,
            outcome: filled_outcome(dec!(0.05), dec!(2258.20)),
        };
        let leg_b = LegExecution {
            instrument: sol(),
            side: Side::Sell,
            outcome: OrderOutcome::expired("no fill within timeout"),
        };
        let result = reconciler.reconcile_after_build(&leg_a, &leg_b).await.unwrap();
        match result {
            ReconcileResult::EmergencyClosed { closed } => {
                assert_eq!(closed.len(), 1);
                assert_eq!(closed[0].symbol, "ETH");
                assert_eq!(closed[0].close_side, Side::Sell);
                assert_eq!(closed[0].report.closed_quantity, dec!(0.05));
            }
            other => panic!("expected emergency close, got {:?}", other),
        }
        let submitted = exchange.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].symbol, "ETH");
        assert_eq!(submitted[0].side, Side::Sell);
        assert_eq!(submitted[0].quantity, dec!(0.05));
        // position actually flat afterwards
        assert_eq!(
            exchange.positions.lock().unwrap().get("ETH").copied(),
            Some(Decimal::ZERO)
        );
    }

    #[tokio::test]
    async fn both_filled_verifies_against_exchange_not_reports() {
        let exchange = Arc::new(StatefulExchange::with_positions(&[
            ("ETH", dec!(0.05)),
            ("SOL", dec!(-1.2)),
        ]));
        let reconciler = reconciler_for(exchange).await;
        let leg_a = LegExecution {
            instrument: eth(),
            side: Side::Buy,
            outcome: filled_outcome(dec!(0.05), dec!(2258.20)),
        };
        let leg_b = LegExecution {
            instrument: sol(),
            side: Side::Sell,
            outcome: filled_outcome(dec!(1.2), dec!(95.50)),
        };
        let result = reconciler.reconcile_after_build(&leg_a, &leg_b).await.unwrap();
        assert!(matches!(result, ReconcileResult::BothVerified));
    }

    #[tokio::test]
    async fn both_filled_but_position_missing_is_mismatch() {
        // Orders claim success; the exchange shows nothing landed on SOL.
        let exchange = Arc::new(StatefulExchange::with_positions(&[("ETH", dec!(0.05))]));
        let reconciler = reconciler_for(exchange).await;
        let leg_a = LegExecution {
            instrument: eth(),
            side: Side::Buy,
            outcome: filled_outcome(dec!(0.05), dec!(2258.20)),
        };
        let leg_b = LegExecution {
            instrument: sol(),
            side: Side::Sell,
            outcome: filled_outcome(dec!(1.2), dec!(95.50)),
        };
        let err = reconciler
            .reconcile_after_build(&leg_a, &leg_b)
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::PositionMismatch { .. }));
    }

    #[tokio::test]
    async fn force_close_exhaustion_raises_manual_intervention() {
        let exchange = Arc::new(StatefulExchange::with_positions(&[("ETH", dec!(0.05))]));
        *exchange.fill_portion.lock().unwrap() = Decimal::ZERO;
        let reconciler = reconciler_for(exchange.clone()).await;
        let err = reconciler
            .force_close(&eth(), Side::Sell, dec!(0.05))
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::ManualInterventionRequired { .. }));
        // 3 escalating IOC attempts plus the FOK last resort
        let submitted = exchange.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 4);
        assert_eq!(submitted[3].kind, SubmitKind::FillOrKill);
    }

    #[tokio::test]
    async fn refuse_build_when_position_dirty() {
        let exchange = Arc::new(StatefulExchange::with_positions(&[("ETH", dec!(0.02))]));
        let reconciler = reconciler_for(exchange).await;
        let err = reconciler
            .refuse_build_if_unclean(&["ETH", "SOL"])
            .await
            .unwrap_err();
        match err {
            TradeError::PositionMismatch { symbol, actual, .. } => {
                assert_eq!(symbol, "ETH");
                assert_eq!(actual, dec!(0.02));
            }
            other => panic!("expected position mismatch, got {}", other),
        }
    }

    #[tokio::test]
    async fn refuse_build_accepts_dust_within_tolerance() {
        let exchange = Arc::new(StatefulExchange::with_positions(&[("ETH", dec!(0.0009))]));
        let reconciler = reconciler_for(exchange).await;
        assert!(reconciler
            .refuse_build_if_unclean(&["ETH", "SOL"])
            .await
            .is_ok());
    }
}

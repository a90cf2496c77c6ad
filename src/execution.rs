use crate::error::TradeError;
use crate::exchange::{
    ExchangeApi, ExchangeError, InstrumentMeta, OrderHandle, OrderStatusReport, Side, SubmitKind,
};
use crate::market::MarketDataCache;
use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const DEFAULT_MIN_FILL_RATIO: &str = "0.95";
const DEFAULT_POST_ONLY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IOC_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_MARKET_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_SUBMIT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_SUBMIT_BACKOFF_MS: u64 = 250;

/// Liquidity role of the fill that actually happened, not the one the
/// policy hoped for. Accounting picks the fee rate from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillRole {
    Maker,
    Taker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Filled,
    PartiallyFilled,
    Expired,
    Rejected,
}

/// How an intent prices itself against the book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricePolicy {
    /// Rest exactly at the same-side touch; the venue rejects a cross.
    PostOnly,
    /// Cross by the minimum needed to match the resting quote; unfilled
    /// remainder cancels immediately.
    IocAtTouch,
    /// Take whatever is needed, bounded by a protective limit this many
    /// basis points through the touch. Exceeding the bound is a failure,
    /// not a worse fill.
    Market { max_slippage_bps: u32 },
    /// Fixed-size chunks submitted sequentially, widening the limit by one
    /// tick per chunk that fails to fill completely.
    IterativeChunked {
        chunk_size: Decimal,
        max_iterations: u32,
    },
}

/// One request to trade. Consumed exactly once by `place_order`; a retry is
/// a new intent, never a mutation of this one.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub instrument: InstrumentMeta,
    pub side: Side,
    pub quantity: Decimal,
    pub policy: PricePolicy,
}

/// Terminal result of one intent. Fields are private so that the
/// `success == true ⇒ filled_quantity > 0` contract holds by construction:
/// there is no way to build a successful outcome with a zero fill.
#[derive(Debug, Clone)]
pub struct OrderOutcome {
    success: bool,
    status: OutcomeStatus,
    filled_quantity: Decimal,
    avg_fill_price: Option<Decimal>,
    fill_role: Option<FillRole>,
    error_detail: Option<String>,
}

impl OrderOutcome {
    /// Classify a terminal fill state against the requested quantity. A
    /// zero fill is never a success regardless of what the venue claimed.
    pub fn settle(
        requested: Decimal,
        filled: Decimal,
        avg_fill_price: Option<Decimal>,
        role: FillRole,
        min_fill_ratio: Decimal,
        detail: Option<String>,
    ) -> Self {
        if filled <= Decimal::ZERO {
            return Self {
                success: false,
                status: OutcomeStatus::Expired,
                filled_quantity: Decimal::ZERO,
                avg_fill_price: None,
                fill_role: None,
                error_detail: detail,
            };
        }
        let success = filled >= requested * min_fill_ratio;
        let status = if filled >= requested {
            OutcomeStatus::Filled
        } else {
            OutcomeStatus::PartiallyFilled
        };
        Self {
            success,
            status,
            filled_quantity: filled,
            avg_fill_price,
            fill_role: Some(role),
            error_detail: detail,
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            status: OutcomeStatus::Rejected,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            fill_role: None,
            error_detail: Some(detail.into()),
        }
    }

    pub fn expired(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            status: OutcomeStatus::Expired,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            fill_role: None,
            error_detail: Some(detail.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn status(&self) -> OutcomeStatus {
        self.status
    }

    pub fn filled_quantity(&self) -> Decimal {
        self.filled_quantity
    }

    pub fn avg_fill_price(&self) -> Option<Decimal> {
        self.avg_fill_price
    }

    pub fn fill_role(&self) -> Option<FillRole> {
        self.fill_role
    }

    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    /// The check downstream code uses instead of `success()` alone. For an
    /// outcome built by this engine the two agree; for a value smuggled in
    /// by a faulty adapter this still refuses a success without a fill.
    pub fn is_effective(&self) -> bool {
        self.success && self.filled_quantity > Decimal::ZERO
    }

    pub fn any_fill(&self) -> bool {
        self.filled_quantity > Decimal::ZERO
    }

    /// Escape hatch for tests that need to model a misbehaving adapter.
    #[cfg(test)]
    pub fn raw_for_test(
        success: bool,
        status: OutcomeStatus,
        filled_quantity: Decimal,
        avg_fill_price: Option<Decimal>,
    ) -> Self {
        Self {
            success,
            status,
            filled_quantity,
            avg_fill_price,
            fill_role: None,
            error_detail: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub min_fill_ratio: Decimal,
    pub post_only_timeout: Duration,
    pub ioc_timeout: Duration,
    pub market_timeout: Duration,
    pub poll_interval: Duration,
    pub submit_max_attempts: u32,
    pub submit_backoff: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_fill_ratio: DEFAULT_MIN_FILL_RATIO.parse().unwrap(),
            post_only_timeout: Duration::from_secs(DEFAULT_POST_ONLY_TIMEOUT_SECS),
            ioc_timeout: Duration::from_millis(DEFAULT_IOC_TIMEOUT_MS),
            market_timeout: Duration::from_millis(DEFAULT_MARKET_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            submit_max_attempts: DEFAULT_SUBMIT_MAX_ATTEMPTS,
            submit_backoff: Duration::from_millis(DEFAULT_SUBMIT_BACKOFF_MS),
        }
    }
}

/// Turns intents into venue orders and terminal outcomes. One engine serves
/// every instrument; venue differences arrive as `InstrumentMeta` data, not
/// as separate code paths.
pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeApi>,
    market: Arc<MarketDataCache>,
    cfg: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        market: Arc<MarketDataCache>,
        cfg: ExecutionConfig,
    ) -> Self {
        Self {
            exchange,
            market,
            cfg,
        }
    }

    pub fn min_fill_ratio(&self) -> Decimal {
        self.cfg.min_fill_ratio
    }

    /// Execute one intent to a terminal outcome. Rejections, expiries and
    /// under-fills come back as `Ok(outcome)` with a distinguishing status;
    /// `Err` means the attempt could not even be made (no market data, or
    /// transport dead after bounded retries).
    pub async fn place_order(&self, intent: OrderIntent) -> Result<OrderOutcome, TradeError> {
        if intent.quantity <= Decimal::ZERO {
            return Ok(OrderOutcome::rejected("non-positive quantity"));
        }
        let quantity = quantize_size_floor(
            intent.quantity,
            intent.instrument.size_step,
            intent.instrument.min_order,
        );
        if quantity <= Decimal::ZERO {
            return Ok(OrderOutcome::rejected(format!(
                "{} quantity {} below size step {}",
                intent.instrument.symbol, intent.quantity, intent.instrument.size_step
            )));
        }

        match intent.policy.clone() {
            PricePolicy::PostOnly => self.place_post_only(&intent.instrument, intent.side, quantity).await,
            PricePolicy::IocAtTouch => {
                self.place_ioc(&intent.instrument, intent.side, quantity, 0).await
            }
            PricePolicy::Market { max_slippage_bps } => {
                self.place_market(&intent.instrument, intent.side, quantity, max_slippage_bps)
                    .await
            }
            PricePolicy::IterativeChunked {
                chunk_size,
                max_iterations,
            } => {
                self.place_chunked(&intent.instrument, intent.side, quantity, chunk_size, max_iterations)
                    .await
            }
        }
    }

    async fn place_post_only(
        &self,
        instrument: &InstrumentMeta,
        side: Side,
        quantity: Decimal,
    ) -> Result<OrderOutcome, TradeError> {
        // Fresh quote immediately before submission, never one carried over
        // from an earlier step.
        let quote = self.market.get_quote(&instrument.symbol).await?;
        let touch = match side {
            Side::Buy => quote.bid,
            Side::Sell => quote.ask,
        };
        let price = round_price_by_tick(touch, instrument.tick_size, side);
        log::debug!(
            "[ORDER] {} post-only {} qty={} price={} (touch bid={} ask={})",
            instrument.symbol,
            side,
            quantity,
            price,
            quote.bid,
            quote.ask
        );
        let handle = match self
            .submit_with_retry(
                &instrument.symbol,
                side,
                quantity,
                Some(price),
                SubmitKind::PostOnly,
            )
            .await
        {
            Ok(handle) => handle,
            // A would-cross rejection surfaces as-is; the engine never
            // silently converts a post-only intent into a taker fill.
            Err(ExchangeError::Rejected(reason)) => {
                log::warn!(
                    "[ORDER] {} post-only rejected: {}",
                    instrument.symbol,
                    reason
                );
                return Ok(OrderOutcome::rejected(reason));
            }
            Err(err) => return Err(TradeError::Exchange(err)),
        };
        let report = self
            .await_terminal(&instrument.symbol, &handle, self.cfg.post_only_timeout)
            .await?;
        if report.rejected {
            return Ok(OrderOutcome::rejected(
                report
                    .reject_reason
                    .unwrap_or_else(|| "rejected by venue".to_string()),
            ));
        }
        Ok(OrderOutcome::settle(
            quantity,
            report.filled_size,
            report.avg_fill_price,
            FillRole::Maker,
            self.cfg.min_fill_ratio,
            None,
        ))
    }

    async fn place_ioc(
        &self,
        instrument: &InstrumentMeta,
        side: Side,
        quantity: Decimal,
        extra_ticks: u32,
    ) -> Result<OrderOutcome, TradeError> {
        let quote = self.market.get_quote(&instrument.symbol).await?;
        // The resting touch on the far side: the minimum cross, not an
        // aggressive offset.
        let touch = match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        let price = price_with_tick_offset(touch, instrument.tick_size, side, extra_ticks);
        log::debug!(
            "[ORDER] {} ioc {} qty={} price={} extra_ticks={}",
            instrument.symbol,
            side,
            quantity,
            price,
            extra_ticks
        );
        let handle = match self
            .submit_with_retry(&instrument.symbol, side, quantity, Some(price), SubmitKind::Ioc)
            .await
        {
            Ok(handle) => handle,
            Err(ExchangeError::Rejected(reason)) => return Ok(OrderOutcome::rejected(reason)),
            Err(err) => return Err(TradeError::Exchange(err)),
        };
        let report = self
            .await_terminal(&instrument.symbol, &handle, self.cfg.ioc_timeout)
            .await?;
        if report.rejected {
            return Ok(OrderOutcome::rejected(
                report
                    .reject_reason
                    .unwrap_or_else(|| "rejected by venue".to_string()),
            ));
        }
        Ok(OrderOutcome::settle(
            quantity,
            report.filled_size,
            report.avg_fill_price,
            FillRole::Taker,
            self.cfg.min_fill_ratio,
            None,
        ))
    }

    async fn place_market(
        &self,
        instrument: &InstrumentMeta,
        side: Side,
        quantity: Decimal,
        max_slippage_bps: u32,
    ) -> Result<OrderOutcome, TradeError> {
        let quote = self.market.get_quote(&instrument.symbol).await?;
        let touch = match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        // Protective limit at the slippage bound; the venue cannot fill us
        // worse than this, so exceeding the bound shows up as a non-fill.
        let factor = Decimal::from(max_slippage_bps) / Decimal::from(10_000);
        let bound = match side {
            Side::Buy => touch * (Decimal::ONE + factor),
            Side::Sell => touch * (Decimal::ONE - factor),
        };
        let price = round_price_by_tick(bound, instrument.tick_size, side);
        log::debug!(
            "[ORDER] {} market-equivalent {} qty={} touch={} bound={}",
            instrument.symbol,
            side,
            quantity,
            touch,
            price
        );
        let handle = match self
            .submit_with_retry(&instrument.symbol, side, quantity, Some(price), SubmitKind::Ioc)
            .await
        {
            Ok(handle) => handle,
            Err(ExchangeError::Rejected(reason)) => return Ok(OrderOutcome::rejected(reason)),
            Err(err) => return Err(TradeError::Exchange(err)),
        };
        let report = self
            .await_terminal(&instrument.symbol, &handle, self.cfg.market_timeout)
            .await?;
        if report.rejected {
            return Ok(OrderOutcome::rejected(
                report
                    .reject_reason
                    .unwrap_or_else(|| "rejected by venue".to_string()),
            ));
        }
        let detail = if report.filled_size <= Decimal::ZERO {
            Some(format!(
                "no fill within {} bps of touch {}",
                max_slippage_bps, touch
            ))
        } else {
            None
        };
        Ok(OrderOutcome::settle(
            quantity,
            report.filled_size,
            report.avg_fill_price,
            FillRole::Taker,
            self.cfg.min_fill_ratio,
            detail,
        ))
    }

    async fn place_chunked(
        &self,
        instrument: &InstrumentMeta,
        side: Side,
        target: Decimal,
        chunk_size: Decimal,
        max_iterations: u32,
    ) -> Result<OrderOutcome, TradeError> {
        let chunk_size = quantize_size_floor(chunk_size, instrument.size_step, instrument.min_order);
        if chunk_size <= Decimal::ZERO {
            return Ok(OrderOutcome::rejected(format!(
                "{} chunk size below size step {}",
                instrument.symbol, instrument.size_step
            )));
        }
        let mut filled_total = Decimal::ZERO;
        let mut fill_notional = Decimal::ZERO;
        let mut ticks_wide: u32 = 0;

        for iteration in 1..=max_iterations {
            if filled_total >= target * self.cfg.min_fill_ratio {
                break;
            }
            let remaining = target - filled_total;
            // Fixed-size chunks on purpose: sizing chunks off the shrinking
            // remainder degenerates into dust orders.
            let chunk = chunk_size.min(quantize_size_floor(
                remaining,
                instrument.size_step,
                instrument.min_order,
            ));
            if chunk <= Decimal::ZERO {
                break;
            }
            let outcome = self.place_ioc(instrument, side, chunk, ticks_wide).await?;
            let chunk_filled = outcome.filled_quantity();
            if chunk_filled > Decimal::ZERO {
                filled_total += chunk_filled;
                if let Some(px) = outcome.avg_fill_price() {
                    fill_notional += chunk_filled * px;
                }
            }
            if chunk_filled < chunk {
                ticks_wide = ticks_wide.saturating_add(1);
            }
            log::info!(
                "[ORDER] {} chunk {}/{} filled={} total={}/{} ticks_wide={}",
                instrument.symbol,
                iteration,
                max_iterations,
                chunk_filled,
                filled_total,
                target,
                ticks_wide
            );
        }

        let vwap = if filled_total > Decimal::ZERO {
            Some(fill_notional / filled_total)
        } else {
            None
        };
        let detail = if filled_total < target * self.cfg.min_fill_ratio {
            Some(format!(
                "chunked fill stalled at {}/{} after {} iterations",
                filled_total, target, max_iterations
            ))
        } else {
            None
        };
        Ok(OrderOutcome::settle(
            target,
            filled_total,
            vwap,
            FillRole::Taker,
            self.cfg.min_fill_ratio,
            detail,
        ))
    }

    /// Closing IOC for the unwind controller: touch price pushed through
    /// the book by `extra_ticks`. The controller owns the escalation
    /// schedule; this just prices one rung of it.
    pub(crate) async fn place_close_ioc(
        &self,
        instrument: &InstrumentMeta,
        side: Side,
        quantity: Decimal,
        extra_ticks: u32,
    ) -> Result<OrderOutcome, TradeError> {
        self.place_ioc(instrument, side, quantity, extra_ticks).await
    }

    /// Last-resort fill-or-kill crossing by a fixed larger offset.
    pub(crate) async fn place_close_fok(
        &self,
        instrument: &InstrumentMeta,
        side: Side,
        quantity: Decimal,
        cross_ticks: u32,
    ) -> Result<OrderOutcome, TradeError> {
        let quote = self.market.get_quote(&instrument.symbol).await?;
        let touch = match side {
            Side::Buy => quote.ask,
            Side::Sell => quote.bid,
        };
        let price = price_with_tick_offset(touch, instrument.tick_size, side, cross_ticks);
        log::warn!(
            "[ORDER] {} fok {} qty={} price={} cross_ticks={}",
            instrument.symbol,
            side,
            quantity,
            price,
            cross_ticks
        );
        let handle = match self
            .submit_with_retry(
                &instrument.symbol,
                side,
                quantity,
                Some(price),
                SubmitKind::FillOrKill,
            )
            .await
        {
            Ok(handle) => handle,
            Err(ExchangeError::Rejected(reason)) => return Ok(OrderOutcome::rejected(reason)),
            Err(err) => return Err(TradeError::Exchange(err)),
        };
        let report = self
            .await_terminal(&instrument.symbol, &handle, self.cfg.ioc_timeout)
            .await?;
        Ok(OrderOutcome::settle(
            quantity,
            report.filled_size,
            report.avg_fill_price,
            FillRole::Taker,
            Decimal::ONE,
            None,
        ))
    }

    async fn submit_with_retry(
        &self,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        kind: SubmitKind,
    ) -> Result<OrderHandle, ExchangeError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .exchange
                .submit_order(symbol, side, quantity, price, kind)
                .await
            {
                Ok(handle) => return Ok(handle),
                Err(err) if err.is_transient() && attempt < self.cfg.submit_max_attempts => {
                    log::warn!(
                        "[ORDER] {} submit attempt {}/{} failed transiently: {}",
                        symbol,
                        attempt,
                        self.cfg.submit_max_attempts,
                        err
                    );
                    sleep(self.cfg.submit_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Poll to a terminal order state. On timeout an explicit cancel is
    /// issued and awaited, then the order is re-read: the fill state, not
    /// the cancel confirmation, decides the outcome.
    async fn await_terminal(
        &self,
        symbol: &str,
        handle: &OrderHandle,
        timeout: Duration,
    ) -> Result<OrderStatusReport, TradeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let report = self
                .exchange
                .order_status(symbol, &handle.order_id)
                .await
                .map_err(TradeError::Exchange)?;
            if report.rejected || !report.is_open {
                return Ok(report);
            }
            if Instant::now() >= deadline {
                if let Err(err) = self.exchange.cancel_order(symbol, &handle.order_id).await {
                    log::warn!(
                        "[ORDER] {} cancel of {} failed ({}); reading fill state anyway",
                        symbol,
                        handle.order_id,
                        err
                    );
                }
                let final_report = self
                    .exchange
                    .order_status(symbol, &handle.order_id)
                    .await
                    .map_err(TradeError::Exchange)?;
                return Ok(final_report);
            }
            sleep(self.cfg.poll_interval).await;
        }
    }
}

/// Round a price onto the tick grid, toward the passive side: a buy never
/// rounds up through the book, a sell never rounds down.
pub fn round_price_by_tick(price: Decimal, tick: Decimal, side: Side) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let rounding = match side {
        Side::Buy => RoundingStrategy::ToNegativeInfinity,
        Side::Sell => RoundingStrategy::ToPositiveInfinity,
    };
    let mut multiples = (price / tick).round_dp_with_strategy(0, rounding);
    if multiples < Decimal::ONE {
        multiples = Decimal::ONE;
    }
    let rounded = multiples * tick;
    rounded.round_dp_with_strategy(tick.scale(), RoundingStrategy::ToZero)
}

/// Touch price pushed `ticks` further through the book (more aggressive).
pub fn price_with_tick_offset(touch: Decimal, tick: Decimal, side: Side, ticks: u32) -> Decimal {
    let offset = tick * Decimal::from(ticks);
    let raw = match side {
        Side::Buy => touch + offset,
        Side::Sell => (touch - offset).max(tick),
    };
    // Aggressive offsets round toward the far side so the offset survives
    // the grid.
    round_price_by_tick(raw, tick, side.opposite())
}

pub fn quantize_size_floor(size: Decimal, step: Decimal, min_order: Option<Decimal>) -> Decimal {
    if step <= Decimal::ZERO || size <= Decimal::ZERO {
        return size.max(Decimal::ZERO);
    }
    let multiples = (size / step).trunc();
    let quantized = multiples * step;
    if let Some(mo) = min_order {
        if quantized < mo {
            return Decimal::ZERO;
        }
    }
    quantized.round_dp_with_strategy(step.scale(), RoundingStrategy::ToZero)
}

pub fn quantize_size_ceil(size: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO || size <= Decimal::ZERO {
        return size.max(Decimal::ZERO);
    }
    let multiples = (size / step).round_dp_with_strategy(0, RoundingStrategy::ToPositiveInfinity);
    (multiples * step).round_dp_with_strategy(step.scale(), RoundingStrategy::ToZero)
}

use crate::exchange::{InstrumentMeta, Side};
use crate::execution::FillRole;
use rust_decimal::Decimal;

/// One executed fill as the accounting sees it: what traded, at what price,
/// and whether it actually made or took liquidity.
#[derive(Debug, Clone)]
pub struct LegFill {
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub role: FillRole,
    pub ts_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PnlBreakdown {
    pub pnl_no_fee: Decimal,
    pub pnl_with_fee: Decimal,
    pub total_fees: Decimal,
}

fn fee_rate(instrument: &InstrumentMeta, role: FillRole) -> Decimal {
    match role {
        FillRole::Maker => instrument.maker_fee_rate,
        FillRole::Taker => instrument.taker_fee_rate,
    }
}

fn fee_for(fill: &LegFill, instruments: &[InstrumentMeta]) -> Option<Decimal> {
    let instrument = instruments.iter().find(|i| i.symbol == fill.symbol)?;
    Some(fill.price * fill.quantity * fee_rate(instrument, fill.role))
}

/// Realized PnL for one set of entry/exit fills, separately with and
/// without fees. A leg entered with a buy is long (exit − entry); entered
/// with a sell is short (entry − exit). Fees accrue on every fill at the
/// rate of the role that fill actually executed with. Everything stays in
/// `Decimal`; no float ever touches the money path.
pub fn compute_cycle_pnl(
    entries: &[LegFill],
    exits: &[LegFill],
    instruments: &[InstrumentMeta],
) -> Option<PnlBreakdown> {
    let mut pnl_no_fee = Decimal::ZERO;
    let mut total_fees = Decimal::ZERO;

    for entry in entries {
        let exit = exits.iter().find(|e| e.symbol == entry.symbol)?;
        let leg_pnl = match entry.side {
            Side::Buy => (exit.price - entry.price) * entry.quantity,
            Side::Sell => (entry.price - exit.price) * entry.quantity,
        };
        pnl_no_fee += leg_pnl;
        total_fees += fee_for(entry, instruments)?;
        total_fees += fee_for(exit, instruments)?;
    }

    Some(PnlBreakdown {
        pnl_no_fee,
        pnl_with_fee: pnl_no_fee - total_fees,
        total_fees,
    })
}

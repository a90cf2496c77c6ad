use crate::cycle::CycleRecord;
use crate::exchange::Side;
use crate::execution::{FillRole, OrderOutcome, OutcomeStatus};
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Schema versions are bumped when a column is appended. Columns are only
/// ever appended at the end — never inserted or reordered — so older rows
/// stay parseable by position. v2 of the cycle schema appended
/// `dn_direction`.
const ORDER_SCHEMA_VERSION: u32 = 1;
const CYCLE_SCHEMA_VERSION: u32 = 2;

const ORDER_HEADER: &str = "schema_version,ts_ms,symbol,side,status,success,requested_qty,\
filled_qty,avg_price,fill_role,error_detail";
const CYCLE_HEADER: &str = "schema_version,cycle_id,started_ts_ms,completed_ts_ms,\
symbol_a,entry_price_a,entry_qty_a,exit_price_a,exit_qty_a,\
symbol_b,entry_price_b,entry_qty_b,exit_price_b,exit_qty_b,\
pnl_no_fee,pnl_with_fee,total_fees,emergency_unwind,dn_direction";

struct CsvAppender {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvAppender {
    fn open(path: &Path, header: &str) -> Result<Self> {
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open ledger {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "{}", header)
                .with_context(|| format!("failed to write header to {}", path.display()))?;
            writer.flush()?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    fn append(&mut self, row: &str) -> Result<()> {
        writeln!(self.writer, "{}", row)
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Commas inside free-text fields would shift every later column.
fn sanitize(field: &str) -> String {
    field.replace([',', '\n'], ";")
}

fn status_label(status: OutcomeStatus) -> &'static str {
    match status {
        OutcomeStatus::Filled => "FILLED",
        OutcomeStatus::PartiallyFilled => "PARTIALLY_FILLED",
        OutcomeStatus::Expired => "EXPIRED",
        OutcomeStatus::Rejected => "REJECTED",
    }
}

fn role_label(role: Option<FillRole>) -> &'static str {
    match role {
        Some(FillRole::Maker) => "maker",
        Some(FillRole::Taker) => "taker",
        None => "",
    }
}

/// Append-only trade ledger: one row per terminal order outcome, one row
/// per completed cycle.
pub struct TradeLedger {
    orders: CsvAppender,
    cycles: CsvAppender,
}

impl TradeLedger {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create ledger dir {}", dir.display()))?;
        Ok(Self {
            orders: CsvAppender::open(&dir.join("orders.csv"), ORDER_HEADER)?,
            cycles: CsvAppender::open(&dir.join("cycles.csv"), CYCLE_HEADER)?,
        })
    }

    pub fn append_order(
        &mut self,
        ts_ms: i64,
        symbol: &str,
        side: Side,
        requested_qty: rust_decimal::Decimal,
        outcome: &OrderOutcome,
    ) -> Result<()> {
        let row = format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            ORDER_SCHEMA_VERSION,
            ts_ms,
            sanitize(symbol),
            side,
            status_label(outcome.status()),
            outcome.success(),
            requested_qty,
            outcome.filled_quantity(),
            outcome
                .avg_fill_price()
                .map(|p| p.to_string())
                .unwrap_or_default(),
            role_label(outcome.fill_role()),
            sanitize(outcome.error_detail().unwrap_or(""))
        );
        self.orders.append(&row)
    }

    pub fn append_cycle(&mut self, record: &CycleRecord) -> Result<()> {
        let leg = |idx: usize| {
            let entry = record.entries.get(idx);
            let exit = entry.and_then(|e| record.exits.iter().find(|x| x.symbol == e.symbol));
            format!(
                "{},{},{},{},{}",
                entry.map(|e| sanitize(&e.symbol)).unwrap_or_default(),
                entry.map(|e| e.price.to_string()).unwrap_or_default(),
                entry.map(|e| e.quantity.to_string()).unwrap_or_default(),
                exit.map(|x| x.price.to_string()).unwrap_or_default(),
                exit.map(|x| x.quantity.to_string()).unwrap_or_default(),
            )
        };
        let row = format!(
            "{},{},{},{},{},{},{},{},{},{},{}",
            CYCLE_SCHEMA_VERSION,
            record.cycle_id,
            record.started_at_ms,
            record.completed_at_ms,
            leg(0),
            leg(1),
            record.pnl_no_fee,
            record.pnl_with_fee,
            record.total_fees,
            record.emergency_unwind_triggered,
            record.direction,
        );
        self.cycles.append(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::DnDirection;
    use crate::execution::FillRole;
    use crate::pnl::LegFill;
    use rust_decimal_macros::dec;

    fn record() -> CycleRecord {
        CycleRecord {
            cycle_id: 7,
            direction: DnDirection::AForward,
            entries: vec![
                LegFill {
                    symbol: "ETH".to_string(),
                    side: Side::Buy,
                    quantity: dec!(0.05),
                    price: dec!(2258.20),
                    role: FillRole::Maker,
                    ts_ms: 1,
                },
                LegFill {
                    symbol: "SOL".to_string(),
                    side: Side::Sell,
                    quantity: dec!(1.2),
                    price: dec!(95.12),
                    role: FillRole::Maker,
                    ts_ms: 1,
                },
            ],
            exits: vec![
                LegFill {
                    symbol: "ETH".to_string(),
                    side: Side::Sell,
                    quantity: dec!(0.05),
                    price: dec!(2259.50),
                    role: FillRole::Taker,
                    ts_ms: 2,
                },
                LegFill {
                    symbol: "SOL".to_string(),
                    side: Side::Buy,
                    quantity: dec!(1.2),
                    price: dec!(94.87),
                    role: FillRole::Taker,
                    ts_ms: 2,
                },
            ],
            pnl_no_fee: dec!(0.365),
            pnl_with_fee: dec!(0.250),
            total_fees: dec!(0.115),
            emergency_unwind_triggered: false,
            started_at_ms: 1,
            completed_at_ms: 2,
        }
    }

    #[test]
    fn header_written_once_and_rows_append() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = TradeLedger::open(dir.path()).unwrap();
            ledger.append_cycle(&record()).unwrap();
        }
        {
            let mut ledger = TradeLedger::open(dir.path()).unwrap();
            ledger.append_cycle(&record()).unwrap();
        }
        let content = std::fs::read_to_string(dir.path().join("cycles.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("schema_version,"));
        assert!(lines[1].starts_with("2,7,"));
        assert_eq!(lines[1], lines[2]);
    }

    #[test]
    fn dn_direction_is_the_last_column() {
        let header_cols: Vec<&str> = CYCLE_HEADER.split(',').collect();
        assert_eq!(*header_cols.last().unwrap(), "dn_direction");

        let dir = tempfile::tempdir().unwrap();
        let mut ledger = TradeLedger::open(dir.path()).unwrap();
        ledger.append_cycle(&record()).unwrap();
        let content = std::fs::read_to_string(dir.path().join("cycles.csv")).unwrap();
        let row = content.lines().nth(1).unwrap();
        let cols: Vec<&str> = row.split(',').collect();
        assert_eq!(cols.len(), header_cols.len());
        assert_eq!(*cols.last().unwrap(), "long_a_short_b");
        // emergency flag sits immediately before, as in schema v1
        assert_eq!(cols[cols.len() - 2], "false");
    }

    #[test]
    fn order_rows_carry_status_and_fill_role() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = TradeLedger::open(dir.path()).unwrap();
        let outcome = OrderOutcome::settle(
            dec!(0.05),
            dec!(0.05),
            Some(dec!(2258.20)),
            FillRole::Taker,
            dec!(0.95),
            None,
        );
        ledger
            .append_order(123, "ETH", Side::Buy, dec!(0.05), &outcome)
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("orders.csv")).unwrap();
        let row = content.lines().nth(1).unwrap();
        assert_eq!(row, "1,123,ETH,buy,FILLED,true,0.05,0.05,2258.20,taker,");
    }

    #[test]
    fn free_text_commas_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = TradeLedger::open(dir.path()).unwrap();
        let outcome = OrderOutcome::rejected("bad price, bad size");
        ledger
            .append_order(1, "ETH", Side::Sell, dec!(1), &outcome)
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("orders.csv")).unwrap();
        let row = content.lines().nth(1).unwrap();
        assert_eq!(row.split(',').count(), ORDER_HEADER.split(',').count());
    }
}

use chrono::{DateTime, FixedOffset, Utc};
use dnbot::config::BotConfig;
use dnbot::cycle::{CycleConfig, PairCycleEngine, StatusReporter};
use dnbot::exchange::ExchangeApi;
use dnbot::execution::ExecutionEngine;
use dnbot::ledger::TradeLedger;
use dnbot::market::MarketDataCache;
use dnbot::reconcile::Reconciler;
use dnbot::trade::execution::exchange_box::ExchangeBox;
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .expect("Invalid TIMEZONE_OFFSET");
    let offset = FixedOffset::east_opt(offset_seconds).expect("Invalid offset");
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
                .unwrap_or(LevelFilter::Debug),
        )
        .init();

    log::info!("Starting delta-neutral pair cycles...");
    let cfg = BotConfig::from_env_or_yaml().expect("invalid bot config");
    run(cfg)
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("{:?}", e)))
}

async fn run(cfg: BotConfig) -> anyhow::Result<()> {
    let venue = if cfg.dry_run && cfg.venue != "paper" {
        log::warn!(
            "[CONFIG] DRY_RUN forces the paper venue (configured '{}')",
            cfg.venue
        );
        "paper".to_string()
    } else {
        cfg.venue.clone()
    };
    log::info!(
        "[CONFIG] venue={} pair={}/{} notional={} iterations={} policy={} min_spread_bps={}",
        venue,
        cfg.instrument_a,
        cfg.instrument_b,
        cfg.target_notional,
        cfg.iterations,
        cfg.pricing_policy,
        cfg.min_spread_bps
    );

    let symbols = vec![cfg.instrument_a.clone(), cfg.instrument_b.clone()];
    let exchange: Arc<dyn ExchangeApi> =
        Arc::new(ExchangeBox::create(&venue, &symbols).await.map_err(|e| {
            anyhow::anyhow!("failed to initialize exchange: {}", e)
        })?);
    exchange
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start exchange: {}", e))?;

    let instrument_a = exchange
        .instrument_meta(&cfg.instrument_a)
        .await
        .map_err(|e| anyhow::anyhow!("metadata for {}: {}", cfg.instrument_a, e))?;
    let instrument_b = exchange
        .instrument_meta(&cfg.instrument_b)
        .await
        .map_err(|e| anyhow::anyhow!("metadata for {}: {}", cfg.instrument_b, e))?;

    let market = Arc::new(
        MarketDataCache::start(exchange.clone(), &symbols, cfg.quote_staleness()).await?,
    );

    if cfg.observe_only {
        log::warn!("[CONFIG] OBSERVE_ONLY set; streaming quotes, no orders will be placed");
        loop {
            for symbol in &symbols {
                match market.get_quote(symbol).await {
                    Ok(q) => log::info!(
                        "[MARKET] {} bid={}x{} ask={}x{} spread={:.2}bps",
                        symbol,
                        q.bid,
                        q.bid_size,
                        q.ask,
                        q.ask_size,
                        q.spread_bps()
                    ),
                    Err(e) => log::warn!("[MARKET] {} unavailable: {}", symbol, e),
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        }
    }

    let execution = Arc::new(ExecutionEngine::new(
        exchange.clone(),
        market.clone(),
        cfg.execution_config(),
    ));
    let reconciler = Reconciler::new(exchange.clone(), execution.clone(), cfg.reconcile_config());
    let ledger = match &cfg.ledger_dir {
        Some(dir) => Some(TradeLedger::open(&PathBuf::from(dir))?),
        None => None,
    };
    let status = cfg
        .status_file
        .as_ref()
        .map(|path| StatusReporter::new(PathBuf::from(path)));

    let mut engine = PairCycleEngine::new(
        exchange,
        market,
        execution,
        reconciler,
        instrument_a,
        instrument_b,
        CycleConfig {
            target_notional: cfg.target_notional,
            min_spread_bps: cfg.min_spread_bps,
            entry_policy: cfg.entry_policy()?,
            unwind_policy: cfg.exit_policy()?,
            force_close_on_startup: cfg.force_close_on_startup,
        },
        ledger,
        status,
    );

    let records = engine
        .run(cfg.iterations)
        .await
        .map_err(|e| anyhow::anyhow!("cycle run halted: {}", e))?;
    let pnl_with_fee: rust_decimal::Decimal = records.iter().map(|r| r.pnl_with_fee).sum();
    let fees: rust_decimal::Decimal = records.iter().map(|r| r.total_fees).sum();
    log::info!(
        "[CYCLE] run complete: {} cycles, pnl_with_fee={} fees={}",
        records.len(),
        pnl_with_fee,
        fees
    );
    Ok(())
}

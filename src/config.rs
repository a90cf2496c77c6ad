use crate::execution::{ExecutionConfig, PricePolicy};
use crate::reconcile::{ReconcileConfig, RetryPolicy};
use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

const DEFAULT_VENUE: &str = "paper";
const DEFAULT_INSTRUMENT_A: &str = "ETH";
const DEFAULT_INSTRUMENT_B: &str = "SOL";
const DEFAULT_TARGET_NOTIONAL: &str = "100";
const DEFAULT_ITERATIONS: u32 = 10;
const DEFAULT_MIN_SPREAD_BPS: &str = "0";
const DEFAULT_PRICING_POLICY: &str = "ioc";
const DEFAULT_UNWIND_POLICY: &str = "ioc";
const DEFAULT_MAX_SLIPPAGE_BPS: u32 = 10;
const DEFAULT_CHUNK_SIZE: &str = "0.1";
const DEFAULT_MAX_CHUNK_ITERATIONS: u32 = 20;
const DEFAULT_MIN_FILL_RATIO: &str = "0.95";
const DEFAULT_POSITION_TOLERANCE: &str = "0.001";
const DEFAULT_SETTLEMENT_DELAY_MS: u64 = 300;
const DEFAULT_VERIFY_ATTEMPTS: u32 = 3;
const DEFAULT_CLOSE_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_CLOSE_BACKOFF_MS: u64 = 250;
const DEFAULT_ESCALATION_TICKS: u32 = 2;
const DEFAULT_FINAL_CROSS_TICKS: u32 = 10;
const DEFAULT_QUOTE_STALENESS_MS: u64 = 1_500;
const DEFAULT_POST_ONLY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IOC_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_MARKET_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_SUBMIT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_SUBMIT_BACKOFF_MS: u64 = 250;
const DEFAULT_FORCE_CLOSE_ON_STARTUP: bool = true;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct BotYaml {
    venue: Option<String>,
    rest_endpoint: Option<String>,
    web_socket_endpoint: Option<String>,
    dry_run: Option<bool>,
    observe_only: Option<bool>,
    instrument_a: Option<String>,
    instrument_b: Option<String>,
    target_notional_usd: Option<Decimal>,
    iterations: Option<u32>,
    min_spread_bps: Option<Decimal>,
    pricing_policy: Option<String>,
    unwind_policy: Option<String>,
    max_slippage_bps: Option<u32>,
    chunk_size: Option<Decimal>,
    max_chunk_iterations: Option<u32>,
    min_fill_ratio: Option<Decimal>,
    position_tolerance: Option<Decimal>,
    settlement_delay_ms: Option<u64>,
    verify_attempts: Option<u32>,
    close_max_attempts: Option<u32>,
    close_backoff_ms: Option<u64>,
    escalation_ticks: Option<u32>,
    final_cross_ticks: Option<u32>,
    quote_staleness_ms: Option<u64>,
    post_only_timeout_secs: Option<u64>,
    ioc_timeout_ms: Option<u64>,
    market_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    submit_max_attempts: Option<u32>,
    submit_backoff_ms: Option<u64>,
    force_close_on_startup: Option<bool>,
    ledger_dir: Option<String>,
    status_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub venue: String,
    pub rest_endpoint: String,
    pub web_socket_endpoint: String,
    pub dry_run: bool,
    // Safety guard to avoid real orders while observing market data
    pub observe_only: bool,
    pub instrument_a: String,
    pub instrument_b: String,
    pub target_notional: Decimal,
    pub iterations: u32,
    pub min_spread_bps: Decimal,
    pub pricing_policy: String,
    pub unwind_policy: String,
    pub max_slippage_bps: u32,
    pub chunk_size: Decimal,
    pub max_chunk_iterations: u32,
    pub min_fill_ratio: Decimal,
    pub position_tolerance: Decimal,
    pub settlement_delay_ms: u64,
    pub verify_attempts: u32,
    pub close_max_attempts: u32,
    pub close_backoff_ms: u64,
    pub escalation_ticks: u32,
    pub final_cross_ticks: u32,
    pub quote_staleness_ms: u64,
    pub post_only_timeout_secs: u64,
    pub ioc_timeout_ms: u64,
    pub market_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub submit_max_attempts: u32,
    pub submit_backoff_ms: u64,
    pub force_close_on_startup: bool,
    pub ledger_dir: Option<String>,
    pub status_file: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true" || v == "yes"
        })
        .unwrap_or(default)
}

impl BotConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("DNBOT_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open bot config {}", path_ref.display()))?;
        let yaml: BotYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse bot config {}", path_ref.display()))?;

        let mut cfg = BotConfig {
            venue: yaml.venue.unwrap_or_else(|| DEFAULT_VENUE.to_string()),
            rest_endpoint: yaml.rest_endpoint.unwrap_or_default(),
            web_socket_endpoint: yaml.web_socket_endpoint.unwrap_or_default(),
            dry_run: yaml.dry_run.unwrap_or(true),
            observe_only: yaml.observe_only.unwrap_or(false),
            instrument_a: yaml
                .instrument_a
                .unwrap_or_else(|| DEFAULT_INSTRUMENT_A.to_string()),
            instrument_b: yaml
                .instrument_b
                .unwrap_or_else(|| DEFAULT_INSTRUMENT_B.to_string()),
            target_notional: yaml
                .target_notional_usd
                .unwrap_or_else(|| DEFAULT_TARGET_NOTIONAL.parse().unwrap()),
            iterations: yaml.iterations.unwrap_or(DEFAULT_ITERATIONS),
            min_spread_bps: yaml
                .min_spread_bps
                .unwrap_or_else(|| DEFAULT_MIN_SPREAD_BPS.parse().unwrap()),
            pricing_policy: yaml
                .pricing_policy
                .unwrap_or_else(|| DEFAULT_PRICING_POLICY.to_string()),
            unwind_policy: yaml
                .unwind_policy
                .unwrap_or_else(|| DEFAULT_UNWIND_POLICY.to_string()),
            max_slippage_bps: yaml.max_slippage_bps.unwrap_or(DEFAULT_MAX_SLIPPAGE_BPS),
            chunk_size: yaml
                .chunk_size
                .unwrap_or_else(|| DEFAULT_CHUNK_SIZE.parse().unwrap()),
            max_chunk_iterations: yaml
                .max_chunk_iterations
                .unwrap_or(DEFAULT_MAX_CHUNK_ITERATIONS),
            min_fill_ratio: yaml
                .min_fill_ratio
                .unwrap_or_else(|| DEFAULT_MIN_FILL_RATIO.parse().unwrap()),
            position_tolerance: yaml
                .position_tolerance
                .unwrap_or_else(|| DEFAULT_POSITION_TOLERANCE.parse().unwrap()),
            settlement_delay_ms: yaml
                .settlement_delay_ms
                .unwrap_or(DEFAULT_SETTLEMENT_DELAY_MS),
            verify_attempts: yaml.verify_attempts.unwrap_or(DEFAULT_VERIFY_ATTEMPTS),
            close_max_attempts: yaml
                .close_max_attempts
                .unwrap_or(DEFAULT_CLOSE_MAX_ATTEMPTS),
            close_backoff_ms: yaml.close_backoff_ms.unwrap_or(DEFAULT_CLOSE_BACKOFF_MS),
            escalation_ticks: yaml.escalation_ticks.unwrap_or(DEFAULT_ESCALATION_TICKS),
            final_cross_ticks: yaml.final_cross_ticks.unwrap_or(DEFAULT_FINAL_CROSS_TICKS),
            quote_staleness_ms: yaml
                .quote_staleness_ms
                .unwrap_or(DEFAULT_QUOTE_STALENESS_MS),
            post_only_timeout_secs: yaml
                .post_only_timeout_secs
                .unwrap_or(DEFAULT_POST_ONLY_TIMEOUT_SECS),
            ioc_timeout_ms: yaml.ioc_timeout_ms.unwrap_or(DEFAULT_IOC_TIMEOUT_MS),
            market_timeout_ms: yaml.market_timeout_ms.unwrap_or(DEFAULT_MARKET_TIMEOUT_MS),
            poll_interval_ms: yaml.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            submit_max_attempts: yaml
                .submit_max_attempts
                .unwrap_or(DEFAULT_SUBMIT_MAX_ATTEMPTS),
            submit_backoff_ms: yaml.submit_backoff_ms.unwrap_or(DEFAULT_SUBMIT_BACKOFF_MS),
            force_close_on_startup: yaml
                .force_close_on_startup
                .unwrap_or(DEFAULT_FORCE_CLOSE_ON_STARTUP),
            ledger_dir: yaml.ledger_dir,
            status_file: yaml.status_file,
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let cfg = BotConfig {
            venue: env::var("VENUE").unwrap_or_else(|_| DEFAULT_VENUE.to_string()),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or_default(),
            web_socket_endpoint: env::var("WEB_SOCKET_ENDPOINT").unwrap_or_default(),
            dry_run: env_bool("DRY_RUN", true),
            observe_only: env_bool("OBSERVE_ONLY", false),
            instrument_a: env::var("INSTRUMENT_A")
                .unwrap_or_else(|_| DEFAULT_INSTRUMENT_A.to_string()),
            instrument_b: env::var("INSTRUMENT_B")
                .unwrap_or_else(|_| DEFAULT_INSTRUMENT_B.to_string()),
            target_notional: env_parse(
                "TARGET_NOTIONAL_USD",
                DEFAULT_TARGET_NOTIONAL.parse().unwrap(),
            ),
            iterations: env_parse("ITERATIONS", DEFAULT_ITERATIONS),
            min_spread_bps: env_parse("MIN_SPREAD_BPS", DEFAULT_MIN_SPREAD_BPS.parse().unwrap()),
            pricing_policy: env::var("PRICING_POLICY")
                .unwrap_or_else(|_| DEFAULT_PRICING_POLICY.to_string()),
            unwind_policy: env::var("UNWIND_POLICY")
                .unwrap_or_else(|_| DEFAULT_UNWIND_POLICY.to_string()),
            max_slippage_bps: env_parse("MAX_SLIPPAGE_BPS", DEFAULT_MAX_SLIPPAGE_BPS),
            chunk_size: env_parse("CHUNK_SIZE", DEFAULT_CHUNK_SIZE.parse().unwrap()),
            max_chunk_iterations: env_parse("MAX_CHUNK_ITERATIONS", DEFAULT_MAX_CHUNK_ITERATIONS),
            min_fill_ratio: env_parse("MIN_FILL_RATIO", DEFAULT_MIN_FILL_RATIO.parse().unwrap()),
            position_tolerance: env_parse(
                "POSITION_TOLERANCE",
                DEFAULT_POSITION_TOLERANCE.parse().unwrap(),
            ),
            settlement_delay_ms: env_parse("SETTLEMENT_DELAY_MS", DEFAULT_SETTLEMENT_DELAY_MS),
            verify_attempts: env_parse("VERIFY_ATTEMPTS", DEFAULT_VERIFY_ATTEMPTS),
            close_max_attempts: env_parse("CLOSE_MAX_ATTEMPTS", DEFAULT_CLOSE_MAX_ATTEMPTS),
            close_backoff_ms: env_parse("CLOSE_BACKOFF_MS", DEFAULT_CLOSE_BACKOFF_MS),
            escalation_ticks: env_parse("ESCALATION_TICKS", DEFAULT_ESCALATION_TICKS),
            final_cross_ticks: env_parse("FINAL_CROSS_TICKS", DEFAULT_FINAL_CROSS_TICKS),
            quote_staleness_ms: env_parse("QUOTE_STALENESS_MS", DEFAULT_QUOTE_STALENESS_MS),
            post_only_timeout_secs: env_parse(
                "POST_ONLY_TIMEOUT_SECS",
                DEFAULT_POST_ONLY_TIMEOUT_SECS,
            ),
            ioc_timeout_ms: env_parse("IOC_TIMEOUT_MS", DEFAULT_IOC_TIMEOUT_MS),
            market_timeout_ms: env_parse("MARKET_TIMEOUT_MS", DEFAULT_MARKET_TIMEOUT_MS),
            poll_interval_ms: env_parse("POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS),
            submit_max_attempts: env_parse("SUBMIT_MAX_ATTEMPTS", DEFAULT_SUBMIT_MAX_ATTEMPTS),
            submit_backoff_ms: env_parse("SUBMIT_BACKOFF_MS", DEFAULT_SUBMIT_BACKOFF_MS),
            force_close_on_startup: env_bool(
                "FORCE_CLOSE_ON_STARTUP",
                DEFAULT_FORCE_CLOSE_ON_STARTUP,
            ),
            ledger_dir: env::var("LEDGER_DIR").ok().filter(|v| !v.is_empty()),
            status_file: env::var("STATUS_FILE").ok().filter(|v| !v.is_empty()),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("VENUE") {
            if !value.trim().is_empty() {
                self.venue = value;
            }
        }
        if let Ok(value) = env::var("REST_ENDPOINT") {
            if !value.trim().is_empty() {
                self.rest_endpoint = value;
            }
        }
        if let Ok(value) = env::var("WEB_SOCKET_ENDPOINT") {
            if !value.trim().is_empty() {
                self.web_socket_endpoint = value;
            }
        }
        if env::var("DRY_RUN").is_ok() {
            self.dry_run = env_bool("DRY_RUN", self.dry_run);
        }
        if env::var("OBSERVE_ONLY").is_ok() {
            self.observe_only = env_bool("OBSERVE_ONLY", self.observe_only);
        }
        if let Ok(value) = env::var("INSTRUMENT_A") {
            if !value.trim().is_empty() {
                self.instrument_a = value;
            }
        }
        if let Ok(value) = env::var("INSTRUMENT_B") {
            if !value.trim().is_empty() {
                self.instrument_b = value;
            }
        }
        self.target_notional = env_parse("TARGET_NOTIONAL_USD", self.target_notional);
        self.iterations = env_parse("ITERATIONS", self.iterations);
        self.min_spread_bps = env_parse("MIN_SPREAD_BPS", self.min_spread_bps);
        if let Ok(value) = env::var("PRICING_POLICY") {
            if !value.trim().is_empty() {
                self.pricing_policy = value;
            }
        }
        if let Ok(value) = env::var("UNWIND_POLICY") {
            if !value.trim().is_empty() {
                self.unwind_policy = value;
            }
        }
        self.max_slippage_bps = env_parse("MAX_SLIPPAGE_BPS", self.max_slippage_bps);
        self.chunk_size = env_parse("CHUNK_SIZE", self.chunk_size);
        self.max_chunk_iterations = env_parse("MAX_CHUNK_ITERATIONS", self.max_chunk_iterations);
        self.min_fill_ratio = env_parse("MIN_FILL_RATIO", self.min_fill_ratio);
        self.position_tolerance = env_parse("POSITION_TOLERANCE", self.position_tolerance);
        self.settlement_delay_ms = env_parse("SETTLEMENT_DELAY_MS", self.settlement_delay_ms);
        self.verify_attempts = env_parse("VERIFY_ATTEMPTS", self.verify_attempts);
        self.close_max_attempts = env_parse("CLOSE_MAX_ATTEMPTS", self.close_max_attempts);
        self.close_backoff_ms = env_parse("CLOSE_BACKOFF_MS", self.close_backoff_ms);
        self.escalation_ticks = env_parse("ESCALATION_TICKS", self.escalation_ticks);
        self.final_cross_ticks = env_parse("FINAL_CROSS_TICKS", self.final_cross_ticks);
        self.quote_staleness_ms = env_parse("QUOTE_STALENESS_MS", self.quote_staleness_ms);
        self.post_only_timeout_secs =
            env_parse("POST_ONLY_TIMEOUT_SECS", self.post_only_timeout_secs);
        self.ioc_timeout_ms = env_parse("IOC_TIMEOUT_MS", self.ioc_timeout_ms);
        self.market_timeout_ms = env_parse("MARKET_TIMEOUT_MS", self.market_timeout_ms);
        self.poll_interval_ms = env_parse("POLL_INTERVAL_MS", self.poll_interval_ms);
        self.submit_max_attempts = env_parse("SUBMIT_MAX_ATTEMPTS", self.submit_max_attempts);
        self.submit_backoff_ms = env_parse("SUBMIT_BACKOFF_MS", self.submit_backoff_ms);
        if env::var("FORCE_CLOSE_ON_STARTUP").is_ok() {
            self.force_close_on_startup =
                env_bool("FORCE_CLOSE_ON_STARTUP", self.force_close_on_startup);
        }
        if let Ok(value) = env::var("LEDGER_DIR") {
            if !value.trim().is_empty() {
                self.ledger_dir = Some(value);
            }
        }
        if let Ok(value) = env::var("STATUS_FILE") {
            if !value.trim().is_empty() {
                self.status_file = Some(value);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.target_notional <= Decimal::ZERO {
            return Err(anyhow!("TARGET_NOTIONAL_USD must be positive"));
        }
        if self.min_fill_ratio <= Decimal::ZERO || self.min_fill_ratio > Decimal::ONE {
            return Err(anyhow!("MIN_FILL_RATIO must be in (0, 1]"));
        }
        if self.position_tolerance <= Decimal::ZERO {
            return Err(anyhow!("POSITION_TOLERANCE must be positive"));
        }
        if self.instrument_a == self.instrument_b {
            return Err(anyhow!(
                "INSTRUMENT_A and INSTRUMENT_B must differ ({})",
                self.instrument_a
            ));
        }
        self.entry_policy()?;
        self.exit_policy()?;
        Ok(())
    }

    fn parse_policy(&self, name: &str) -> Result<PricePolicy> {
        match name.trim().to_ascii_lowercase().as_str() {
            "post_only" | "postonly" => Ok(PricePolicy::PostOnly),
            "ioc" => Ok(PricePolicy::IocAtTouch),
            "market" => Ok(PricePolicy::Market {
                max_slippage_bps: self.max_slippage_bps,
            }),
            "chunked" | "iterative" => Ok(PricePolicy::IterativeChunked {
                chunk_size: self.chunk_size,
                max_iterations: self.max_chunk_iterations,
            }),
            other => Err(anyhow!("unknown pricing policy '{}'", other)),
        }
    }

    pub fn entry_policy(&self) -> Result<PricePolicy> {
        self.parse_policy(&self.pricing_policy)
    }

    pub fn exit_policy(&self) -> Result<PricePolicy> {
        self.parse_policy(&self.unwind_policy)
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            min_fill_ratio: self.min_fill_ratio,
            post_only_timeout: Duration::from_secs(self.post_only_timeout_secs),
            ioc_timeout: Duration::from_millis(self.ioc_timeout_ms),
            market_timeout: Duration::from_millis(self.market_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            submit_max_attempts: self.submit_max_attempts,
            submit_backoff: Duration::from_millis(self.submit_backoff_ms),
        }
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            settlement_delay: Duration::from_millis(self.settlement_delay_ms),
            position_tolerance: self.position_tolerance,
            verify_attempts: self.verify_attempts,
            retry: RetryPolicy {
                max_attempts: self.close_max_attempts,
                backoff: Duration::from_millis(self.close_backoff_ms),
                escalation_ticks: self.escalation_ticks,
            },
            final_cross_ticks: self.final_cross_ticks,
        }
    }

    pub fn quote_staleness(&self) -> Duration {
        Duration::from_millis(self.quote_staleness_ms)
    }
}

// =============================================================================
// Core Configuration — loaded once at startup, immutable afterwards
// =============================================================================
//
// Every field carries a serde default so that older config files keep loading
// when new fields are added. The engine never mutates configuration at
// runtime; the only runtime-switchable state (Safe-Stop RUNNING/STOPPED)
// lives in its own synchronized object.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_kline_intervals() -> Vec<String> {
    vec!["1m".to_string(), "5m".to_string(), "15m".to_string()]
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_reconcile_interval_secs() -> u64 {
    3600
}

fn default_safe_stop_check_interval_secs() -> u64 {
    60
}

fn default_safe_stop_threshold_pct() -> Decimal {
    dec!(0.10)
}

fn default_safe_stop_min_balance() -> Decimal {
    dec!(0)
}

fn default_min_confidence() -> f64 {
    0.75
}

fn default_risk_per_trade() -> Decimal {
    dec!(0.02)
}

fn default_max_position() -> Decimal {
    dec!(1000)
}

fn default_max_total_notional() -> Decimal {
    dec!(3000)
}

fn default_min_order() -> Decimal {
    dec!(10)
}

fn default_stop_loss_pct() -> Decimal {
    dec!(0.02)
}

fn default_take_profit_pct() -> Decimal {
    dec!(0.04)
}

fn default_leverage() -> u32 {
    5
}

fn default_wal_path() -> String {
    "vela-intents.log".to_string()
}

fn default_wal_flush_ms() -> u64 {
    100
}

fn default_wal_rotate_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_rate_limit_soft_ratio() -> f64 {
    0.8
}

fn default_kill_switch_path() -> String {
    "/tmp/vela_kill_switch".to_string()
}

fn default_symbol_cooldown_secs() -> u64 {
    300
}

fn default_oracle_timeout_secs() -> u64 {
    15
}

fn default_oracle_concurrency() -> usize {
    5
}

fn default_clock_drift_limit_ms() -> i64 {
    500
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_position_poll_secs() -> u64 {
    30
}

fn default_shutdown_drain_secs() -> u64 {
    10
}

// =============================================================================
// CoreConfig
// =============================================================================

/// Top-level engine configuration.
///
/// Loaded once from a JSON file (plus environment overrides applied in
/// `main`) and passed around behind `Arc<AppState>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    // --- Universe -----------------------------------------------------------
    /// Symbols the engine tracks and trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Kline intervals subscribed on the combined stream.
    #[serde(default = "default_kline_intervals")]
    pub kline_intervals: Vec<String>,

    /// Quote currency for balances and notional caps.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    // --- Schedules ----------------------------------------------------------
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_safe_stop_check_interval_secs")]
    pub safe_stop_check_interval_secs: u64,

    #[serde(default = "default_position_poll_secs")]
    pub position_poll_secs: u64,

    #[serde(default = "default_shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,

    // --- Safe-Stop ----------------------------------------------------------
    /// Drawdown fraction of initial balance that trips the safe-stop.
    #[serde(default = "default_safe_stop_threshold_pct")]
    pub safe_stop_threshold_pct: Decimal,

    /// Absolute balance floor in quote currency (0 disables the floor).
    #[serde(default = "default_safe_stop_min_balance")]
    pub safe_stop_min_balance: Decimal,

    /// Path whose mere existence forces STOPPED.
    #[serde(default = "default_kill_switch_path")]
    pub kill_switch_path: String,

    // --- Entry gates & sizing -----------------------------------------------
    /// Minimum oracle confidence; exactly at the threshold accepts.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Fraction of balance risked per trade.
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: Decimal,

    /// Per-symbol notional cap in quote currency.
    #[serde(default = "default_max_position")]
    pub max_position: Decimal,

    /// Global in-flight notional cap in quote currency.
    #[serde(default = "default_max_total_notional")]
    pub max_total_notional: Decimal,

    /// Minimum order notional in quote currency; smaller sizes are rejected.
    #[serde(default = "default_min_order")]
    pub min_order: Decimal,

    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,

    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,

    #[serde(default = "default_leverage")]
    pub leverage_default: u32,

    /// Cool-down after a failed entry before the symbol is eligible again.
    #[serde(default = "default_symbol_cooldown_secs")]
    pub symbol_cooldown_secs: u64,

    // --- Journal ------------------------------------------------------------
    #[serde(default = "default_wal_path")]
    pub wal_path: String,

    /// Background flush cadence for buffered journal entries.
    #[serde(default = "default_wal_flush_ms")]
    pub wal_flush_ms: u64,

    /// Rotation threshold for the journal file.
    #[serde(default = "default_wal_rotate_bytes")]
    pub wal_rotate_bytes: u64,

    // --- Venue client -------------------------------------------------------
    /// Fraction of the venue per-minute weight cap treated as the soft limit.
    #[serde(default = "default_rate_limit_soft_ratio")]
    pub rate_limit_soft_ratio: f64,

    #[serde(default = "default_clock_drift_limit_ms")]
    pub clock_drift_limit_ms: i64,

    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,

    // --- Oracle -------------------------------------------------------------
    #[serde(default = "default_oracle_timeout_secs")]
    pub oracle_timeout_secs: u64,

    /// Worker-pool size for per-symbol oracle calls.
    #[serde(default = "default_oracle_concurrency")]
    pub oracle_concurrency: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            intervals = ?config.kline_intervals,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply environment-variable overrides that operators commonly set
    /// without editing the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("VELA_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Ok(path) = std::env::var("VELA_WAL_PATH") {
            if !path.is_empty() {
                self.wal_path = path;
            }
        }
        if let Ok(path) = std::env::var("VELA_KILL_SWITCH") {
            if !path.is_empty() {
                self.kill_switch_path = path;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.kline_intervals, vec!["1m", "5m", "15m"]);
        assert_eq!(cfg.scan_interval_secs, 60);
        assert_eq!(cfg.reconcile_interval_secs, 3600);
        assert_eq!(cfg.safe_stop_threshold_pct, dec!(0.10));
        assert_eq!(cfg.min_confidence, 0.75);
        assert_eq!(cfg.risk_per_trade, dec!(0.02));
        assert_eq!(cfg.stop_loss_pct, dec!(0.02));
        assert_eq!(cfg.take_profit_pct, dec!(0.04));
        assert_eq!(cfg.wal_rotate_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.recv_window_ms, 5000);
        assert_eq!(cfg.clock_drift_limit_ms, 500);
        assert_eq!(cfg.oracle_concurrency, 5);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.leverage_default, 5);
        assert_eq!(cfg.wal_flush_ms, 100);
        assert!((cfg.rate_limit_soft_ratio - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "min_confidence": 0.6 }"#;
        let cfg: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert!((cfg.min_confidence - 0.6).abs() < f64::EPSILON);
        assert_eq!(cfg.scan_interval_secs, 60);
        assert_eq!(cfg.max_position, dec!(1000));
    }

    #[test]
    fn decimal_fields_parse_from_strings_and_numbers() {
        let json = r#"{ "risk_per_trade": "0.01", "max_position": 2500 }"#;
        let cfg: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.risk_per_trade, dec!(0.01));
        assert_eq!(cfg.max_position, dec!(2500));
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = CoreConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.risk_per_trade, cfg2.risk_per_trade);
        assert_eq!(cfg.wal_rotate_bytes, cfg2.wal_rotate_bytes);
    }
}

//! Environment-driven configuration.
//!
//! Everything is read once at startup (`EngineConfig::from_env`) and then
//! owned by the engine root. Runtime-tunable thresholds live in a single
//! `Thresholds` record so that a `set` command swaps them atomically between
//! event steps — readers on the core task never observe a torn update.

use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use serde::Deserialize;

// ─────────────────────────────────────────────────────────
// Modes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotMode {
    Live,
    Backtest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMode {
    /// Only yes/no accepted as outcome labels.
    Strict,
    /// Additionally true/false, y/n, 1/0.
    Permissive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlattenMode {
    CancelOnly,
    CancelAndUnwind,
}

// ─────────────────────────────────────────────────────────
// Market descriptors
// ─────────────────────────────────────────────────────────

/// Raw market entry from the `MARKETS` env (JSON array). Labels are resolved
/// by the registry, not here.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketDescriptor {
    pub market_id: String,
    pub outcomes: Vec<OutcomeDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeDescriptor {
    pub label: String,
    pub token_id: String,
    #[serde(default = "default_tick")]
    pub tick_size: f64,
    #[serde(default = "default_lot")]
    pub lot_size: f64,
}

fn default_tick() -> f64 {
    0.001
}

fn default_lot() -> f64 {
    0.01
}

// ─────────────────────────────────────────────────────────
// Venue credentials
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub ws_url: String,
    pub rest_url: String,
    pub data_url: String,
    pub chain_id: u64,
    pub signature_scheme: String,
    /// Absent in DRY_RUN; absence forces DRY_RUN.
    pub private_key: Option<SecretString>,
    pub api_key: String,
    pub api_secret: SecretString,
    pub api_passphrase: SecretString,
}

// ─────────────────────────────────────────────────────────
// Runtime thresholds (the `set` command's surface)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Thresholds {
    // Edge
    pub fee_rate: f64,
    pub base_slippage: f64,
    pub slippage_k: f64,
    pub failure_buffer: f64,
    pub slippage_multiplier: f64,
    pub min_edge_threshold: f64,
    pub min_size: f64,
    pub target_size: f64,
    // Orders
    pub order_ttl_ms: i64,
    pub max_cancels_per_window: u32,
    pub cancel_window_ms: i64,
    pub submit_rate_per_sec: f64,
    pub cancel_rate_per_sec: f64,
    // Risk
    pub hourly_loss_limit: f64,
    pub daily_loss_limit: f64,
    pub max_drawdown: f64,
    pub max_reject_ratio: f64,
    pub reject_window: usize,
    // Watchdog
    pub user_ws_timeout_sec: f64,
    // Decay guard
    pub edge_decay_min_trades: usize,
    pub edge_decay_min_ratio: f64,
    // Flatten
    pub max_unwind_slippage: f64,
    pub unwind_deadline_ms: i64,
    pub flatten_cancel_timeout_ms: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            fee_rate: 0.01,
            base_slippage: 0.0,
            slippage_k: 0.002,
            failure_buffer: 0.002,
            slippage_multiplier: 1.5,
            min_edge_threshold: 0.005,
            min_size: 5.0,
            target_size: 100.0,
            order_ttl_ms: 30_000,
            max_cancels_per_window: 20,
            cancel_window_ms: 60_000,
            submit_rate_per_sec: 5.0,
            cancel_rate_per_sec: 10.0,
            hourly_loss_limit: -50.0,
            daily_loss_limit: -200.0,
            max_drawdown: 100.0,
            max_reject_ratio: 0.5,
            reject_window: 50,
            user_ws_timeout_sec: 15.0,
            edge_decay_min_trades: 15,
            edge_decay_min_ratio: 0.5,
            max_unwind_slippage: 0.02,
            unwind_deadline_ms: 30_000,
            flatten_cancel_timeout_ms: 10_000,
        }
    }
}

impl Thresholds {
    /// Apply `set k=v ...` pairs onto a copy. All keys must be known and all
    /// values in bounds, otherwise the whole update is rejected and the
    /// current record stays in force.
    pub fn apply_set(&self, pairs: &[(String, String)]) -> Result<Thresholds, String> {
        let mut next = self.clone();
        for (k, v) in pairs {
            next.set_one(k, v)?;
        }
        next.validate().map_err(|e| e.to_string())?;
        Ok(next)
    }

    fn set_one(&mut self, key: &str, value: &str) -> Result<(), String> {
        fn f64_of(k: &str, v: &str) -> Result<f64, String> {
            v.parse::<f64>().map_err(|_| format!("{k}: not a number"))
        }
        fn i64_of(k: &str, v: &str) -> Result<i64, String> {
            v.parse::<i64>().map_err(|_| format!("{k}: not an integer"))
        }
        fn usize_of(k: &str, v: &str) -> Result<usize, String> {
            v.parse::<usize>().map_err(|_| format!("{k}: not an integer"))
        }
        match key {
            "fee_rate" => self.fee_rate = f64_of(key, value)?,
            "base_slippage" => self.base_slippage = f64_of(key, value)?,
            "slippage_k" => self.slippage_k = f64_of(key, value)?,
            "failure_buffer" => self.failure_buffer = f64_of(key, value)?,
            "slippage_multiplier" => self.slippage_multiplier = f64_of(key, value)?,
            "min_edge_threshold" => self.min_edge_threshold = f64_of(key, value)?,
            "min_size" => self.min_size = f64_of(key, value)?,
            "target_size" => self.target_size = f64_of(key, value)?,
            "order_ttl_ms" => self.order_ttl_ms = i64_of(key, value)?,
            "max_cancels_per_window" => {
                self.max_cancels_per_window = usize_of(key, value)? as u32
            }
            "cancel_window_ms" => self.cancel_window_ms = i64_of(key, value)?,
            "submit_rate_per_sec" => self.submit_rate_per_sec = f64_of(key, value)?,
            "cancel_rate_per_sec" => self.cancel_rate_per_sec = f64_of(key, value)?,
            "hourly_loss_limit" => self.hourly_loss_limit = f64_of(key, value)?,
            "daily_loss_limit" => self.daily_loss_limit = f64_of(key, value)?,
            "max_drawdown" => self.max_drawdown = f64_of(key, value)?,
            "max_reject_ratio" => self.max_reject_ratio = f64_of(key, value)?,
            "reject_window" => self.reject_window = usize_of(key, value)?,
            "user_ws_timeout_sec" => self.user_ws_timeout_sec = f64_of(key, value)?,
            "edge_decay_min_trades" => self.edge_decay_min_trades = usize_of(key, value)?,
            "edge_decay_min_ratio" => self.edge_decay_min_ratio = f64_of(key, value)?,
            "max_unwind_slippage" => self.max_unwind_slippage = f64_of(key, value)?,
            "unwind_deadline_ms" => self.unwind_deadline_ms = i64_of(key, value)?,
            "flatten_cancel_timeout_ms" => {
                self.flatten_cancel_timeout_ms = i64_of(key, value)?
            }
            _ => return Err(format!("unknown key: {key}")),
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..0.2).contains(&self.fee_rate) {
            bail!("fee_rate out of bounds: {}", self.fee_rate);
        }
        if self.base_slippage < 0.0 || self.slippage_k < 0.0 {
            bail!("slippage parameters must be non-negative");
        }
        if self.failure_buffer < 0.0 || self.slippage_multiplier < 0.0 {
            bail!("failure buffer parameters must be non-negative");
        }
        if self.min_edge_threshold <= 0.0 {
            bail!("min_edge_threshold must be positive");
        }
        if self.min_size <= 0.0 || self.target_size < self.min_size {
            bail!("sizes: need 0 < min_size <= target_size");
        }
        if self.order_ttl_ms <= 0 || self.cancel_window_ms <= 0 {
            bail!("ttl/window durations must be positive");
        }
        if self.submit_rate_per_sec <= 0.0 || self.cancel_rate_per_sec <= 0.0 {
            bail!("rate limits must be positive");
        }
        if self.hourly_loss_limit > 0.0 || self.daily_loss_limit > 0.0 {
            bail!("loss limits are expressed as negative PnL");
        }
        if self.max_drawdown <= 0.0 {
            bail!("max_drawdown must be positive");
        }
        if !(0.0..=1.0).contains(&self.max_reject_ratio) {
            bail!("max_reject_ratio must be in [0,1]");
        }
        if self.reject_window == 0 || self.edge_decay_min_trades == 0 {
            bail!("windows must be non-empty");
        }
        if !(0.0..=1.0).contains(&self.edge_decay_min_ratio) {
            bail!("edge_decay_min_ratio must be in [0,1]");
        }
        if self.user_ws_timeout_sec <= 0.0 {
            bail!("user_ws_timeout_sec must be positive");
        }
        if self.max_unwind_slippage < 0.0 {
            bail!("max_unwind_slippage must be non-negative");
        }
        if self.unwind_deadline_ms <= 0 || self.flatten_cancel_timeout_ms <= 0 {
            bail!("flatten deadlines must be positive");
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Fixed (non-runtime) knobs
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub venue: VenueConfig,
    pub markets: Vec<MarketDescriptor>,
    pub thresholds: Thresholds,
    pub label_mode: LabelMode,
    pub flatten_mode: FlattenMode,
    pub mode: BotMode,
    pub dry_run: bool,
    pub start_paused: bool,
    pub db_path: String,
    /// Retained book depth per side.
    pub book_depth: usize,
    pub resync_interval_ms: i64,
    /// Sequence divergence beyond which a periodic REST snapshot overrides
    /// local state.
    pub resync_seq_tolerance: u64,
    pub slippage_window: usize,
    pub edge_decay_window: usize,
    pub tick_interval_ms: u64,
    pub event_queue_book_capacity: usize,
    pub event_queue_mid_capacity: usize,
    pub db_queue_capacity: usize,
    pub db_write_deadline_ms: u64,
    pub submit_pool_size: usize,
    pub admin_addr: String,
}

impl EngineConfig {
    /// Read and validate the full configuration. Any missing required
    /// variable or invalid value is a startup failure (exit code 1).
    pub fn from_env() -> Result<Self> {
        let venue = VenueConfig {
            ws_url: require("VENUE_WS_URL")?,
            rest_url: require("VENUE_REST_URL")?,
            data_url: require("VENUE_DATA_URL")?,
            chain_id: require("CHAIN_ID")?
                .parse()
                .context("CHAIN_ID: not an integer")?,
            signature_scheme: require("SIGNATURE_SCHEME")?,
            private_key: std::env::var("PRIVATE_KEY")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            api_key: require("API_KEY")?,
            api_secret: SecretString::from(require("API_SECRET")?),
            api_passphrase: SecretString::from(require("API_PASSPHRASE")?),
        };

        let markets: Vec<MarketDescriptor> = serde_json::from_str(&require("MARKETS")?)
            .context("MARKETS: expected a JSON array of market descriptors")?;
        if markets.is_empty() {
            bail!("MARKETS: at least one market is required");
        }

        let mode = match require("BOT_MODE")?.to_ascii_lowercase().as_str() {
            "live" => BotMode::Live,
            "backtest" => BotMode::Backtest,
            other => bail!("BOT_MODE: expected live|backtest, got {other}"),
        };

        let mut cfg = Self {
            venue,
            markets,
            thresholds: Thresholds::default(),
            label_mode: LabelMode::Strict,
            flatten_mode: FlattenMode::CancelOnly,
            mode,
            dry_run: env_bool("DRY_RUN")?,
            start_paused: env_bool("START_PAUSED")?,
            db_path: require("DB_PATH")?,
            book_depth: 10,
            resync_interval_ms: 30_000,
            resync_seq_tolerance: 2,
            slippage_window: 50,
            edge_decay_window: 30,
            tick_interval_ms: 250,
            event_queue_book_capacity: 1024,
            event_queue_mid_capacity: 8192,
            db_queue_capacity: 4096,
            db_write_deadline_ms: 250,
            submit_pool_size: 4,
            admin_addr: std::env::var("ADMIN_ADDR").unwrap_or_else(|_| "127.0.0.1:7070".into()),
        };

        if let Ok(v) = std::env::var("LABEL_MODE") {
            cfg.label_mode = match v.to_ascii_lowercase().as_str() {
                "strict" => LabelMode::Strict,
                "permissive" => LabelMode::Permissive,
                other => bail!("LABEL_MODE: expected strict|permissive, got {other}"),
            };
        }
        if let Ok(v) = std::env::var("FLATTEN_MODE") {
            cfg.flatten_mode = match v.to_ascii_lowercase().as_str() {
                "cancel_only" => FlattenMode::CancelOnly,
                "cancel_and_unwind" => FlattenMode::CancelAndUnwind,
                other => bail!("FLATTEN_MODE: expected cancel_only|cancel_and_unwind, got {other}"),
            };
        }
        apply_env_overrides(&mut cfg)?;

        // No signer material means we may not trade for real.
        if cfg.venue.private_key.is_none() {
            cfg.dry_run = true;
        }

        cfg.thresholds.validate()?;
        Ok(cfg)
    }

    /// Re-read only the threshold keys (the `reload` command). Fixed knobs
    /// such as queue capacities are startup-only.
    pub fn reload_thresholds(&self) -> Result<Thresholds> {
        let mut t = self.thresholds.clone();
        for (key, var) in THRESHOLD_ENV_KEYS {
            if let Ok(v) = std::env::var(var) {
                t.set_one(key, &v).map_err(anyhow::Error::msg)?;
            }
        }
        t.validate()?;
        Ok(t)
    }
}

const THRESHOLD_ENV_KEYS: [(&str, &str); 9] = [
    ("fee_rate", "FEE_RATE"),
    ("min_edge_threshold", "MIN_EDGE_THRESHOLD"),
    ("min_size", "MIN_SIZE"),
    ("target_size", "TARGET_SIZE"),
    ("order_ttl_ms", "ORDER_TTL_MS"),
    ("hourly_loss_limit", "HOURLY_LOSS_LIMIT"),
    ("daily_loss_limit", "DAILY_LOSS_LIMIT"),
    ("max_drawdown", "MAX_DRAWDOWN"),
    ("user_ws_timeout_sec", "USER_WS_TIMEOUT_SEC"),
];

fn apply_env_overrides(cfg: &mut EngineConfig) -> Result<()> {
    let t = &mut cfg.thresholds;
    for (key, var) in THRESHOLD_ENV_KEYS {
        if let Ok(v) = std::env::var(var) {
            t.set_one(key, &v).map_err(anyhow::Error::msg)?;
        }
    }
    if let Ok(v) = std::env::var("BOOK_DEPTH") {
        cfg.book_depth = v.parse().context("BOOK_DEPTH: not an integer")?;
    }
    if let Ok(v) = std::env::var("RESYNC_INTERVAL_MS") {
        cfg.resync_interval_ms = v.parse().context("RESYNC_INTERVAL_MS: not an integer")?;
    }
    Ok(())
}

fn require(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("missing required env var {name}"))
}

fn env_bool(name: &str) -> Result<bool> {
    let v = require(name)?;
    Ok(v != "0" && !v.eq_ignore_ascii_case("false"))
}

// ─────────────────────────────────────────────────────────
// Log redaction
// ─────────────────────────────────────────────────────────

const REDACTED: &str = "[REDACTED]";
const SENSITIVE_FIELDS: [&str; 5] = [
    "private_key",
    "secret",
    "passphrase",
    "api_key",
    "signature",
];

/// Field-name based redaction. Matching is case-insensitive and substring
/// based so `API_SECRET` and `apiKey` both hit.
pub fn is_sensitive_field(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_FIELDS.iter().any(|f| lower.contains(f)) || lower == "apikey"
}

pub fn redact_field<'a>(name: &str, value: &'a str) -> &'a str {
    if is_sensitive_field(name) {
        REDACTED
    } else {
        value
    }
}

/// Scrub every sensitive field in a JSON tree before it reaches a sink.
pub fn redact_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map.iter_mut() {
                if is_sensitive_field(k) {
                    *v = serde_json::Value::String(REDACTED.into());
                } else {
                    redact_json(v);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for v in items {
                redact_json(v);
            }
        }
        _ => {}
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

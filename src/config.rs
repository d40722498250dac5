// Startup configuration. Loaded once, immutable for the process lifetime.
//
// Sources, later wins: config/default.toml (optional), then PERPBOT__*
// environment variables (PERPBOT__TRADE__LEVERAGE=20 etc).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub exchange: ExchangeSettings,
    #[serde(default)]
    pub advisor: AdvisorSettings,
    #[serde(default)]
    pub trade: TradeConfig,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExchangeSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: String,
    /// Demo-trading mode. Orders are routed to the exchange's paper venue.
    #[serde(default = "default_true")]
    pub sandbox: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdvisorSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_advisor_url")]
    pub base_url: String,
    #[serde(default = "default_advisor_model")]
    pub model: String,
    #[serde(default = "default_advisor_timeout")]
    pub timeout_secs: u64,
}

/// Trading parameters. Owned by the scheduler, never mutated after startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradeConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_margin")]
    pub margin_usdt: f64,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    /// Candle window requested per snapshot.
    #[serde(default = "default_data_points")]
    pub data_points: usize,
    /// When true the engine logs would-be orders and places nothing.
    #[serde(default = "default_true")]
    pub test_mode: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorSettings {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_staleness")]
    pub staleness_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl TradeConfig {
    /// Target notional: margin with leverage applied.
    pub fn position_usdt(&self) -> f64 {
        self.margin_usdt * self.leverage
    }

    /// Candle length in minutes. Falls back to 15 for anything unparsable;
    /// `validate` rejects such configs before we get here.
    pub fn timeframe_minutes(&self) -> i64 {
        parse_timeframe(&self.timeframe).unwrap_or(15)
    }

    /// Minimum time a position must be held before the close check
    /// consults the advisory service.
    pub fn min_hold_minutes(&self) -> i64 {
        match self.timeframe.as_str() {
            "15m" => 30,
            "1h" => 60,
            "4h" => 240,
            _ => 60,
        }
    }
}

/// "15m" -> 15, "1h" -> 60, "4h" -> 240, "1d" -> 1440.
pub fn parse_timeframe(tf: &str) -> Option<i64> {
    let (num, unit) = tf.split_at(tf.len().checked_sub(1)?);
    let n: i64 = num.parse().ok()?;
    if n <= 0 {
        return None;
    }
    match unit {
        "m" => Some(n),
        "h" => Some(n * 60),
        "d" => Some(n * 1440),
        _ => None,
    }
}

impl Settings {
    pub fn load() -> crate::Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix("PERPBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Collects every problem instead of failing on the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.trade.symbol.is_empty() {
            errors.push("trade.symbol must not be empty".to_string());
        }
        if self.trade.margin_usdt <= 0.0 {
            errors.push(format!(
                "trade.margin_usdt must be positive, got {}",
                self.trade.margin_usdt
            ));
        }
        if self.trade.leverage < 1.0 || self.trade.leverage > 125.0 {
            errors.push(format!(
                "trade.leverage must be within 1..=125, got {}",
                self.trade.leverage
            ));
        }
        if parse_timeframe(&self.trade.timeframe).is_none() {
            errors.push(format!("trade.timeframe '{}' is invalid", self.trade.timeframe));
        }
        if self.trade.data_points < 30 {
            errors.push(format!(
                "trade.data_points must be at least 30 to fill the indicator windows, got {}",
                self.trade.data_points
            ));
        }
        if self.exchange.api_key.is_empty()
            || self.exchange.api_secret.is_empty()
            || self.exchange.passphrase.is_empty()
        {
            errors.push("exchange credentials (api_key, api_secret, passphrase) are required".to_string());
        }
        if self.advisor.api_key.is_empty() {
            errors.push("advisor.api_key is required".to_string());
        }
        if self.monitor.staleness_secs < self.monitor.check_interval_secs {
            errors.push(format!(
                "monitor.staleness_secs ({}) must be >= check_interval_secs ({})",
                self.monitor.staleness_secs, self.monitor.check_interval_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: String::new(),
            sandbox: true,
        }
    }
}

impl Default for AdvisorSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_advisor_url(),
            model: default_advisor_model(),
            timeout_secs: default_advisor_timeout(),
        }
    }
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            margin_usdt: default_margin(),
            leverage: default_leverage(),
            timeframe: default_timeframe(),
            data_points: default_data_points(),
            test_mode: true,
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            staleness_secs: default_staleness(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_advisor_url() -> String {
    "https://api.deepseek.com".to_string()
}

fn default_advisor_model() -> String {
    "deepseek-chat".to_string()
}

fn default_advisor_timeout() -> u64 {
    30
}

fn default_symbol() -> String {
    "BTC-USDT-SWAP".to_string()
}

fn default_margin() -> f64 {
    120.0
}

fn default_leverage() -> f64 {
    10.0
}

fn default_timeframe() -> String {
    "15m".to_string()
}

fn default_data_points() -> usize {
    96
}

fn default_check_interval() -> u64 {
    60
}

fn default_staleness() -> u64 {
    300
}

fn default_max_restarts() -> u32 {
    5
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_trade_config() {
        let cfg = TradeConfig::default();
        assert_eq!(cfg.symbol, "BTC-USDT-SWAP");
        assert_eq!(cfg.margin_usdt, 120.0);
        assert_eq!(cfg.leverage, 10.0);
        assert_eq!(cfg.position_usdt(), 1200.0);
        assert!(cfg.test_mode);
    }

    #[test]
    fn test_parse_timeframe() {
        assert_eq!(parse_timeframe("15m"), Some(15));
        assert_eq!(parse_timeframe("1h"), Some(60));
        assert_eq!(parse_timeframe("4h"), Some(240));
        assert_eq!(parse_timeframe("1d"), Some(1440));
        assert_eq!(parse_timeframe("weekly"), None);
        assert_eq!(parse_timeframe(""), None);
        assert_eq!(parse_timeframe("0m"), None);
    }

    #[test]
    fn test_min_hold_follows_timeframe() {
        let mut cfg = TradeConfig::default();
        assert_eq!(cfg.min_hold_minutes(), 30);
        cfg.timeframe = "1h".to_string();
        assert_eq!(cfg.min_hold_minutes(), 60);
        cfg.timeframe = "4h".to_string();
        assert_eq!(cfg.min_hold_minutes(), 240);
        cfg.timeframe = "5m".to_string();
        assert_eq!(cfg.min_hold_minutes(), 60);
    }

    #[test]
    fn test_validate_catches_everything_at_once() {
        let mut settings = Settings::default();
        settings.trade.margin_usdt = -5.0;
        settings.trade.leverage = 500.0;
        settings.trade.timeframe = "never".to_string();

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("margin_usdt")));
        assert!(errors.iter().any(|e| e.contains("leverage")));
        assert!(errors.iter().any(|e| e.contains("timeframe")));
        // credentials are empty in the default settings
        assert!(errors.iter().any(|e| e.contains("credentials")));
    }

    #[test]
    fn test_validate_accepts_complete_settings() {
        let mut settings = Settings::default();
        settings.exchange.api_key = "key".to_string();
        settings.exchange.api_secret = "secret".to_string();
        settings.exchange.passphrase = "phrase".to_string();
        settings.advisor.api_key = "sk-test".to_string();
        assert!(settings.validate().is_ok());
    }
}

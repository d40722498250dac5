// OKX v5 REST connector. Every request flows through the shared rate
// limiter; private endpoints carry the HMAC-SHA256 signature headers.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExchangeSettings;
use crate::error::BotError;
use crate::models::{Balance, Candle, MarketMeta, Position, PositionSide, SentimentData};
use crate::ratelimit::{classify_endpoint, ApiRateLimiter, QuotaClass};
use crate::Result;

use super::{Exchange, OrderAck, OrderRequest, ProtectiveKind, ProtectiveOrder};

const OKX_API_BASE: &str = "https://www.okx.com";
const HTTP_TIMEOUT_SECS: u64 = 10;

// Soft rate-limit code in the response envelope.
const OKX_CODE_RATE_LIMIT: &str = "50001";
const OKX_CODE_TOO_MANY: &str = "50011";

pub struct OkxClient {
    http: RwLock<Client>,
    base_url: String,
    api_key: String,
    api_secret: String,
    passphrase: String,
    sandbox: bool,
    limiter: Arc<ApiRateLimiter>,
}

/// Standard OKX response wrapper: `{"code":"0","msg":"","data":[...]}`.
#[derive(Debug, Deserialize)]
struct OkxEnvelope<T> {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct InstrumentData {
    #[serde(rename = "ctVal")]
    ct_val: String,
    #[serde(rename = "minSz")]
    min_sz: String,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    #[serde(default)]
    details: Vec<BalanceDetail>,
}

#[derive(Debug, Deserialize)]
struct BalanceDetail {
    ccy: String,
    #[serde(rename = "availBal", default)]
    avail_bal: String,
    #[serde(rename = "frozenBal", default)]
    frozen_bal: String,
    #[serde(default)]
    eq: String,
}

#[derive(Debug, Deserialize)]
struct PositionData {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "posSide", default)]
    pos_side: String,
    #[serde(default)]
    pos: String,
    #[serde(rename = "avgPx", default)]
    avg_px: String,
    #[serde(rename = "upl", default)]
    upl: String,
    #[serde(default)]
    lever: String,
    #[serde(default)]
    imr: String,
    #[serde(rename = "notionalUsd", default)]
    notional_usd: String,
    #[serde(rename = "cTime", default)]
    c_time: String,
}

#[derive(Debug, Deserialize)]
struct OrderData {
    #[serde(rename = "ordId", default)]
    ord_id: String,
    #[serde(rename = "sCode", default)]
    s_code: String,
    #[serde(rename = "sMsg", default)]
    s_msg: String,
}

#[derive(Debug, Deserialize)]
struct AlgoOrderData {
    #[serde(rename = "algoId", default)]
    algo_id: String,
    #[serde(rename = "sCode", default)]
    s_code: String,
    #[serde(rename = "sMsg", default)]
    s_msg: String,
}

#[derive(Debug, Serialize)]
struct OrderBody {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "tdMode")]
    td_mode: &'static str,
    #[serde(rename = "clOrdId")]
    cl_ord_id: String,
    side: String,
    #[serde(rename = "posSide")]
    pos_side: String,
    #[serde(rename = "ordType")]
    ord_type: &'static str,
    sz: String,
    #[serde(rename = "reduceOnly")]
    reduce_only: bool,
}

#[derive(Debug, Serialize)]
struct AlgoOrderBody {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "tdMode")]
    td_mode: &'static str,
    side: String,
    #[serde(rename = "posSide")]
    pos_side: String,
    #[serde(rename = "ordType")]
    ord_type: &'static str,
    sz: String,
    #[serde(rename = "reduceOnly")]
    reduce_only: bool,
    #[serde(rename = "slTriggerPx", skip_serializing_if = "Option::is_none")]
    sl_trigger_px: Option<String>,
    #[serde(rename = "slOrdPx", skip_serializing_if = "Option::is_none")]
    sl_ord_px: Option<String>,
    #[serde(rename = "tpTriggerPx", skip_serializing_if = "Option::is_none")]
    tp_trigger_px: Option<String>,
    #[serde(rename = "tpOrdPx", skip_serializing_if = "Option::is_none")]
    tp_ord_px: Option<String>,
}

#[derive(Debug, Serialize)]
struct LeverageBody {
    #[serde(rename = "instId")]
    inst_id: String,
    lever: String,
    #[serde(rename = "mgnMode")]
    mgn_mode: &'static str,
}

impl OkxClient {
    pub fn new(settings: &ExchangeSettings, limiter: Arc<ApiRateLimiter>) -> Result<Self> {
        Self::with_base_url(settings, limiter, OKX_API_BASE)
    }

    pub fn with_base_url(
        settings: &ExchangeSettings,
        limiter: Arc<ApiRateLimiter>,
        base_url: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            http: RwLock::new(build_http_client()?),
            base_url: base_url.into(),
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            passphrase: settings.passphrase.clone(),
            sandbox: settings.sandbox,
            limiter,
        })
    }

    /// Signature over `timestamp + method + path + body` per the OKX v5
    /// authentication scheme.
    fn sign(&self, timestamp: &str, method: &str, path_and_query: &str, body: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| BotError::Transient(format!("hmac init: {e}")))?;
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path_and_query.as_bytes());
        mac.update(body.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<String>,
    ) -> Result<Vec<T>> {
        let class = classify_endpoint(path_and_query);
        self.limiter
            .execute(class, || {
                let method = method.clone();
                let body = body.clone();
                async move { self.dispatch(method, path_and_query, body, class).await }
            })
            .await
    }

    async fn dispatch<T: DeserializeOwned>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<String>,
        class: QuotaClass,
    ) -> Result<Vec<T>> {
        let url = format!("{}{}", self.base_url, path_and_query);
        let http = self.http.read().await.clone();
        let mut request = http.request(method.clone(), &url);

        let body_text = body.unwrap_or_default();
        if class == QuotaClass::Private {
            let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
            let signature = self.sign(&timestamp, method.as_str(), path_and_query, &body_text)?;
            request = request
                .header("OK-ACCESS-KEY", &self.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", &self.passphrase);
        }
        if self.sandbox {
            request = request.header("x-simulated-trading", "1");
        }
        if !body_text.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body_text);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.as_u16() == 429 {
            return Err(BotError::RateLimited(format!(
                "HTTP 429 Too Many Requests on {path_and_query}"
            )));
        }
        if status.is_server_error() {
            return Err(BotError::Transient(format!(
                "HTTP {status} on {path_and_query}: {text}"
            )));
        }
        if !status.is_success() {
            return Err(BotError::ExchangeRejection(format!(
                "HTTP {status} on {path_and_query}: {text}"
            )));
        }

        let envelope: OkxEnvelope<T> = serde_json::from_str(&text)
            .map_err(|e| BotError::Transient(format!("okx response decode on {path_and_query}: {e}")))?;

        if envelope.code != "0" {
            let detail = format!("okx code {}: {}", envelope.code, envelope.msg);
            if envelope.code == OKX_CODE_RATE_LIMIT
                || envelope.code == OKX_CODE_TOO_MANY
                || envelope.msg.to_ascii_lowercase().contains("rate limit")
            {
                return Err(BotError::RateLimited(detail));
            }
            return Err(BotError::ExchangeRejection(detail));
        }

        Ok(envelope.data)
    }

    fn base_currency(symbol: &str) -> &str {
        symbol.split('-').next().unwrap_or(symbol)
    }
}

#[async_trait::async_trait]
impl Exchange for OkxClient {
    async fn load_market_meta(&self, symbol: &str) -> Result<MarketMeta> {
        let path = format!("/api/v5/public/instruments?instType=SWAP&instId={symbol}");
        let rows: Vec<InstrumentData> = self.send(Method::GET, &path, None).await?;
        let inst = rows.first().ok_or_else(|| {
            BotError::ExchangeRejection(format!("instrument {symbol} not found"))
        })?;

        let contract_size = parse_num(&inst.ct_val);
        let min_contracts = parse_num(&inst.min_sz);
        if contract_size <= 0.0 {
            return Err(BotError::ExchangeRejection(format!(
                "instrument {symbol} has no contract multiplier"
            )));
        }

        let meta = MarketMeta {
            contract_size,
            min_quantity: (min_contracts * contract_size).max(0.01),
        };
        info!(
            "market meta for {}: contract size {}, min quantity {}",
            symbol, meta.contract_size, meta.min_quantity
        );
        Ok(meta)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let bar = timeframe_to_bar(timeframe);
        let path = format!("/api/v5/market/candles?instId={symbol}&bar={bar}&limit={limit}");
        let rows: Vec<Vec<String>> = self.send(Method::GET, &path, None).await?;

        // OKX returns newest first; the snapshot wants chronological order.
        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| parse_candle(row))
            .collect();
        candles.reverse();

        debug!("fetched {} candles for {} {}", candles.len(), symbol, bar);
        Ok(candles)
    }

    async fn fetch_balance(&self) -> Result<Balance> {
        let rows: Vec<BalanceData> = self
            .send(Method::GET, "/api/v5/account/balance?ccy=USDT", None)
            .await?;
        let detail = rows
            .first()
            .and_then(|b| b.details.iter().find(|d| d.ccy == "USDT"));

        Ok(match detail {
            Some(d) => Balance {
                free_usdt: parse_num(&d.avail_bal),
                used_usdt: parse_num(&d.frozen_bal),
                total_usdt: parse_num(&d.eq),
            },
            None => Balance::default(),
        })
    }

    async fn fetch_position(&self, symbol: &str) -> Result<Option<Position>> {
        let path = format!("/api/v5/account/positions?instId={symbol}");
        let rows: Vec<PositionData> = self.send(Method::GET, &path, None).await?;

        for row in &rows {
            if row.inst_id != symbol {
                continue;
            }
            let contracts = parse_num(&row.pos).abs();
            if contracts == 0.0 {
                continue;
            }
            let side = match row.pos_side.as_str() {
                "long" => PositionSide::Long,
                "short" => PositionSide::Short,
                // Net mode reports direction through the sign of `pos`.
                _ if parse_num(&row.pos) < 0.0 => PositionSide::Short,
                _ => PositionSide::Long,
            };
            let opened_at = row
                .c_time
                .parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

            return Ok(Some(Position {
                symbol: symbol.to_string(),
                side,
                contracts,
                entry_price: parse_num(&row.avg_px),
                notional: parse_num(&row.notional_usd),
                leverage: parse_num(&row.lever),
                margin: parse_num(&row.imr),
                unrealized_pnl: parse_num(&row.upl),
                opened_at,
            }));
        }
        Ok(None)
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<()> {
        let body = serde_json::to_string(&LeverageBody {
            inst_id: symbol.to_string(),
            lever: format_size(leverage),
            mgn_mode: "cross",
        })?;
        let _: Vec<serde_json::Value> = self
            .send(Method::POST, "/api/v5/account/set-leverage", Some(body))
            .await?;
        info!("leverage for {} set to {}x (cross)", symbol, leverage);
        Ok(())
    }

    async fn create_market_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let body = serde_json::to_string(&OrderBody {
            inst_id: req.symbol.clone(),
            td_mode: "cross",
            cl_ord_id: client_order_id(),
            side: req.side.to_string(),
            pos_side: req.pos_side.to_string(),
            ord_type: "market",
            sz: format_size(req.contracts),
            reduce_only: req.reduce_only,
        })?;

        let rows: Vec<OrderData> = self
            .send(Method::POST, "/api/v5/trade/order", Some(body))
            .await?;
        let order = rows
            .first()
            .ok_or_else(|| BotError::MalformedResponse("order response carried no data".into()))?;

        if order.s_code != "0" && !order.s_code.is_empty() {
            return Err(BotError::ExchangeRejection(format!(
                "order rejected, code {}: {}",
                order.s_code, order.s_msg
            )));
        }

        info!(
            "market order placed: {} {} {} contracts (reduce_only={}), id {}",
            req.side, req.symbol, req.contracts, req.reduce_only, order.ord_id
        );
        Ok(OrderAck {
            order_id: order.ord_id.clone(),
        })
    }

    async fn create_protective_order(&self, req: &ProtectiveOrder) -> Result<OrderAck> {
        let trigger = format_size(req.trigger_price);
        let (sl_trigger, sl_ord, tp_trigger, tp_ord) = match req.kind {
            // Ordered price "-1" means execute at market once triggered.
            ProtectiveKind::StopLoss => (Some(trigger), Some("-1".to_string()), None, None),
            ProtectiveKind::TakeProfit => (None, None, Some(trigger), Some("-1".to_string())),
        };

        let body = serde_json::to_string(&AlgoOrderBody {
            inst_id: req.symbol.clone(),
            td_mode: "cross",
            side: req.side.to_string(),
            pos_side: req.pos_side.to_string(),
            ord_type: "conditional",
            sz: format_size(req.contracts),
            reduce_only: true,
            sl_trigger_px: sl_trigger,
            sl_ord_px: sl_ord,
            tp_trigger_px: tp_trigger,
            tp_ord_px: tp_ord,
        })?;

        let rows: Vec<AlgoOrderData> = self
            .send(Method::POST, "/api/v5/trade/order-algo", Some(body))
            .await?;
        let order = rows.first().ok_or_else(|| {
            BotError::MalformedResponse("algo order response carried no data".into())
        })?;

        if order.s_code != "0" && !order.s_code.is_empty() {
            return Err(BotError::ExchangeRejection(format!(
                "protective order rejected, code {}: {}",
                order.s_code, order.s_msg
            )));
        }

        info!(
            "protective {:?} armed for {} at {:.2}, id {}",
            req.kind, req.symbol, req.trigger_price, order.algo_id
        );
        Ok(OrderAck {
            order_id: order.algo_id.clone(),
        })
    }

    async fn fetch_sentiment(&self, symbol: &str) -> Result<SentimentData> {
        let ccy = Self::base_currency(symbol);
        let mut sentiment = SentimentData::default();

        let ratio_path =
            format!("/api/v5/rubik/stat/contracts/long-short-account-ratio?ccy={ccy}&period=5m");
        match self.send::<Vec<String>>(Method::GET, &ratio_path, None).await {
            Ok(rows) => {
                if let Some(row) = rows.first() {
                    sentiment.long_short_ratio = row.get(1).map(|v| parse_num(v));
                }
            }
            Err(err) => warn!("long/short ratio fetch failed: {}", err),
        }

        let taker_path =
            format!("/api/v5/rubik/stat/taker-volume?ccy={ccy}&instType=CONTRACTS&period=5m");
        match self.send::<Vec<String>>(Method::GET, &taker_path, None).await {
            Ok(rows) => {
                if let Some(row) = rows.first() {
                    sentiment.taker_sell_volume = row.get(1).map(|v| parse_num(v));
                    sentiment.taker_buy_volume = row.get(2).map(|v| parse_num(v));
                }
            }
            Err(err) => warn!("taker volume fetch failed: {}", err),
        }

        Ok(sentiment)
    }

    async fn reset(&self) -> Result<()> {
        *self.http.write().await = build_http_client()?;
        info!("exchange HTTP session rebuilt");
        Ok(())
    }
}

fn build_http_client() -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()?)
}

fn client_order_id() -> String {
    // OKX accepts up to 32 alphanumeric characters.
    format!("pb{}", Uuid::new_v4().simple())
        .chars()
        .take(32)
        .collect()
}

/// Lenient numeric parse; OKX sends numbers as strings and omissions as "".
fn parse_num(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

/// Formats a size or price without trailing zeros ("2.40" -> "2.4").
fn format_size(value: f64) -> String {
    let text = format!("{value:.8}");
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// "15m" -> "15m", "1h" -> "1H", "4h" -> "4H", "1d" -> "1D". OKX bars
/// use uppercase for hours and above.
fn timeframe_to_bar(timeframe: &str) -> String {
    if timeframe.ends_with('h') || timeframe.ends_with('d') {
        timeframe.to_ascii_uppercase()
    } else {
        timeframe.to_string()
    }
}

fn parse_candle(row: &[String]) -> Option<Candle> {
    if row.len() < 6 {
        return None;
    }
    let ts_ms: i64 = row[0].parse().ok()?;
    Some(Candle {
        timestamp: Utc.timestamp_millis_opt(ts_ms).single()?,
        open: row[1].parse().ok()?,
        high: row[2].parse().ok()?,
        low: row[3].parse().ok()?,
        close: row[4].parse().ok()?,
        volume: row[5].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(2.4), "2.4");
        assert_eq!(format_size(0.01), "0.01");
        assert_eq!(format_size(10.0), "10");
        assert_eq!(format_size(50_000.0), "50000");
    }

    #[test]
    fn test_timeframe_to_bar() {
        assert_eq!(timeframe_to_bar("15m"), "15m");
        assert_eq!(timeframe_to_bar("1h"), "1H");
        assert_eq!(timeframe_to_bar("4h"), "4H");
        assert_eq!(timeframe_to_bar("1d"), "1D");
    }

    #[test]
    fn test_parse_num_tolerates_blanks() {
        assert_eq!(parse_num("120.5"), 120.5);
        assert_eq!(parse_num(""), 0.0);
        assert_eq!(parse_num("n/a"), 0.0);
    }

    #[test]
    fn test_client_order_id_shape() {
        let id = client_order_id();
        assert!(id.len() <= 32);
        assert!(id.starts_with("pb"));
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_envelope_decode() {
        let text = r#"{"code":"0","msg":"","data":[{"ctVal":"0.01","minSz":"1"}]}"#;
        let envelope: OkxEnvelope<InstrumentData> = serde_json::from_str(text).unwrap();
        assert_eq!(envelope.code, "0");
        assert_eq!(envelope.data.len(), 1);
        assert_eq!(parse_num(&envelope.data[0].ct_val), 0.01);
    }

    #[test]
    fn test_candle_row_parse_and_order() {
        let rows: Vec<Vec<String>> = vec![
            vec!["1700000900000", "101", "102", "100", "101.5", "12"]
                .into_iter()
                .map(String::from)
                .collect(),
            vec!["1700000000000", "100", "101", "99", "100.5", "10"]
                .into_iter()
                .map(String::from)
                .collect(),
        ];
        let mut candles: Vec<Candle> = rows.iter().filter_map(|r| parse_candle(r)).collect();
        candles.reverse();
        assert_eq!(candles.len(), 2);
        assert!(candles[0].timestamp < candles[1].timestamp);
        assert_eq!(candles[1].close, 101.5);
    }

    #[test]
    fn test_position_row_decode() {
        let text = r#"{"code":"0","msg":"","data":[{
            "instId":"BTC-USDT-SWAP","posSide":"long","pos":"2.4",
            "avgPx":"50000","upl":"12.5","lever":"10","imr":"120",
            "notionalUsd":"1200","cTime":"1700000000000"}]}"#;
        let envelope: OkxEnvelope<PositionData> = serde_json::from_str(text).unwrap();
        let row = &envelope.data[0];
        assert_eq!(row.pos_side, "long");
        assert_eq!(parse_num(&row.pos), 2.4);
        assert_eq!(parse_num(&row.avg_px), 50_000.0);
    }
}

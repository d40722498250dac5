// Decision pipeline: prompt -> advisory call -> tolerant parse ->
// validated Signal. The pipeline never lets advisory failures escape as
// anything other than a conservative fallback or an explicit call-level
// error the retry wrapper understands.

pub mod client;
pub mod parse;
pub mod prompt;

pub use client::AdvisorClient;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::BotError;
use crate::models::{CloseDecision, MarketSnapshot, Position, Signal};
use crate::ratelimit::retry_with_backoff;
use crate::Result;

// One retry on call-level failures only. A returned fallback is a
// decision, not an error, and is never retried.
const DECIDE_ATTEMPTS: u32 = 2;

pub struct DecisionPipeline {
    client: AdvisorClient,
}

impl DecisionPipeline {
    pub fn new(client: AdvisorClient) -> Self {
        Self { client }
    }

    /// One advisory round trip. `Err` means the call itself failed and
    /// may be retried; undecodable output degrades to a fallback signal
    /// without a second paid call.
    pub async fn decide(
        &self,
        snapshot: &MarketSnapshot,
        position: Option<&Position>,
        last_signal: Option<&Signal>,
    ) -> Result<Signal> {
        let user = prompt::open_prompt(snapshot, position, last_signal);
        let text = match self.client.chat(prompt::OPEN_SYSTEM, &user).await {
            Ok(text) => text,
            Err(BotError::MalformedResponse(msg)) => {
                warn!("advisory response unusable: {}", msg);
                return Ok(Signal::fallback(snapshot.last_price, msg));
            }
            Err(err) => return Err(err),
        };

        match parse::decode_signal(&text) {
            Ok(raw) => Ok(Signal {
                action: raw.signal,
                confidence: raw.confidence,
                stop_loss: raw.stop_loss,
                take_profit: raw.take_profit,
                reason: raw.reason,
                timestamp: Utc::now(),
                is_fallback: false,
            }),
            Err(err) => {
                warn!("advisory output failed to decode: {}", err);
                Ok(Signal::fallback(
                    snapshot.last_price,
                    format!("advisory output undecodable: {err}"),
                ))
            }
        }
    }

    /// `decide` with bounded retries on call-level failures. Always
    /// produces a signal; exhausted retries yield the fallback.
    pub async fn decide_with_retry(
        &self,
        snapshot: &MarketSnapshot,
        position: Option<&Position>,
        last_signal: Option<&Signal>,
    ) -> Signal {
        let result = retry_with_backoff(DECIDE_ATTEMPTS, "advisory decision", || {
            self.decide(snapshot, position, last_signal)
        })
        .await;

        result.unwrap_or_else(|err| {
            warn!("advisory service unreachable after retries: {}", err);
            Signal::fallback(snapshot.last_price, "advisory service unreachable")
        })
    }

    /// Close review for an open position. The minimum-hold gate short-
    /// circuits before any paid call; anything other than an unambiguous
    /// "close" comes back as None.
    pub async fn should_close(
        &self,
        position: &Position,
        snapshot: &MarketSnapshot,
        opened_at: Option<DateTime<Utc>>,
        min_hold_minutes: i64,
    ) -> Option<CloseDecision> {
        if let Some(opened) = opened_at {
            let held = (Utc::now() - opened).num_minutes();
            if held < min_hold_minutes {
                info!(
                    "position held {}min of {}min minimum, skipping close review",
                    held, min_hold_minutes
                );
                return None;
            }
        }

        let user = prompt::close_prompt(position, snapshot);
        let text = match self.client.chat(prompt::CLOSE_SYSTEM, &user).await {
            Ok(text) => text,
            Err(err) => {
                warn!("close review call failed, keeping position: {}", err);
                return None;
            }
        };

        match parse::decode_close(&text) {
            Ok(raw) if raw.should_close => Some(CloseDecision {
                should_close: true,
                reason: raw.reason,
                urgency: raw.urgency,
                expected_outcome: raw.expected_outcome,
            }),
            Ok(_) => None,
            Err(err) => {
                warn!("close review output undecodable, keeping position: {}", err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdvisorSettings;
    use crate::market::compute_indicators;
    use crate::models::{Candle, Confidence, PositionSide, SignalAction};
    use chrono::TimeZone;

    fn snapshot() -> MarketSnapshot {
        let candles: Vec<Candle> = (0..30)
            .map(|i| Candle {
                timestamp: Utc.timestamp_opt(1_700_000_000 + i * 900, 0).unwrap(),
                open: 50_000.0,
                high: 50_100.0,
                low: 49_900.0,
                close: 50_000.0,
                volume: 100.0,
            })
            .collect();
        let indicators = compute_indicators(&candles);
        MarketSnapshot {
            symbol: "BTC-USDT-SWAP".to_string(),
            last_price: 50_000.0,
            candles,
            indicators,
            sentiment: None,
            fetched_at: Utc::now(),
        }
    }

    fn position() -> Position {
        Position {
            symbol: "BTC-USDT-SWAP".to_string(),
            side: PositionSide::Long,
            contracts: 2.4,
            entry_price: 50_000.0,
            notional: 1_200.0,
            leverage: 10.0,
            margin: 120.0,
            unrealized_pnl: 0.0,
            opened_at: Some(Utc::now()),
        }
    }

    fn pipeline(base_url: &str) -> DecisionPipeline {
        let settings = AdvisorSettings {
            api_key: "sk-test".to_string(),
            base_url: base_url.to_string(),
            model: "deepseek-chat".to_string(),
            timeout_secs: 5,
        };
        DecisionPipeline::new(AdvisorClient::new(&settings).unwrap())
    }

    fn chat_body(content: &str) -> String {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_decide_parses_valid_signal() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(chat_body(
                r#"{"signal":"BUY","reason":"breakout","stop_loss":49000.0,"take_profit":52000.0,"confidence":"HIGH"}"#,
            ))
            .create_async()
            .await;

        let signal = pipeline(&server.url())
            .decide(&snapshot(), None, None)
            .await
            .unwrap();
        assert_eq!(signal.action, SignalAction::Buy);
        assert_eq!(signal.confidence, Confidence::High);
        assert!(!signal.is_fallback);
    }

    #[tokio::test]
    async fn test_unparsable_output_degrades_to_fallback_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(chat_body("I refuse to answer in JSON today."))
            .expect(1)
            .create_async()
            .await;

        let signal = pipeline(&server.url())
            .decide(&snapshot(), None, None)
            .await
            .unwrap();
        assert!(signal.is_fallback);
        assert_eq!(signal.action, SignalAction::Hold);
        assert_eq!(signal.stop_loss, 49_000.0);
        mock.assert_async().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_decide_with_retry_falls_back_after_exhaustion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .with_body("down")
            .expect(2)
            .create_async()
            .await;

        let signal = pipeline(&server.url())
            .decide_with_retry(&snapshot(), None, None)
            .await;
        assert!(signal.is_fallback);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_min_hold_gate_skips_advisory_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .expect(0)
            .create_async()
            .await;

        let pos = position(); // opened just now
        let decision = pipeline(&server.url())
            .should_close(&pos, &snapshot(), pos.opened_at, 30)
            .await;
        assert!(decision.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_close_verdict_true_passes_through() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(chat_body(
                r#"{"should_close":true,"reason":"trend reversed","urgency":"high","expected_outcome":"avoid drawdown"}"#,
            ))
            .create_async()
            .await;

        let pos = position();
        let opened = Some(Utc::now() - chrono::Duration::minutes(45));
        let decision = pipeline(&server.url())
            .should_close(&pos, &snapshot(), opened, 30)
            .await
            .unwrap();
        assert!(decision.should_close);
        assert_eq!(decision.reason, "trend reversed");
    }

    #[tokio::test]
    async fn test_close_verdict_false_or_broken_is_none() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(chat_body(r#"{"should_close":false,"reason":"hold"}"#))
            .create_async()
            .await;

        let pos = position();
        let opened = Some(Utc::now() - chrono::Duration::minutes(45));
        let decision = pipeline(&server.url())
            .should_close(&pos, &snapshot(), opened, 30)
            .await;
        assert!(decision.is_none());
    }
}

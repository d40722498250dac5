// Chat-completions client for the advisory service (OpenAI-compatible).

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AdvisorSettings;
use crate::error::BotError;
use crate::Result;

const CHAT_PATH: &str = "/chat/completions";
const TEMPERATURE: f64 = 0.3;
const MAX_TOKENS: u32 = 800;

pub struct AdvisorClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl AdvisorClient {
    pub fn new(settings: &AdvisorSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        })
    }

    /// One paid completion call. Returns the raw assistant text; parsing
    /// and fallback policy live with the caller.
    pub async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
        };

        let url = format!("{}{}", self.base_url, CHAT_PATH);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status.as_u16() == 429 {
            return Err(BotError::RateLimited(format!("advisor HTTP 429: {text}")));
        }
        if !status.is_success() {
            return Err(BotError::Transient(format!(
                "advisor HTTP {status}: {text}"
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| BotError::Transient(format!("advisor response decode: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| BotError::MalformedResponse("advisor returned no choices".into()))?;

        debug!("advisor returned {} chars", content.len());
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_url: &str) -> AdvisorSettings {
        AdvisorSettings {
            api_key: "sk-test".to_string(),
            base_url: base_url.to_string(),
            model: "deepseek-chat".to_string(),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_chat_returns_assistant_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"{\"signal\":\"HOLD\"}"}}]}"#)
            .create_async()
            .await;

        let client = AdvisorClient::new(&settings(&server.url())).unwrap();
        let content = client.chat("system", "user").await.unwrap();
        assert_eq!(content, "{\"signal\":\"HOLD\"}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_choices_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let client = AdvisorClient::new(&settings(&server.url())).unwrap();
        let err = client.chat("system", "user").await.unwrap_err();
        assert!(matches!(err, BotError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .with_body("upstream down")
            .create_async()
            .await;

        let client = AdvisorClient::new(&settings(&server.url())).unwrap();
        let err = client.chat("system", "user").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_429_maps_to_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let client = AdvisorClient::new(&settings(&server.url())).unwrap();
        let err = client.chat("system", "user").await.unwrap_err();
        assert!(err.is_rate_limited());
    }
}

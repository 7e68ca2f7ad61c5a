//! Webhook LLM adapter: POST the transcript, read the reply text.
//!
//! Fits workflow engines that expose a single HTTP endpoint. The reply
//! may be JSON (text under a configurable key) or a plain-text body.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::traits::{AdapterError, AdapterResult, ComponentAdapter, LlmAdapter};
use crate::config::{AdapterOptions, WebhookProviderConfig};
use crate::session::{ConversationRole, HistoryEntry};

const DEFAULT_TIMEOUT_SEC: u64 = 10;

/// LLM behind a plain HTTP webhook.
pub struct WebhookLlm {
    key: String,
    provider: WebhookProviderConfig,
    http: Client,
}

impl WebhookLlm {
    pub fn new(key: impl Into<String>, provider: WebhookProviderConfig) -> Self {
        Self {
            key: key.into(),
            provider,
            http: Client::new(),
        }
    }

    fn extract_text(&self, body: &str) -> Option<String> {
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(json) => json
                .get(&self.provider.response_key)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string()),
            // Not JSON: the body itself is the reply.
            Err(_) => Some(body.trim().to_string()),
        }
    }
}

#[async_trait]
impl ComponentAdapter for WebhookLlm {
    fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl LlmAdapter for WebhookLlm {
    async fn generate(
        &self,
        call_id: &str,
        transcript: &str,
        history: &[HistoryEntry],
        options: &AdapterOptions,
    ) -> AdapterResult<String> {
        let url = options
            .base_url
            .as_deref()
            .unwrap_or(self.provider.url.as_str());
        let timeout = options.timeout_sec(DEFAULT_TIMEOUT_SEC);

        let context: Vec<serde_json::Value> = history
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "role": match entry.role {
                        ConversationRole::System => "system",
                        ConversationRole::User => "user",
                        ConversationRole::Assistant => "assistant",
                    },
                    "content": entry.content,
                })
            })
            .collect();

        log::debug!(
            "[Webhook] LLM request for call {} ({} context entries)",
            call_id,
            context.len()
        );

        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({
                "call_id": call_id,
                "transcript": transcript,
                "context": context,
            }))
            .timeout(Duration::from_secs(timeout))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout(timeout)
                } else {
                    AdapterError::Refused(format!("webhook request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(AdapterError::Refused(format!("webhook HTTP {}", status)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AdapterError::Protocol(e.to_string()))?;

        match self.extract_text(&body) {
            Some(text) if !text.is_empty() => Ok(text),
            _ => Err(AdapterError::EmptyResponse(self.key.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> WebhookLlm {
        WebhookLlm::new(
            "webhook_llm",
            WebhookProviderConfig {
                url: "http://127.0.0.1:9/llm".to_string(),
                response_key: "response".to_string(),
            },
        )
    }

    #[test]
    fn extracts_configured_json_key() {
        let text = adapter().extract_text(r#"{"response": " All set. ", "other": 1}"#);
        assert_eq!(text, Some("All set.".to_string()));
    }

    #[test]
    fn json_without_the_key_yields_none() {
        assert_eq!(adapter().extract_text(r#"{"output": "hi"}"#), None);
    }

    #[test]
    fn plain_text_body_is_used_verbatim() {
        assert_eq!(
            adapter().extract_text("  Hello caller.  "),
            Some("Hello caller.".to_string())
        );
    }
}

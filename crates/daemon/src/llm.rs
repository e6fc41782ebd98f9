//! Anthropic Messages API client

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use flowscout_common::{
    AgentMessage, ContentBlock, Error, ModelClient, ModelResponse, Result, ToolDef,
};

use crate::config::ModelConfig;

const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: &'a [AgentMessage],
    #[serde(skip_serializing_if = "<[ToolDef]>::is_empty")]
    tools: &'a [ToolDef],
}

pub struct AnthropicClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl AnthropicClient {
    /// Build a client reading the key from `config.api_key_env`
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        if api_key.is_empty() {
            warn!("{} is not set; model calls will fail", config.api_key_env);
        }
        Self::new(config, api_key)
    }

    pub fn new(config: &ModelConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Model(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
        })
    }

    async fn send(&self, system: &str, messages: &[AgentMessage], tools: &[ToolDef]) -> Result<ModelResponse> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages,
            tools,
        };
        debug!("model request: {} message(s), {} tool(s)", messages.len(), tools.len());

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Model(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<response unavailable>".to_string());
            return Err(Error::Model(format!("model returned {}: {}", status, text)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| Error::Model(format!("invalid response: {}", e)))?;
        parse_response(payload)
    }
}

/// Decode a Messages API response, dropping block types this client does
/// not model
fn parse_response(payload: Value) -> Result<ModelResponse> {
    let blocks = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Model("response has no content".to_string()))?;

    let content = blocks
        .iter()
        .filter_map(|block| serde_json::from_value::<ContentBlock>(block.clone()).ok())
        .collect();
    let stop_reason = payload
        .get("stop_reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ModelResponse {
        content,
        stop_reason,
    })
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn analyze_with_image(&self, prompt: &str, image: &str) -> Result<String> {
        let message = AgentMessage::user(vec![ContentBlock::png(image), ContentBlock::text(prompt)]);
        let response = self.send("", std::slice::from_ref(&message), &[]).await?;
        Ok(response.text())
    }

    async fn call_with_tools(
        &self,
        system_prompt: &str,
        transcript: &[AgentMessage],
        tools: &[ToolDef],
    ) -> Result<ModelResponse> {
        self.send(system_prompt, transcript, tools).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let messages = vec![AgentMessage::user(vec![ContentBlock::text("hi")])];
        let tools = vec![ToolDef {
            name: "click".to_string(),
            description: "Click".to_string(),
            input_schema: json!({"type": "object"}),
        }];
        let body = MessagesRequest {
            model: "m",
            max_tokens: 64,
            system: "be brief",
            messages: &messages,
            tools: &tools,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["system"], "be brief");
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"][0]["type"], "text");
        assert_eq!(value["tools"][0]["input_schema"]["type"], "object");

        let bare = MessagesRequest {
            model: "m",
            max_tokens: 64,
            system: "",
            messages: &messages,
            tools: &[],
        };
        let value = serde_json::to_value(&bare).unwrap();
        assert!(value.get("system").is_none());
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn test_parse_response_skips_unknown_blocks() {
        let response = parse_response(json!({
            "id": "msg_1",
            "content": [
                {"type": "thinking", "thinking": "..."},
                {"type": "text", "text": "Clicking login"},
                {"type": "tool_use", "id": "toolu_1", "name": "click", "input": {"x": 1, "y": 2}}
            ],
            "stop_reason": "tool_use"
        }))
        .unwrap();

        assert_eq!(response.content.len(), 2);
        assert_eq!(response.text(), "Clicking login");
        assert_eq!(response.tool_calls()[0].name, "click");
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));

        assert!(parse_response(json!({"error": "overloaded"})).is_err());
    }
}

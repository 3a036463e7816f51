//! Tool-calling chat client interface
//!
//! The insight scheduler and the cron runner both drive an external
//! analyzer through this interface: send a prompt plus tool descriptors,
//! get back either tool calls to dispatch locally or a final text turn.
//! The HTTP implementation speaks an Anthropic-style messages endpoint;
//! tests substitute their own [`ChatClient`].

use crate::config::AnalyzerConfig;
use crate::error::{Error, Result};
use crate::types::{FollowUpAction, InsightQuestion};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A tool offered to the analyzer.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One tool invocation requested by the analyzer.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// What the analyzer did with its turn.
#[derive(Debug)]
pub enum ChatTurn {
    /// Dispatch these calls and feed the results back
    ToolCalls(Vec<ToolCall>),
    /// Final answer text
    EndTurn(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

/// A completed analyzer turn.
#[derive(Debug)]
pub struct ChatResponse {
    pub turn: ChatTurn,
    /// Raw content blocks, appended verbatim as the assistant message when
    /// continuing the conversation
    pub content: Value,
    pub usage: Option<ChatUsage>,
    pub model: Option<String>,
}

/// Tool-calling chat client (external collaborator).
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        messages: &[Value],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse>;
}

/// Channel follow-up questions are posted to (external collaborator).
/// When no channel is configured, insights finish as `final-no-answers`.
#[async_trait]
pub trait QuestionChannel: Send + Sync {
    async fn post_question(&self, question: &InsightQuestion) -> Result<()>;
}

/// HTTP client for an Anthropic-style messages endpoint.
pub struct HttpChatClient {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpChatClient {
    /// Create a client from configuration.
    ///
    /// Returns an error when no API key is configured; callers treat that as
    /// "analyzer-backed features disabled".
    pub fn new(config: &AnalyzerConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("analyzer API key is not configured".to_string()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            "x-api-key",
            reqwest::header::HeaderValue::from_str(&api_key)
                .map_err(|e| Error::Config(format!("invalid analyzer api key: {}", e)))?,
        );
        headers.insert(
            "anthropic-version",
            reqwest::header::HeaderValue::from_static("2023-06-01"),
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(
        &self,
        system: &str,
        messages: &[Value],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);

        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": 4096,
            "system": system,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Analyzer(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(Error::Analyzer(format!(
                "API error ({}): {}",
                status, error_text
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Analyzer(format!("failed to parse response: {}", e)))?;

        Ok(parse_response(body))
    }
}

/// Split a messages-API response body into tool calls or a final turn.
pub fn parse_response(body: Value) -> ChatResponse {
    let content = body.get("content").cloned().unwrap_or(Value::Array(vec![]));
    let stop_reason = body.get("stop_reason").and_then(Value::as_str);

    let mut tool_calls = Vec::new();
    let mut text = String::new();
    if let Some(blocks) = content.as_array() {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    text.push_str(block.get("text").and_then(Value::as_str).unwrap_or(""));
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
    }

    let turn = if stop_reason == Some("tool_use") && !tool_calls.is_empty() {
        ChatTurn::ToolCalls(tool_calls)
    } else {
        ChatTurn::EndTurn(text)
    };

    ChatResponse {
        turn,
        content,
        usage: body
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok()),
        model: body
            .get("model")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
    }
}

// ============================================
// Analyzer report schema
// ============================================

/// The fixed JSON object the insight analyzer must return.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzerReport {
    pub summary: String,
    #[serde(default)]
    pub user_intent: Option<String>,
    #[serde(default)]
    pub frustration_points: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default)]
    pub follow_up_actions: Vec<FollowUpAction>,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub stats: Option<Value>,
}

/// Extract the report object from a final analyzer turn.
///
/// Tolerates markdown fences and prose around the JSON object; anything
/// unparseable is an analyzer error (never retried within the run).
pub fn parse_report(text: &str) -> Result<AnalyzerReport> {
    let trimmed = text.trim();

    if let Ok(report) = serde_json::from_str::<AnalyzerReport>(trimmed) {
        return Ok(report);
    }

    // Fall back to the outermost brace span
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(report) = serde_json::from_str::<AnalyzerReport>(&trimmed[start..=end]) {
                return Ok(report);
            }
        }
    }

    Err(Error::Analyzer(format!(
        "unparseable analyzer output: {}",
        &trimmed.chars().take(200).collect::<String>()
    )))
}

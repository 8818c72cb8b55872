//! Streaming client for the Ark responses API.
//!
//! Speaks the provider's server-sent-event framing: each frame is a
//! `data: {json}` line whose `type` field selects between output deltas,
//! reasoning deltas, and web-search lifecycle notices.

use async_trait::async_trait;
use futures::{stream, TryStreamExt};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{LlmConfig, ThinkingMode};

use super::{ChatModel, ChatRequest, ChunkStream, LlmError, LlmResult, StreamChunk};

/// Reqwest-backed implementation of [`ChatModel`].
#[derive(Clone)]
pub struct ArkClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ArkClient {
    pub fn new(config: &LlmConfig) -> LlmResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| LlmError::NotConfigured("ARK_API_KEY is not set".to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn build_body(request: &ChatRequest) -> Value {
        let input = json!([
            {
                "role": "system",
                "content": [{"type": "input_text", "text": request.system_prompt}]
            },
            {
                "role": "user",
                "content": [{"type": "input_text", "text": request.user_prompt}]
            }
        ]);

        let mut body = json!({
            "model": request.model,
            "input": input,
            "stream": true,
        });

        if request.use_websearch {
            body["tools"] = json!([{"type": "web_search", "limit": request.websearch_limit}]);
        }
        if request.thinking_mode != ThinkingMode::Disabled {
            body["thinking"] = json!({"type": request.thinking_mode.to_string()});
        }
        body
    }
}

#[async_trait]
impl ChatModel for ArkClient {
    async fn stream_chat(&self, request: ChatRequest) -> LlmResult<ChunkStream> {
        let body = Self::build_body(&request);
        debug!(
            model = %request.model,
            use_websearch = request.use_websearch,
            thinking_mode = %request.thinking_mode,
            "starting model stream"
        );

        let response = self
            .http
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let mut parser = SseFrameParser::default();
        let chunks = response
            .bytes_stream()
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Http(e.to_string())
                }
            })
            .map_ok(move |bytes| {
                let parsed = parser.feed(&bytes);
                stream::iter(parsed.into_iter().map(Ok))
            })
            .try_flatten();

        Ok(Box::pin(chunks))
    }
}

/// Incremental parser for `data: {json}` frames split across TCP reads.
#[derive(Default)]
struct SseFrameParser {
    buffer: String,
}

impl SseFrameParser {
    /// Feed raw bytes, return every chunk completed by this read.
    fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            if let Some(chunk) = parse_data_line(&line) {
                out.push(chunk);
            }
        }
        out
    }
}

fn parse_data_line(line: &str) -> Option<StreamChunk> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }

    let value: Value = serde_json::from_str(payload).ok()?;
    match value.get("type").and_then(Value::as_str) {
        Some("response.output_text.delta") => value
            .get("delta")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(|d| StreamChunk::OutputDelta(d.to_string())),
        Some("response.reasoning_summary_text.delta") => value
            .get("delta")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(|d| StreamChunk::ThinkingDelta(d.to_string())),
        Some("response.web_search_call.searching") => Some(StreamChunk::SearchStarted),
        Some("response.web_search_call.completed") => {
            let sources = value
                .get("results")
                .and_then(Value::as_array)
                .map(|results| {
                    results
                        .iter()
                        .filter_map(|r| r.get("url").and_then(Value::as_str))
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();
            Some(StreamChunk::SearchCompleted { sources })
        }
        // Older frame format carries the delta without a type tag.
        None => value
            .get("delta")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .map(|d| StreamChunk::OutputDelta(d.to_string())),
        Some(_) => None,
    }
}

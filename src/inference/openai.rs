use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::sse::drain_data_lines;
use super::{ChunkStream, InferenceProvider};
use crate::error::InferenceError;
use crate::types::{
    ContentBlock, InferenceRequest, InferenceResponse, Role, StopReason, StreamChunk, ToolCall,
    Turn, Usage,
};

/// OpenAI-compatible provider. Works with OpenAI, vLLM, LM Studio, OpenRouter,
/// or any server that implements the `/v1/chat/completions` endpoint.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Set an API key (required for OpenAI, OpenRouter, etc.).
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Convert `{name, description, input_schema}` tool schemas to
    /// OpenAI function-calling format.
    fn convert_tools(tools: &[Value]) -> Vec<Value> {
        tools
            .iter()
            .filter_map(|tool| {
                let name = tool["name"].as_str()?;
                let description = tool.get("description").cloned().unwrap_or(Value::Null);
                let parameters = tool
                    .get("input_schema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}}));

                Some(json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": description,
                        "parameters": parameters,
                    }
                }))
            })
            .collect()
    }

    /// Convert typed turns to OpenAI chat messages.
    fn convert_messages(system: Option<&str>, turns: &[Turn]) -> Vec<Value> {
        let mut out = Vec::with_capacity(turns.len() + 1);

        if let Some(sys) = system {
            out.push(json!({ "role": "system", "content": sys }));
        }

        for turn in turns {
            match turn.role {
                Role::User => out.push(json!({ "role": "user", "content": turn.content })),
                Role::System => out.push(json!({ "role": "system", "content": turn.content })),
                Role::Assistant if turn.tool_calls.is_empty() => {
                    out.push(json!({ "role": "assistant", "content": turn.content }))
                }
                Role::Assistant => {
                    let tool_calls: Vec<Value> = turn
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": render_arguments(&call.input),
                                }
                            })
                        })
                        .collect();
                    let content = if turn.content.is_empty() {
                        Value::Null
                    } else {
                        Value::String(turn.content.clone())
                    };
                    out.push(json!({
                        "role": "assistant",
                        "content": content,
                        "tool_calls": tool_calls,
                    }));
                }
                Role::Tool => out.push(json!({
                    "role": "tool",
                    "tool_call_id": turn.tool_call_id,
                    "content": turn.content,
                })),
            }
        }

        out
    }

    fn body(request: &InferenceRequest) -> Value {
        let messages = Self::convert_messages(request.system.as_deref(), &request.messages);

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": 0,
            "messages": messages,
        });

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(Self::convert_tools(&request.tools));
        }

        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, InferenceError> {
        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        if let Some(ref key) = self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let resp = req
            .json(body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            return Err(InferenceError::ApiError { status, body: text });
        }

        Ok(resp)
    }
}

#[async_trait]
impl InferenceProvider for OpenAiProvider {
    async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        let body = Self::body(&request);

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "openai inference request"
        );

        let text = self
            .send(&body)
            .await?
            .text()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))?;

        parse_completion(&parsed)
    }

    async fn infer_stream(&self, request: InferenceRequest) -> Result<ChunkStream, InferenceError> {
        let mut body = Self::body(&request);
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "openai streaming request"
        );

        let mut response = self.send(&body).await?;

        let stream = async_stream::stream! {
            let mut pending: Vec<u8> = Vec::new();
            let mut buffer = String::new();
            let mut assembler = StreamAssembler::default();

            loop {
                match response.chunk().await {
                    Ok(Some(bytes)) => {
                        pending.extend_from_slice(&bytes);
                        // Hold back a multi-byte character split across chunks.
                        let valid = match std::str::from_utf8(&pending) {
                            Ok(s) => s.len(),
                            Err(e) => e.valid_up_to(),
                        };
                        buffer.push_str(&String::from_utf8_lossy(&pending[..valid]));
                        pending.drain(..valid);

                        for data in drain_data_lines(&mut buffer) {
                            for chunk in assembler.push(&data) {
                                yield chunk;
                            }
                        }
                    }
                    Ok(None) => {
                        if !buffer.trim().is_empty() {
                            buffer.push_str("\n\n");
                            for data in drain_data_lines(&mut buffer) {
                                for chunk in assembler.push(&data) {
                                    yield chunk;
                                }
                            }
                        }
                        for chunk in assembler.flush() {
                            yield chunk;
                        }
                        break;
                    }
                    Err(e) => {
                        yield Err(InferenceError::Request(e.to_string()));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        input_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        output_tokens: v.get("completion_tokens")?.as_u64()? as u32,
    })
}

/// Malformed argument JSON is kept verbatim as a string so the tool
/// boundary can reject it and tell the model.
fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(error = %e, "model sent malformed tool arguments");
        Value::String(raw.to_string())
    })
}

fn render_arguments(input: &Value) -> String {
    match input {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn parse_completion(parsed: &Value) -> Result<InferenceResponse, InferenceError> {
    let choice = parsed["choices"]
        .get(0)
        .ok_or_else(|| InferenceError::Parse("response has no choices".into()))?;

    let stop_reason = match choice["finish_reason"].as_str().unwrap_or("stop") {
        "stop" => StopReason::EndTurn,
        "tool_calls" => StopReason::ToolUse,
        "length" => StopReason::MaxTokens,
        other => {
            debug!(finish_reason = %other, "unknown finish_reason, treating as EndTurn");
            StopReason::EndTurn
        }
    };

    let message = &choice["message"];
    let mut content = Vec::new();

    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(ContentBlock::Text(text.to_string()));
        }
    }

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tc in tool_calls {
            content.push(ContentBlock::ToolUse {
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                input: parse_arguments(tc["function"]["arguments"].as_str().unwrap_or("")),
            });
        }
    }

    Ok(InferenceResponse {
        stop_reason,
        content,
        usage: parse_usage(&parsed["usage"]).unwrap_or_default(),
    })
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles streamed deltas. Tool calls are buffered by index and
/// released whole once the choice finishes. Text passes through as it
/// arrives until the first tool-call fragment; after that it is held and
/// released behind the calls.
#[derive(Debug, Default)]
pub(crate) struct StreamAssembler {
    calls: BTreeMap<u64, PartialCall>,
    held: String,
}

impl StreamAssembler {
    pub(crate) fn push(&mut self, data: &str) -> Vec<Result<StreamChunk, InferenceError>> {
        if data == "[DONE]" {
            return self.flush();
        }

        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => return vec![Err(InferenceError::Parse(e.to_string()))],
        };

        let mut out = Vec::new();

        if let Some(usage) = parse_usage(&v["usage"]) {
            out.push(Ok(StreamChunk::Usage(usage)));
        }

        let Some(choice) = v["choices"].get(0) else {
            return out;
        };
        let delta = &choice["delta"];

        if let Some(deltas) = delta["tool_calls"].as_array() {
            for tc in deltas {
                let index = tc["index"].as_u64().unwrap_or(0);
                let call = self.calls.entry(index).or_default();
                if let Some(id) = tc["id"].as_str() {
                    call.id = id.to_string();
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    call.name.push_str(name);
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    call.arguments.push_str(args);
                }
            }
        }

        if let Some(text) = delta["content"].as_str() {
            if self.calls.is_empty() {
                if !text.is_empty() {
                    out.push(Ok(StreamChunk::Token(text.to_string())));
                }
            } else {
                self.held.push_str(text);
            }
        }

        if choice["finish_reason"].is_string() {
            out.extend(self.flush());
        }

        out
    }

    pub(crate) fn flush(&mut self) -> Vec<Result<StreamChunk, InferenceError>> {
        let mut out: Vec<_> = std::mem::take(&mut self.calls)
            .into_values()
            .map(|call| {
                Ok(StreamChunk::ToolCall(ToolCall {
                    id: call.id,
                    name: call.name,
                    input: parse_arguments(&call.arguments),
                }))
            })
            .collect();
        if !self.held.is_empty() {
            out.push(Ok(StreamChunk::Token(std::mem::take(&mut self.held))));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_tool_round_trip_messages() {
        let turns = vec![
            Turn::user("what's in my cart?"),
            Turn::assistant_tool_calls(
                "",
                vec![ToolCall {
                    id: "call_1".into(),
                    name: "get_current_cart".into(),
                    input: json!({}),
                }],
            ),
            Turn::tool_result("call_1", "get_current_cart", "Your cart is empty."),
            Turn::system("Summary of earlier conversation: nothing yet"),
        ];

        let out = OpenAiProvider::convert_messages(Some("be brief"), &turns);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0]["role"], "system");
        assert_eq!(out[2]["role"], "assistant");
        assert!(out[2]["content"].is_null());
        assert_eq!(out[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(out[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(out[3]["role"], "tool");
        assert_eq!(out[3]["tool_call_id"], "call_1");
        assert_eq!(out[4]["role"], "system");
    }

    #[test]
    fn converts_tool_schemas_to_functions() {
        let tools = OpenAiProvider::convert_tools(&[json!({
            "name": "clear_cart",
            "description": "Remove everything",
            "input_schema": {"type": "object", "properties": {}}
        })]);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "clear_cart");
        assert_eq!(tools[0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn parses_tool_call_completion() {
        let parsed = json!({
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_7",
                        "type": "function",
                        "function": {"name": "add_to_cart", "arguments": "{\"product_id\": 7}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 18}
        });

        let response = parse_completion(&parsed).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.input_tokens, 120);
        match &response.content[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_7");
                assert_eq!(name, "add_to_cart");
                assert_eq!(input["product_id"], 7);
            }
            other => panic!("expected tool use, got {other:?}"),
        }
    }

    #[test]
    fn missing_choices_is_parse_error() {
        let err = parse_completion(&json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, InferenceError::Parse(_)));
    }

    #[test]
    fn assembler_passes_tokens_through() {
        let mut asm = StreamAssembler::default();
        let out = asm.push(r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#);
        assert!(matches!(&out[0], Ok(StreamChunk::Token(t)) if t == "Hel"));
        let out = asm.push(r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#);
        assert_eq!(out.len(), 1);
        assert!(asm.push("[DONE]").is_empty());
    }

    #[test]
    fn assembler_joins_tool_call_fragments_by_index() {
        let mut asm = StreamAssembler::default();
        asm.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"search_products","arguments":""}}]}}]}"#);
        asm.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"get_current_cart","arguments":"{}"}}]}}]}"#);
        asm.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"query\":"}}]}}]}"#);
        asm.push(r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"tents\"}"}}]}}]}"#);
        let out = asm.push(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);

        let calls: Vec<ToolCall> = out
            .into_iter()
            .filter_map(|c| match c {
                Ok(StreamChunk::ToolCall(call)) => Some(call),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].input["query"], "tents");
        assert_eq!(calls[1].name, "get_current_cart");
    }

    #[test]
    fn text_after_a_tool_call_fragment_is_released_behind_the_call() {
        let mut asm = StreamAssembler::default();
        let mut out = Vec::new();
        for line in [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"get_current_cart","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"content":"Let me look that up."}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ] {
            out.extend(asm.push(line));
        }

        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Ok(StreamChunk::ToolCall(c)) if c.id == "call_1"));
        assert!(matches!(&out[1], Ok(StreamChunk::Token(t)) if t == "Let me look that up."));
    }

    #[test]
    fn malformed_arguments_are_kept_verbatim() {
        let input = parse_arguments(r#"{"product_id": 7"#);
        assert_eq!(input, Value::String(r#"{"product_id": 7"#.into()));
        assert_eq!(render_arguments(&input), r#"{"product_id": 7"#);
        assert_eq!(parse_arguments("  "), json!({}));
        assert_eq!(render_arguments(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn assembler_reports_usage_chunk() {
        let mut asm = StreamAssembler::default();
        let out = asm.push(r#"{"choices":[],"usage":{"prompt_tokens":50,"completion_tokens":9}}"#);
        assert!(matches!(&out[0], Ok(StreamChunk::Usage(u)) if u.output_tokens == 9));
    }
}

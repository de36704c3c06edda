//! Wire-format independent view of one call.
//!
//! Anthropic content blocks and OpenAI chat messages both reduce to
//! [`NormalizedMessage`]. Normalization is total: fields that are unknown or
//! malformed are dropped rather than reported.

use crate::record::RawCallRecord;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use traj_core::canonical_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" | "developer" => Some(Self::System),
            "user" | "human" => Some(Self::User),
            "assistant" | "model" => Some(Self::Assistant),
            "tool" | "function" => Some(Self::Tool),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    Reasoning(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
}

impl NormalizedMessage {
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        parts.join("\n")
    }

    pub fn reasoning(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Reasoning(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn tool_results(&self) -> Vec<&ToolResult> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }

    /// Comparison key shared by deduplication and merging. Covers only the
    /// stable subset of a message: reasoning, tool-call ids and anything the
    /// wire format attaches for caching never take part.
    pub fn fingerprint_key(&self) -> String {
        let mut parts: Vec<Value> = Vec::new();
        let mut pending_text: Option<String> = None;
        for block in &self.blocks {
            match block {
                ContentBlock::Text(t) => {
                    pending_text = Some(match pending_text.take() {
                        Some(prev) => format!("{}\n{}", prev, t),
                        None => t.clone(),
                    });
                    continue;
                }
                ContentBlock::Reasoning(_) => continue,
                _ => {}
            }
            if let Some(text) = pending_text.take() {
                parts.push(json!({"text": text}));
            }
            match block {
                ContentBlock::ToolCall(call) => {
                    parts.push(json!({"call": call.name, "arguments": call.arguments}));
                }
                ContentBlock::ToolResult(result) => {
                    parts.push(json!({"result": result.content, "is_error": result.is_error}));
                }
                ContentBlock::Text(_) | ContentBlock::Reasoning(_) => {}
            }
        }
        if let Some(text) = pending_text.take() {
            parts.push(json!({"text": text}));
        }
        canonical_json(&json!({"role": self.role.as_str(), "parts": parts}))
    }

    pub fn has_content(&self) -> bool {
        self.blocks.iter().any(|b| match b {
            ContentBlock::Text(t) | ContentBlock::Reasoning(t) => !t.is_empty(),
            ContentBlock::ToolCall(_) | ContentBlock::ToolResult(_) => true,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestView {
    pub system: Option<String>,
    pub messages: Vec<NormalizedMessage>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl Usage {
    pub fn from_value(value: &Value) -> Self {
        let pick = |keys: &[&str]| -> u64 {
            keys.iter()
                .find_map(|k| value.pointer(k).and_then(Value::as_u64))
                .unwrap_or(0)
        };
        Self {
            input_tokens: pick(&["/input_tokens", "/prompt_tokens"]),
            output_tokens: pick(&["/output_tokens", "/completion_tokens"]),
            cache_read_tokens: pick(&[
                "/cache_read_input_tokens",
                "/prompt_tokens_details/cached_tokens",
            ]),
            cache_creation_tokens: pick(&["/cache_creation_input_tokens"]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseView {
    /// Output blocks in wire order. The history replay of this response
    /// keeps the same order, so both produce the same fingerprint key.
    pub blocks: Vec<ContentBlock>,
    pub text: String,
    pub reasoning: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

impl ResponseView {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.reasoning.is_empty() && self.tool_calls.is_empty()
    }

    /// The response as it would appear in the next request's history.
    pub fn to_message(&self) -> NormalizedMessage {
        NormalizedMessage {
            role: Role::Assistant,
            blocks: self.blocks.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCall {
    pub request: RequestView,
    pub response: ResponseView,
}

pub fn normalize_record(record: &RawCallRecord) -> NormalizedCall {
    let mut response = normalize_response(&record.response);
    let usage = Usage::from_value(&record.usage);
    if usage != Usage::default() {
        response.usage = usage;
    }
    NormalizedCall {
        request: normalize_request(&record.request),
        response,
    }
}

pub fn normalize_request(request: &Value) -> RequestView {
    let mut system_parts: Vec<String> = Vec::new();
    if let Some(system) = request.get("system") {
        let text = blocks_text(&parse_content(system));
        if !text.is_empty() {
            system_parts.push(text);
        }
    }

    let mut messages = Vec::new();
    let mut leading = true;
    for raw in request
        .get("messages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
    {
        let Some(message) = normalize_message(raw) else {
            continue;
        };
        if leading && message.role == Role::System {
            let text = message.text();
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }
        leading = false;
        messages.push(message);
    }

    RequestView {
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n"))
        },
        messages,
        tools: normalize_tools(request.get("tools")),
    }
}

pub fn normalize_response(response: &Value) -> ResponseView {
    if let Some(choice) = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        let message = choice.get("message").or_else(|| choice.get("delta"));
        let mut view = match message.and_then(normalize_message) {
            Some(msg) => view_from_blocks(msg.blocks),
            None => ResponseView::default(),
        };
        view.finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        view.usage = Usage::from_value(response.get("usage").unwrap_or(&Value::Null));
        return view;
    }

    let mut blocks = Vec::new();
    if let Some(reasoning) = response.get("reasoning_content").and_then(Value::as_str) {
        if !reasoning.is_empty() {
            blocks.push(ContentBlock::Reasoning(reasoning.to_string()));
        }
    }
    blocks.extend(parse_content(response.get("content").unwrap_or(&Value::Null)));
    if !blocks.iter().any(|b| matches!(b, ContentBlock::Reasoning(_))) {
        for block in response
            .get("thinking_blocks")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
        {
            let text = block
                .as_str()
                .or_else(|| block.get("thinking").and_then(Value::as_str))
                .unwrap_or("");
            if !text.is_empty() {
                blocks.push(ContentBlock::Reasoning(text.to_string()));
            }
        }
    }
    if !blocks.iter().any(|b| matches!(b, ContentBlock::ToolCall(_))) {
        blocks.extend(parse_openai_tool_calls(response.get("tool_calls")));
    }

    let mut view = view_from_blocks(blocks);
    view.finish_reason = response
        .get("finish_reason")
        .or_else(|| response.get("stop_reason"))
        .and_then(Value::as_str)
        .map(str::to_string);
    view.usage = Usage::from_value(response.get("usage").unwrap_or(&Value::Null));
    view
}

fn view_from_blocks(blocks: Vec<ContentBlock>) -> ResponseView {
    let mut view = ResponseView::default();
    let mut texts = Vec::new();
    for block in blocks {
        match &block {
            ContentBlock::Text(t) => texts.push(t.clone()),
            ContentBlock::Reasoning(r) => view.reasoning.push(r.clone()),
            ContentBlock::ToolCall(call) => view.tool_calls.push(call.clone()),
            ContentBlock::ToolResult(_) => continue,
        }
        view.blocks.push(block);
    }
    view.text = texts.join("\n");
    view
}

fn normalize_message(raw: &Value) -> Option<NormalizedMessage> {
    let role = Role::parse(raw.get("role")?.as_str()?)?;
    let mut blocks = Vec::new();

    if role == Role::Tool {
        blocks.push(ContentBlock::ToolResult(ToolResult {
            call_id: raw
                .get("tool_call_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            name: raw.get("name").and_then(Value::as_str).map(str::to_string),
            content: flatten_result_content(raw.get("content").unwrap_or(&Value::Null)),
            is_error: false,
        }));
        return Some(NormalizedMessage { role, blocks });
    }

    if let Some(reasoning) = raw.get("reasoning_content").and_then(Value::as_str) {
        if !reasoning.is_empty() {
            blocks.push(ContentBlock::Reasoning(reasoning.to_string()));
        }
    }
    blocks.extend(parse_content(raw.get("content").unwrap_or(&Value::Null)));
    if role == Role::Assistant {
        blocks.extend(parse_openai_tool_calls(raw.get("tool_calls")));
        if let Some(call) = raw.get("function_call") {
            blocks.extend(parse_openai_tool_calls(Some(&json!([{"function": call}]))));
        }
    }
    Some(NormalizedMessage { role, blocks })
}

fn parse_content(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::String(s) if !s.is_empty() => vec![ContentBlock::Text(s.clone())],
        Value::Array(items) => items.iter().filter_map(parse_block).collect(),
        Value::Object(_) => parse_block(content).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn parse_block(block: &Value) -> Option<ContentBlock> {
    if let Some(s) = block.as_str() {
        return (!s.is_empty()).then(|| ContentBlock::Text(s.to_string()));
    }
    let kind = block.get("type").and_then(Value::as_str).unwrap_or("text");
    match kind {
        "text" | "input_text" | "output_text" => {
            let text = block.get("text").and_then(Value::as_str)?;
            (!text.is_empty()).then(|| ContentBlock::Text(text.to_string()))
        }
        "thinking" => {
            let text = block.get("thinking").and_then(Value::as_str)?;
            Some(ContentBlock::Reasoning(text.to_string()))
        }
        "tool_use" => Some(ContentBlock::ToolCall(ToolCall {
            id: block.get("id").and_then(Value::as_str).map(str::to_string),
            name: block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            arguments: parse_arguments(block.get("input").unwrap_or(&Value::Null)),
        })),
        "tool_result" => Some(ContentBlock::ToolResult(ToolResult {
            call_id: block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            name: None,
            content: flatten_result_content(block.get("content").unwrap_or(&Value::Null)),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })),
        _ => None,
    }
}

fn parse_openai_tool_calls(raw: Option<&Value>) -> Vec<ContentBlock> {
    raw.and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
        .iter()
        .filter_map(|call| {
            let function = call.get("function").unwrap_or(call);
            let name = function.get("name").and_then(Value::as_str)?;
            let arguments = function
                .get("arguments")
                .or_else(|| function.get("input"))
                .unwrap_or(&Value::Null);
            Some(ContentBlock::ToolCall(ToolCall {
                id: call.get("id").and_then(Value::as_str).map(str::to_string),
                name: name.to_string(),
                arguments: parse_arguments(arguments),
            }))
        })
        .collect()
}

/// String arguments are decoded when they hold JSON so that a call replayed
/// in object form compares equal to the original string form.
fn parse_arguments(raw: &Value) -> Value {
    match raw {
        Value::Null => json!({}),
        Value::String(s) if s.trim().is_empty() => json!({}),
        Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        other => other.clone(),
    }
}

fn flatten_result_content(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let texts: Vec<String> = items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    other => other
                        .get("text")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect();
            if texts.is_empty() && !items.is_empty() {
                canonical_json(content)
            } else {
                texts.join("\n")
            }
        }
        other => canonical_json(other),
    }
}

fn blocks_text(blocks: &[ContentBlock]) -> String {
    let parts: Vec<&str> = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    parts.join("\n")
}

fn normalize_tools(raw: Option<&Value>) -> Vec<ToolSpec> {
    raw.and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
        .iter()
        .filter_map(|tool| {
            let (def, schema_key) = match tool.get("function") {
                Some(function) if tool.get("type").and_then(Value::as_str) == Some("function") => {
                    (function, "parameters")
                }
                _ => (tool, "input_schema"),
            };
            let name = def.get("name").and_then(Value::as_str)?;
            if name.is_empty() {
                return None;
            }
            let parameters = def
                .get(schema_key)
                .or_else(|| def.get("parameters"))
                .cloned()
                .unwrap_or_else(|| json!({}));
            Some(ToolSpec {
                name: name.to_string(),
                description: def
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                parameters,
            })
        })
        .collect()
}

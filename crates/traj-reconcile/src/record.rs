//! Raw call records as the proxy writes them.
//!
//! Two on-disk shapes exist. The *flat* shape carries `request`/`response`
//! objects directly; the *proxy-native* shape wraps Anthropic-style bodies in
//! `request_body`/`response_body` (sometimes JSON-encoded as strings) and keys
//! the instance by `session_id`. Both are tagged here and reduced to one
//! struct; nothing past this module looks at the raw shape again.

use crate::error::ReconcileError;
use chrono::DateTime;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    Flat,
    ProxyNative,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawCallRecord {
    /// Zero-based write position within the instance's source.
    pub seq: usize,
    /// One-based line number in the file it came from.
    pub line: usize,
    pub shape: RecordShape,
    pub instance_id: Option<String>,
    pub timestamp_ms: Option<i64>,
    pub success: bool,
    pub model: String,
    pub biz_id: Option<String>,
    pub max_tokens: Option<u64>,
    pub request: Value,
    pub response: Value,
    pub usage: Value,
}

impl RawCallRecord {
    pub fn model_is_excluded(&self, exclude_models: &[String]) -> bool {
        if self.model.is_empty() {
            return false;
        }
        let model = self.model.to_lowercase();
        exclude_models
            .iter()
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .any(|m| model.contains(&m))
    }
}

pub fn parse_record_line(raw: &str, seq: usize, line: usize) -> Result<RawCallRecord, ReconcileError> {
    let parse_err = |message: String| ReconcileError::RecordParse { line, message };
    let value: Value = serde_json::from_str(raw).map_err(|e| parse_err(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| parse_err("record is not a JSON object".to_string()))?;

    let (shape, request, response) = if let Some(body) = obj.get("request_body") {
        let request = decode_body(body).map_err(|e| parse_err(format!("request_body: {}", e)))?;
        let response = match obj.get("response_body") {
            Some(body) => decode_body(body).map_err(|e| parse_err(format!("response_body: {}", e)))?,
            None => Value::Object(Map::new()),
        };
        (RecordShape::ProxyNative, request, response)
    } else if let Some(request) = obj.get("request") {
        let response = obj
            .get("response")
            .cloned()
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| Value::Object(Map::new()));
        (RecordShape::Flat, request.clone(), response)
    } else {
        return Err(parse_err(
            "record has neither `request` nor `request_body`".to_string(),
        ));
    };
    if !request.is_object() {
        return Err(parse_err("request payload is not an object".to_string()));
    }

    let instance_id = string_field(obj, "instance_id").or_else(|| string_field(obj, "session_id"));
    let timestamp_ms = obj
        .get("timestamp")
        .or_else(|| obj.get("request_time"))
        .and_then(timestamp_millis);
    let success = match obj.get("success").and_then(Value::as_bool) {
        Some(flag) => flag,
        None => !response_carries_error(&response),
    };
    let model = string_field(obj, "model")
        .or_else(|| request.get("model").and_then(Value::as_str).map(str::to_string))
        .or_else(|| {
            obj.get("meta")
                .and_then(|m| m.get("model"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();
    let max_tokens = obj
        .get("max_tokens")
        .and_then(Value::as_u64)
        .or_else(|| request.get("max_tokens").and_then(Value::as_u64));
    let usage = obj
        .get("usage")
        .or_else(|| response.get("usage"))
        .cloned()
        .unwrap_or(Value::Null);

    Ok(RawCallRecord {
        seq,
        line,
        shape,
        instance_id,
        timestamp_ms,
        success,
        model,
        biz_id: string_field(obj, "biz_id"),
        max_tokens,
        request,
        response,
        usage,
    })
}

/// Timestamps used for ordering. A record without a usable timestamp
/// inherits the previous record's, so it stays in write order.
pub fn effective_timestamps(records: &[RawCallRecord]) -> Vec<i64> {
    let mut last = i64::MIN;
    records
        .iter()
        .map(|r| {
            if let Some(ts) = r.timestamp_ms {
                last = ts;
            }
            last
        })
        .collect()
}

fn decode_body(body: &Value) -> Result<Value, String> {
    match body {
        Value::String(raw) => serde_json::from_str(raw).map_err(|e| e.to_string()),
        Value::Null => Ok(Value::Object(Map::new())),
        other => Ok(other.clone()),
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(ms) = trimmed.parse::<i64>() {
                return Some(ms);
            }
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }
        _ => None,
    }
}

fn response_carries_error(response: &Value) -> bool {
    response.get("error").map(|e| !e.is_null()).unwrap_or(false)
        || response.get("type").and_then(Value::as_str) == Some("error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_record() {
        let line = json!({
            "instance_id": "case-1",
            "timestamp": "2026-02-22T00:00:01Z",
            "success": false,
            "model": "MiniMax-M2.1",
            "request": {"messages": [{"role": "user", "content": "hi"}]},
            "response": {"content": "hello", "finish_reason": "stop"},
            "usage": {"prompt_tokens": 3}
        })
        .to_string();
        let record = parse_record_line(&line, 4, 5).expect("flat record");
        assert_eq!(record.shape, RecordShape::Flat);
        assert_eq!(record.instance_id.as_deref(), Some("case-1"));
        assert_eq!(record.timestamp_ms, Some(1_771_718_401_000));
        assert!(!record.success);
        assert_eq!(record.model, "MiniMax-M2.1");
        assert_eq!(record.usage["prompt_tokens"], 3);
        assert_eq!((record.seq, record.line), (4, 5));
    }

    #[test]
    fn parses_proxy_native_record_with_string_bodies() {
        let request_body = json!({
            "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}],
            "system": "be brief",
            "model": "claude-sonnet",
            "max_tokens": 8192
        });
        let line = json!({
            "session_id": "case-2",
            "biz_id": "bench",
            "request_time": 1700000000123_i64,
            "request_body": request_body.to_string(),
            "response_body": {"content": [{"type": "text", "text": "hello"}]}
        })
        .to_string();
        let record = parse_record_line(&line, 0, 1).expect("native record");
        assert_eq!(record.shape, RecordShape::ProxyNative);
        assert_eq!(record.instance_id.as_deref(), Some("case-2"));
        assert_eq!(record.timestamp_ms, Some(1_700_000_000_123));
        assert!(record.success);
        assert_eq!(record.model, "claude-sonnet");
        assert_eq!(record.max_tokens, Some(8192));
        assert_eq!(record.biz_id.as_deref(), Some("bench"));
        assert_eq!(record.request["system"], "be brief");
    }

    #[test]
    fn error_response_marks_attempt_unsuccessful() {
        let line = json!({
            "session_id": "case-3",
            "request_body": {"messages": []},
            "response_body": {"type": "error", "error": {"type": "overloaded_error"}}
        })
        .to_string();
        let record = parse_record_line(&line, 0, 1).expect("record");
        assert!(!record.success);
        assert_eq!(record.timestamp_ms, None);
    }

    #[test]
    fn rejects_truncated_and_shapeless_lines() {
        let err = parse_record_line("{\"session_id\": \"x\", \"request_bo", 0, 7)
            .expect_err("truncated line");
        assert!(matches!(err, ReconcileError::RecordParse { line: 7, .. }));

        let err = parse_record_line("{\"session_id\": \"x\"}", 0, 8).expect_err("no payload");
        assert!(err.to_string().contains("neither"));

        let err = parse_record_line("[1,2]", 0, 9).expect_err("not an object");
        assert!(err.to_string().contains("not a JSON object"));
    }

    #[test]
    fn missing_timestamps_inherit_previous_value() {
        let mk = |ts: Option<i64>| RawCallRecord {
            seq: 0,
            line: 1,
            shape: RecordShape::Flat,
            instance_id: None,
            timestamp_ms: ts,
            success: true,
            model: String::new(),
            biz_id: None,
            max_tokens: None,
            request: json!({}),
            response: json!({}),
            usage: Value::Null,
        };
        let records = vec![mk(None), mk(Some(10)), mk(None), mk(Some(5))];
        assert_eq!(effective_timestamps(&records), vec![i64::MIN, 10, 10, 5]);
    }

    #[test]
    fn model_exclusion_is_case_insensitive_substring() {
        let line = json!({"model": "claude-3-5-Haiku-2024", "request": {}}).to_string();
        let record = parse_record_line(&line, 0, 1).expect("record");
        assert!(record.model_is_excluded(&["haiku".to_string()]));
        assert!(!record.model_is_excluded(&["opus".to_string(), " ".to_string()]));
    }
}

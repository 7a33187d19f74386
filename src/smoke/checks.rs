//! Assertions over Responses API payloads.

use anyhow::{bail, Context};
use serde_json::Value;

/// Text of a Responses API result.
///
/// Uses a top-level `output_text` string when the gateway provides one,
/// otherwise concatenates every `output_text` content part of `output`.
pub fn output_text(response: &Value) -> String {
    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        return text.to_string();
    }
    let Some(items) = response.get("output").and_then(Value::as_array) else {
        return String::new();
    };
    items
        .iter()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}

/// Remove a surrounding markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let Some((_, body)) = trimmed.split_once('\n') else {
        return trimmed;
    };
    match body.rsplit_once("```") {
        Some((inner, _)) => inner.trim(),
        None => body.trim(),
    }
}

/// Text deltas carried by one SSE `data:` payload.
pub fn event_delta(payload: &str) -> Option<String> {
    let event: Value = serde_json::from_str(payload).ok()?;
    event.get("delta").and_then(Value::as_str).map(String::from)
}

pub fn expect_text(response: &Value) -> anyhow::Result<String> {
    let text = output_text(response);
    if text.trim().is_empty() {
        bail!("output_text should not be empty");
    }
    Ok(text)
}

fn output_items(response: &Value) -> &[Value] {
    response
        .get("output")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

pub fn expect_output(response: &Value) -> anyhow::Result<()> {
    if output_items(response).is_empty() {
        bail!("output should not be empty");
    }
    Ok(())
}

/// Some `output` item must be a `function_call` to `name`.
pub fn expect_function_call(response: &Value, name: &str) -> anyhow::Result<()> {
    let called = output_items(response).iter().any(|item| {
        item.get("type").and_then(Value::as_str) == Some("function_call")
            && item.get("name").and_then(Value::as_str) == Some(name)
    });
    if !called {
        bail!("output should contain a '{name}' function_call");
    }
    Ok(())
}

pub fn expect_json_text(response: &Value) -> anyhow::Result<Value> {
    let text = expect_text(response)?;
    let parsed: Value = serde_json::from_str(strip_code_fence(&text))
        .with_context(|| format!("output is not valid JSON: {}", crate::utils::truncate_chars(&text, 80)))?;
    if !(parsed.is_object() || parsed.is_array()) {
        bail!("expected a JSON object or array");
    }
    Ok(parsed)
}

/// The output text is a JSON object where every field is present and
/// neither null, false, zero nor an empty string.
pub fn expect_fields(response: &Value, fields: &[&str]) -> anyhow::Result<()> {
    let parsed = expect_json_text(response)?;
    for field in fields {
        let present = match parsed.get(*field) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64() != Some(0.0),
            Some(_) => true,
        };
        if !present {
            bail!("should have '{field}' field");
        }
    }
    Ok(())
}

pub fn expect_mentions(response: &Value, needle: &str) -> anyhow::Result<()> {
    let text = expect_text(response)?;
    if !text.to_lowercase().contains(&needle.to_lowercase()) {
        bail!("output should mention '{needle}'");
    }
    Ok(())
}

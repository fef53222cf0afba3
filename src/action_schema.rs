use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::schema::{Action, ActionKind, ActionProvenance};

/// Coordinates synthesized for click actions the model emitted without any.
/// Rejecting those outright loses more steps than a mid-screen guess does.
const DEFAULT_CLICK: (i32, i32) = (300, 200);

static THINK_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid regex"));
static FENCED_JSON_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid regex"));
static FENCED_ANY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```\s*(.*?)\s*```").expect("valid regex"));

/// What one model reply resolved to. Besides executable actions the model
/// may ask for a fresh look at the screen or declare the objective done;
/// both are directives for the resolver, not dispatchable operations.
#[derive(Debug, Clone)]
pub enum ParsedDirective {
    Act(Action),
    RefreshContext { reason: String },
    Done { summary: String },
}

pub fn strip_think_tags(text: &str) -> String {
    THINK_TAG_RE.replace_all(text, "").trim().to_string()
}

/// Fallback ladder for locating the JSON payload in free text:
/// fenced ```json block, then any fenced block that looks like JSON, then
/// the first balanced object, then the first balanced array. The balanced
/// scan is quote-aware so nested braces inside strings don't truncate it.
pub fn extract_json_payload(text: &str) -> Option<String> {
    if let Some(caps) = FENCED_JSON_RE.captures(text) {
        return Some(caps[1].trim().to_string());
    }
    if let Some(caps) = FENCED_ANY_RE.captures(text) {
        let inner = caps[1].trim();
        if inner.starts_with('{') || inner.starts_with('[') {
            return Some(inner.to_string());
        }
    }
    if let Some(slice) = balanced_slice(text, '{', '}') {
        return Some(slice.to_string());
    }
    if let Some(slice) = balanced_slice(text, '[', ']') {
        return Some(slice.to_string());
    }
    None
}

fn balanced_slice(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..start + i + c.len_utf8()]);
            }
        }
    }
    None
}

/// Full pipeline: strip think tags, locate the JSON payload, parse it, and
/// normalize the result into a typed directive. An array payload means the
/// model returned a batch; only the first entry is taken.
pub fn parse_action_response(raw: &str) -> Result<ParsedDirective, String> {
    let cleaned = strip_think_tags(raw);
    let payload = extract_json_payload(&cleaned)
        .ok_or_else(|| "no JSON object or array found in model response".to_string())?;

    let value: Value = serde_json::from_str(&payload)
        .map_err(|e| format!("payload is not valid JSON: {}", e))?;

    let value = match value {
        Value::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| "model returned an empty action array".to_string())?,
        other => other,
    };

    normalize_action(&value)
}

/// Normalize one loosely-shaped action object into the closed union,
/// folding the legacy field-name aliases (`action_type`, `operation`,
/// `summary`, nested coordinate objects, ...) the model variants emit.
pub fn normalize_action(plan: &Value) -> Result<ParsedDirective, String> {
    let mut value = plan.clone();

    // Some models wrap the payload as {"action": {...}}.
    if value.get("action").map(|v| v.is_object()).unwrap_or(false) {
        value = value["action"].clone();
    }

    let obj = value
        .as_object()
        .ok_or_else(|| "action must be a JSON object".to_string())?;

    let raw_kind = get_string_any(obj, &["kind", "action_type", "operation", "action", "type"])
        .ok_or_else(|| "missing action kind field".to_string())?;

    let kind_name = normalize_kind_name(&raw_kind);
    let description = get_string_any(obj, &["description", "summary", "reason"])
        .unwrap_or_else(|| format!("{} action", kind_name));
    let confidence = extract_confidence(obj);

    match kind_name.as_str() {
        "refresh_context" => {
            return Ok(ParsedDirective::RefreshContext { reason: description });
        }
        "done" => {
            return Ok(ParsedDirective::Done { summary: description });
        }
        _ => {}
    }

    let kind = match kind_name.as_str() {
        "click" => {
            let (x, y) = extract_coordinates(obj).unwrap_or(DEFAULT_CLICK);
            ActionKind::Click { x, y }
        }
        "type" => {
            let text = get_string_any(obj, &["text", "text_to_type", "input_text", "message", "value"])
                .ok_or_else(|| "type action requires 'text'".to_string())?;
            ActionKind::Type { text }
        }
        "key" => {
            let key = get_string_any(obj, &["key", "button", "key_press"])
                .ok_or_else(|| "key action requires 'key'".to_string())?;
            if key.contains('+') {
                ActionKind::KeySequence { keys: key }
            } else {
                ActionKind::Key { key }
            }
        }
        "key_sequence" => {
            let keys = extract_key_sequence(obj)
                .ok_or_else(|| "key_sequence action requires 'keys'".to_string())?;
            ActionKind::KeySequence { keys }
        }
        "scroll" => ActionKind::Scroll { amount: extract_scroll_amount(obj) },
        other => ActionKind::Unrecognized { raw_kind: other.to_string() },
    };

    Ok(ParsedDirective::Act(Action {
        kind,
        description,
        confidence,
        provenance: ActionProvenance::Model,
    }))
}

fn normalize_kind_name(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    match lower.as_str() {
        "click" | "mouse" | "mouse_click" | "left_click" | "click_visual" | "click_text" => "click",
        "type" | "write" | "text_entry" | "input" => "type",
        "key" | "press" | "key_press" => "key",
        "key_sequence" | "hotkey" | "shortcut" | "combo" => "key_sequence",
        "scroll" | "wheel" => "scroll",
        "take_screenshot" | "screenshot" | "refresh" | "refresh_context" => "refresh_context",
        "done" | "finish" | "complete" => "done",
        other => return other.to_string(),
    }
    .to_string()
}

fn get_string_any(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(val) = obj.get(*key).and_then(|v| v.as_str()) {
            let trimmed = val.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn number_from(value: &Value) -> Option<i32> {
    if let Some(n) = value.as_i64() {
        return Some(n as i32);
    }
    if let Some(f) = value.as_f64() {
        return Some(f.round() as i32);
    }
    value.as_str().and_then(|s| s.trim().parse::<i32>().ok())
}

/// Click coordinates are accepted as a nested pair object, a 2-element
/// sequence, a "x y" string, or flat x/y fields; only the total absence of
/// two numeric values fails over to the synthesized default.
fn extract_coordinates(obj: &Map<String, Value>) -> Option<(i32, i32)> {
    for key in ["coordinate", "coordinates", "coords", "position", "location"] {
        match obj.get(key) {
            Some(Value::Object(coord)) => {
                let x = coord.get("x").or_else(|| coord.get("x_coord")).and_then(number_from);
                let y = coord.get("y").or_else(|| coord.get("y_coord")).and_then(number_from);
                if let (Some(x), Some(y)) = (x, y) {
                    return Some((x, y));
                }
            }
            Some(Value::Array(items)) if items.len() == 2 => {
                if let (Some(x), Some(y)) = (number_from(&items[0]), number_from(&items[1])) {
                    return Some((x, y));
                }
            }
            Some(Value::String(s)) => {
                let parts: Vec<&str> = s.split_whitespace().collect();
                if parts.len() == 2 {
                    if let (Ok(x), Ok(y)) = (parts[0].parse(), parts[1].parse()) {
                        return Some((x, y));
                    }
                }
            }
            _ => {}
        }
    }

    let x = obj.get("x").or_else(|| obj.get("x_coord")).and_then(number_from);
    let y = obj.get("y").or_else(|| obj.get("y_coord")).and_then(number_from);
    if let (Some(x), Some(y)) = (x, y) {
        return Some((x, y));
    }
    None
}

fn extract_key_sequence(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("keys") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Array(items)) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("+"))
            }
        }
        _ => get_string_any(obj, &["key"]),
    }
}

fn extract_scroll_amount(obj: &Map<String, Value>) -> i32 {
    for key in ["amount", "clicks", "delta"] {
        if let Some(n) = obj.get(key).and_then(number_from) {
            return n;
        }
    }
    match get_string_any(obj, &["direction"]).as_deref() {
        Some("up") => 3,
        _ => -3,
    }
}

fn extract_confidence(obj: &Map<String, Value>) -> u8 {
    match obj.get("confidence") {
        Some(v) => {
            if let Some(f) = v.as_f64() {
                // Some models report 0..1, others 0..100.
                let scaled = if f <= 1.0 { f * 100.0 } else { f };
                scaled.clamp(0.0, 100.0) as u8
            } else {
                70
            }
        }
        None => 70,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn act(raw: &str) -> Action {
        match parse_action_response(raw).unwrap() {
            ParsedDirective::Act(action) => action,
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn test_fenced_json_block() {
        let raw = "Here is the action:\n```json\n{\"kind\": \"key\", \"key\": \"enter\", \"description\": \"Press enter\"}\n```";
        let action = act(raw);
        assert_eq!(action.kind, ActionKind::Key { key: "enter".to_string() });
        assert_eq!(action.description, "Press enter");
    }

    #[test]
    fn test_balanced_braces_with_nested_object() {
        let raw = r#"I think we should {"kind": "click", "coordinate": {"x": 100, "y": 250}, "description": "Click {the} icon"} now"#;
        let action = act(raw);
        assert_eq!(action.kind, ActionKind::Click { x: 100, y: 250 });
    }

    #[test]
    fn test_braces_inside_strings_do_not_truncate() {
        let raw = r#"{"kind": "type", "text": "fn main() { println!(\"hi\"); }", "description": "Type code"}"#;
        let action = act(raw);
        assert_eq!(
            action.kind,
            ActionKind::Type { text: "fn main() { println!(\"hi\"); }".to_string() }
        );
    }

    #[test]
    fn test_array_payload_takes_first() {
        let raw = r#"```json
[{"operation": "press", "key": "win", "description": "Open start"}, {"operation": "write", "text": "chrome"}]
```"#;
        let action = act(raw);
        assert_eq!(action.kind, ActionKind::Key { key: "win".to_string() });
    }

    #[test]
    fn test_think_tags_stripped_before_extraction() {
        let raw = "<think>{\"not\": \"this one\"}</think>\n{\"kind\": \"scroll\", \"direction\": \"up\"}";
        let action = act(raw);
        assert_eq!(action.kind, ActionKind::Scroll { amount: 3 });
    }

    #[test]
    fn test_legacy_aliases() {
        let action = act(r#"{"action_type": "mouse", "x": 5, "y": 6}"#);
        assert_eq!(action.kind, ActionKind::Click { x: 5, y: 6 });

        let action = act(r#"{"operation": "write", "text_to_type": "hello"}"#);
        assert_eq!(action.kind, ActionKind::Type { text: "hello".to_string() });

        let action = act(r#"{"type": "hotkey", "keys": ["ctrl", "l"]}"#);
        assert_eq!(action.kind, ActionKind::KeySequence { keys: "ctrl+l".to_string() });
    }

    #[test]
    fn test_click_without_coordinates_synthesizes_default() {
        let action = act(r#"{"kind": "click", "description": "Click the chrome icon"}"#);
        assert_eq!(action.kind, ActionKind::Click { x: DEFAULT_CLICK.0, y: DEFAULT_CLICK.1 });
    }

    #[test]
    fn test_location_string_coordinates() {
        let action = act(r#"{"operation": "click", "location": "320 480"}"#);
        assert_eq!(action.kind, ActionKind::Click { x: 320, y: 480 });
    }

    #[test]
    fn test_key_with_plus_becomes_sequence() {
        let action = act(r#"{"kind": "key", "key": "win+d"}"#);
        assert_eq!(action.kind, ActionKind::KeySequence { keys: "win+d".to_string() });
    }

    #[test]
    fn test_confidence_scaling_and_default() {
        let action = act(r#"{"kind": "key", "key": "tab", "confidence": 0.85}"#);
        assert_eq!(action.confidence, 85);
        let action = act(r#"{"kind": "key", "key": "tab", "confidence": 90}"#);
        assert_eq!(action.confidence, 90);
        let action = act(r#"{"kind": "key", "key": "tab"}"#);
        assert_eq!(action.confidence, 70);
    }

    #[test]
    fn test_unknown_kind_is_kept_not_rejected() {
        let action = act(r#"{"kind": "hover", "description": "Hover over the menu"}"#);
        assert_eq!(action.kind, ActionKind::Unrecognized { raw_kind: "hover".to_string() });
    }

    #[test]
    fn test_refresh_and_done_directives() {
        let raw = r#"{"operation": "take_screenshot", "reason": "Need a fresh look"}"#;
        assert!(matches!(
            parse_action_response(raw).unwrap(),
            ParsedDirective::RefreshContext { .. }
        ));

        let raw = r#"{"operation": "done", "summary": "Chrome is open"}"#;
        match parse_action_response(raw).unwrap() {
            ParsedDirective::Done { summary } => assert_eq!(summary, "Chrome is open"),
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[test]
    fn test_non_json_text_fails() {
        assert!(parse_action_response("I would click the button in the corner.").is_err());
        assert!(parse_action_response("").is_err());
    }

    #[test]
    fn test_missing_kind_fails() {
        assert!(parse_action_response(r#"{"text": "hello"}"#).is_err());
    }
}

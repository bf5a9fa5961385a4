//! Payload sanitization and prompt budgeting.
//!
//! Context payloads originate in world-state objects that carry handles and
//! back-references; before anything crosses into the bridge worker it is
//! deep-copied with a bounded recursion depth and a deny-list of known
//! unserializable keys.  Prompts are budgeted by a cheap character-based
//! token estimate and truncated with an explicit marker rather than
//! rejected.

use serde_json::Value;

/// Keys stripped from every object during sanitization.  These are the
/// usual back-reference and live-handle fields that must never cross the
/// worker boundary.
pub const DENY_KEYS: &[&str] = &["__parent", "_client", "_socket", "_raw", "_listeners"];

/// Maximum object/array nesting preserved by [`sanitize_payload`].
pub const MAX_DEPTH: usize = 6;

/// Token budget for a single prompt.
pub const TOKEN_BUDGET: usize = 8000;

/// Character cap corresponding to [`TOKEN_BUDGET`] at the estimate ratio.
pub const CHAR_CAP: usize = 20_000;

/// Marker appended to every truncated prompt.
pub const TRUNCATION_MARKER: &str = "\n...[prompt truncated]";

/// Deep-copy `value`, dropping deny-listed keys and replacing anything
/// nested deeper than `max_depth` with a placeholder string.
pub fn sanitize_payload(value: &Value, max_depth: usize) -> Value {
    if max_depth == 0 {
        return Value::String("[depth limit]".to_string());
    }
    match value {
        Value::Object(map) => {
            let cleaned = map
                .iter()
                .filter(|(key, _)| !DENY_KEYS.contains(&key.as_str()))
                .map(|(key, v)| (key.clone(), sanitize_payload(v, max_depth - 1)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| sanitize_payload(v, max_depth - 1))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Rough token estimate: one token per 2.5 characters.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f64 / 2.5).ceil() as usize
}

/// Enforce the prompt budget.  Prompts over [`TOKEN_BUDGET`] estimated
/// tokens are cut at the nearest character boundary below [`CHAR_CAP`] and
/// tagged with [`TRUNCATION_MARKER`]; prompts within budget pass through
/// untouched.
pub fn enforce_budget(prompt: &str) -> String {
    if estimate_tokens(prompt) <= TOKEN_BUDGET {
        return prompt.to_string();
    }
    let mut cut = CHAR_CAP.min(prompt.len());
    while cut > 0 && !prompt.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = prompt[..cut].to_string();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deny_listed_keys_are_stripped() {
        let payload = json!({
            "position": {"x": 1, "y": 2},
            "_client": {"socket": "handle"},
            "__parent": "loop"
        });
        let clean = sanitize_payload(&payload, MAX_DEPTH);
        assert!(clean.get("position").is_some());
        assert!(clean.get("_client").is_none());
        assert!(clean.get("__parent").is_none());
    }

    #[test]
    fn deny_listed_keys_are_stripped_at_any_depth() {
        let payload = json!({"a": {"b": {"_raw": 1, "kept": 2}}});
        let clean = sanitize_payload(&payload, MAX_DEPTH);
        assert!(clean["a"]["b"].get("_raw").is_none());
        assert_eq!(clean["a"]["b"]["kept"], 2);
    }

    #[test]
    fn nesting_beyond_depth_is_replaced() {
        // Seven levels deep with MAX_DEPTH = 6.
        let payload = json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": 1}}}}}}});
        let clean = sanitize_payload(&payload, MAX_DEPTH);
        assert_eq!(
            clean["a"]["b"]["c"]["d"]["e"]["f"],
            Value::String("[depth limit]".to_string())
        );
    }

    #[test]
    fn scalars_pass_through() {
        assert_eq!(sanitize_payload(&json!(42), MAX_DEPTH), json!(42));
        assert_eq!(sanitize_payload(&json!("text"), MAX_DEPTH), json!("text"));
        assert_eq!(sanitize_payload(&json!(null), MAX_DEPTH), json!(null));
    }

    #[test]
    fn token_estimate_uses_char_ratio() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcde"), 2); // 5 / 2.5
        assert_eq!(estimate_tokens(&"x".repeat(25)), 10);
    }

    #[test]
    fn short_prompt_is_untouched() {
        let prompt = "what should I do next?";
        assert_eq!(enforce_budget(prompt), prompt);
    }

    #[test]
    fn oversized_prompt_is_truncated_with_marker() {
        let prompt = "x".repeat(30_000);
        let result = enforce_budget(&prompt);
        assert!(result.ends_with(TRUNCATION_MARKER));
        assert!(result.len() <= CHAR_CAP + TRUNCATION_MARKER.len());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // Multi-byte characters around the cap must not split.
        let prompt = "é".repeat(15_000); // 30 000 bytes
        let result = enforce_budget(&prompt);
        assert!(result.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn prompt_at_exact_budget_passes() {
        let prompt = "x".repeat(TOKEN_BUDGET * 5 / 2); // exactly 8000 tokens
        assert_eq!(enforce_budget(&prompt), prompt);
    }
}

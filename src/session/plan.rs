//! Plan-proposal interception
//!
//! A text block that is, or embeds, a JSON object tagged `"type":"plan"`
//! is not rendered literally: the plan payload becomes a structured
//! proposal and any surrounding prose still flows through as text.

use serde_json::Value;

/// Outcome of scanning one text block for an embedded plan
#[derive(Debug, Clone, PartialEq)]
pub struct PlanScan {
    pub plan: Option<Value>,
    /// Text remaining after the plan object was cut out
    pub text: String,
}

/// Scan a text block for a plan object. The first plan found wins.
pub fn extract_plan(text: &str) -> PlanScan {
    let trimmed = text.trim();

    // Fast path: the whole block is one JSON object
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if is_plan(&value) {
                return PlanScan {
                    plan: Some(value),
                    text: String::new(),
                };
            }
        }
    }

    // Embedded form: find a balanced object somewhere inside the prose
    let mut search_from = 0;
    while let Some(offset) = text.get(search_from..).and_then(|rest| rest.find('{')) {
        let start = search_from + offset;
        if let Some(end) = balanced_object_end(text, start) {
            if let Some(candidate) = text.get(start..end) {
                if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                    if is_plan(&value) {
                        let mut remaining = String::new();
                        remaining.push_str(text.get(..start).unwrap_or_default());
                        remaining.push_str(text.get(end..).unwrap_or_default());
                        return PlanScan {
                            plan: Some(value),
                            text: remaining.trim().to_string(),
                        };
                    }
                }
            }
            search_from = start + 1;
        } else {
            break;
        }
    }

    PlanScan {
        plan: None,
        text: text.to_string(),
    }
}

fn is_plan(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("plan")
}

/// Byte offset one past the `}` matching the `{` at `start`, honoring
/// string literals and escapes.
fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0u32;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.get(start..)?.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

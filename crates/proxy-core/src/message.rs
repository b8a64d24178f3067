use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One OpenAI-style chat message. `content` is coerced to a trimmed string
/// at construction time (§3: "non-string content is coerced to a trimmed
/// string") so downstream fingerprinting never has to branch on shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(deserialize_with = "deserialize_content")]
    pub content: String,
}

fn deserialize_content<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(coerce_content(&value))
}

/// Coerce arbitrary JSON content (string, array of parts, object, null) into
/// a trimmed string, the way the fingerprinter's canonicalization requires.
pub fn coerce_content(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        Value::Array(parts) => parts
            .iter()
            .map(|p| match p.get("text").and_then(Value::as_str) {
                Some(t) => t.to_string(),
                None => p.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string(),
        other => other.to_string().trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_string_content() {
        assert_eq!(coerce_content(&serde_json::json!("  hi  ")), "hi");
    }

    #[test]
    fn coerces_null_content() {
        assert_eq!(coerce_content(&Value::Null), "");
    }

    #[test]
    fn coerces_array_of_text_parts() {
        let v = serde_json::json!([{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]);
        assert_eq!(coerce_content(&v), "a b");
    }
}

//! Tool-result sanitisation and media pseudo-URL extraction.
//!
//! Tool results can be arbitrarily large and may embed raw image bytes; both
//! are bounded here before anything leaves the core. The agent references
//! outbound media with pseudo-URLs (`MEDIA:<url>` lines, `attachment://`
//! tokens) which are stripped from block text and returned separately.

use serde_json::Value;

/// Text payloads longer than this are truncated.
pub const MAX_TOOL_TEXT: usize = 8000;
const TRUNCATION_SUFFIX: &str = "…(truncated)…";

/// Sanitise a tool result for external consumers.
///
/// - Strings longer than [`MAX_TOOL_TEXT`] chars are truncated with a suffix.
/// - Image content blocks have their raw bytes replaced by
///   `{"bytes": <len>, "omitted": true}`; base64 images never leave the core.
pub fn sanitize_tool_result(result: &Value) -> Value {
    match result {
        Value::String(s) => Value::String(truncate_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_tool_result).collect()),
        Value::Object(map) => {
            if is_image_block(map) {
                let mut out = map.clone();
                for field in ["data", "bytes", "source"] {
                    if let Some(v) = out.get(field) {
                        let len = payload_len(v);
                        out.insert(
                            field.to_string(),
                            serde_json::json!({ "bytes": len, "omitted": true }),
                        );
                    }
                }
                return Value::Object(out);
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), sanitize_tool_result(v)))
                    .collect(),
            )
        }
        other => other.clone(),
    }
}

fn is_image_block(map: &serde_json::Map<String, Value>) -> bool {
    map.get("type").and_then(Value::as_str) == Some("image")
}

fn payload_len(v: &Value) -> usize {
    match v {
        Value::String(s) => s.len(),
        Value::Object(o) => o
            .get("data")
            .and_then(Value::as_str)
            .map(str::len)
            .unwrap_or(0),
        _ => 0,
    }
}

fn truncate_text(s: &str) -> String {
    if s.chars().count() <= MAX_TOOL_TEXT {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .nth(MAX_TOOL_TEXT)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    format!("{}{}", &s[..cut], TRUNCATION_SUFFIX)
}

/// Strip media pseudo-URLs from a block chunk.
///
/// Recognised forms:
/// - a line consisting of `MEDIA:<url>`
/// - an inline `attachment://…` token
///
/// Returns the cleaned text and the extracted URLs in order of appearance.
pub fn extract_media(text: &str) -> (String, Vec<String>) {
    let mut urls = Vec::new();
    let mut lines = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(url) = trimmed.strip_prefix("MEDIA:") {
            let url = url.trim();
            if !url.is_empty() {
                urls.push(url.to_string());
            }
            continue;
        }
        if line.contains("attachment://") {
            let mut cleaned = String::new();
            for token in line.split_whitespace() {
                if let Some(rest) = token.strip_prefix("attachment://") {
                    urls.push(format!("attachment://{}", rest.trim_end_matches(&[',', '.', ')'][..])));
                } else {
                    if !cleaned.is_empty() {
                        cleaned.push(' ');
                    }
                    cleaned.push_str(token);
                }
            }
            if !cleaned.is_empty() {
                lines.push(cleaned);
            }
            continue;
        }
        lines.push(line.to_string());
    }
    (lines.join("\n").trim().to_string(), urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn long_text_truncated_with_suffix() {
        let long = "x".repeat(MAX_TOOL_TEXT + 100);
        let out = sanitize_tool_result(&json!(long));
        let s = out.as_str().unwrap();
        assert!(s.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(s.chars().count(), MAX_TOOL_TEXT + TRUNCATION_SUFFIX.chars().count());
    }

    #[test]
    fn short_text_unchanged() {
        let out = sanitize_tool_result(&json!("short"));
        assert_eq!(out, json!("short"));
    }

    #[test]
    fn image_bytes_omitted() {
        let result = json!({
            "type": "image",
            "data": "aGVsbG8gd29ybGQ=",
            "mime": "image/png"
        });
        let out = sanitize_tool_result(&result);
        assert_eq!(out["data"]["omitted"], json!(true));
        assert_eq!(out["data"]["bytes"], json!(16));
        assert_eq!(out["mime"], json!("image/png"));
    }

    #[test]
    fn nested_results_sanitised() {
        let long = "y".repeat(MAX_TOOL_TEXT + 1);
        let result = json!({"content": [{"type": "text", "text": long}]});
        let out = sanitize_tool_result(&result);
        assert!(out["content"][0]["text"]
            .as_str()
            .unwrap()
            .ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn media_lines_extracted() {
        let (text, urls) = extract_media("Here you go.\nMEDIA:https://example.com/pic.jpg\nEnjoy!");
        assert_eq!(text, "Here you go.\nEnjoy!");
        assert_eq!(urls, vec!["https://example.com/pic.jpg"]);
    }

    #[test]
    fn attachment_tokens_extracted_inline() {
        let (text, urls) = extract_media("see attachment://out/plot.png for the chart");
        assert_eq!(text, "see for the chart");
        assert_eq!(urls, vec!["attachment://out/plot.png"]);
    }

    #[test]
    fn text_without_media_untouched() {
        let (text, urls) = extract_media("plain answer");
        assert_eq!(text, "plain answer");
        assert!(urls.is_empty());
    }
}
